//! Sequential access to the update image on the medium.

use embedded_io_async::{ErrorType, Read, Seek, SeekFrom};

use crate::{
    Error,
    hash::{HashError, Hasher},
};

pub(crate) fn read_error<E: embedded_io_async::Error>(e: E) -> Error {
    Error::Read(e.kind())
}

/// Read until `buf` is full or the image ends, returning the number of bytes read.
///
/// Short reads from the medium are retried, so a partially filled buffer always means end of image.
pub async fn fill<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]).await.map_err(read_error)? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Fail if the image has more bytes than the `expected` already consumed.
pub async fn expect_end<R: Read>(source: &mut R, expected: u32) -> Result<(), Error> {
    let mut probe = [0u8; 1];
    match fill(source, &mut probe).await? {
        0 => Ok(()),
        _ => Err(Error::SourceOverrun { expected }),
    }
}

/// Size of the image, leaving it positioned at its start.
pub async fn image_len<R: Seek>(image: &mut R) -> Result<u32, Error> {
    let end = image.seek(SeekFrom::End(0)).await.map_err(read_error)?;
    rewind(image).await?;
    u32::try_from(end).map_err(|_| Error::ImageTooLarge {
        size: end,
        available: u32::MAX,
    })
}

pub async fn rewind<R: Seek>(image: &mut R) -> Result<(), Error> {
    image.seek(SeekFrom::Start(0)).await.map_err(read_error)?;
    Ok(())
}

/// Reader that hashes every byte passing through it.
pub struct Fingerprinting<'a, R, H> {
    source: &'a mut R,
    hasher: &'a mut H,
    failure: Option<HashError>,
}

impl<'a, R: Read, H: Hasher> Fingerprinting<'a, R, H> {
    /// The session of `hasher` has to be started already.
    pub fn new(source: &'a mut R, hasher: &'a mut H) -> Self {
        Fingerprinting {
            source,
            hasher,
            failure: None,
        }
    }

    /// Report the first error of the hasher, if any.
    pub fn finish(self) -> Result<(), HashError> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<R: ErrorType, H> ErrorType for Fingerprinting<'_, R, H> {
    type Error = R::Error;
}

impl<R: Read, H: Hasher> Read for Fingerprinting<'_, R, H> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = self.source.read(buf).await?;
        if self.failure.is_none() {
            if let Err(e) = self.hasher.push(&buf[..n]) {
                self.failure = Some(e);
            }
        }
        Ok(n)
    }
}
