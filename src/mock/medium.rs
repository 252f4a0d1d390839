use std::vec::Vec;

use embedded_io_async::{ErrorKind, ErrorType, Read, Seek, SeekFrom};

use crate::sequence::UpdateMedium;

/// Update image held in memory.
#[derive(Clone, Debug)]
pub struct MockImage {
    data: Vec<u8>,
    position: usize,
    /// Most bytes handed out per read.
    read_limit: usize,
    /// Reading at this offset fails.
    fail_at: Option<usize>,
    /// Byte flipped on the given rewind to the start.
    tamper: Option<(usize, usize)>,
    rewinds: usize,
}

impl MockImage {
    pub fn new(data: Vec<u8>) -> Self {
        MockImage {
            data,
            position: 0,
            read_limit: usize::MAX,
            fail_at: None,
            tamper: None,
            rewinds: 0,
        }
    }

    pub fn with_read_limit(self, read_limit: usize) -> Self {
        MockImage { read_limit, ..self }
    }

    pub fn with_failure_at(self, offset: usize) -> Self {
        MockImage {
            fail_at: Some(offset),
            ..self
        }
    }

    /// Change the byte at `offset` on rewind number `rewind`.
    pub fn with_tamper(self, rewind: usize, offset: usize) -> Self {
        MockImage {
            tamper: Some((rewind, offset)),
            ..self
        }
    }
}

impl ErrorType for MockImage {
    type Error = ErrorKind;
}

impl Read for MockImage {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.fail_at == Some(self.position) {
            return Err(ErrorKind::Other);
        }

        let mut end = self.data.len().min(self.position.saturating_add(self.read_limit));
        if let Some(fail_at) = self.fail_at.filter(|&fail_at| fail_at > self.position) {
            end = end.min(fail_at);
        }
        let n = end.saturating_sub(self.position).min(buf.len());

        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl Seek for MockImage {
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, Self::Error> {
        let position = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.data.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if position < 0 {
            return Err(ErrorKind::InvalidInput);
        }

        if position == 0 {
            self.rewinds += 1;
            if let Some((rewind, offset)) = self.tamper {
                if rewind == self.rewinds {
                    self.data[offset] ^= 0xFF;
                }
            }
        }

        self.position = position as usize;
        Ok(position as u64)
    }
}

/// Update medium holding at most one image.
#[derive(Clone, Debug, Default)]
pub struct MockMedium {
    pub image: Option<MockImage>,
    pub open_error: Option<ErrorKind>,
    pub closed: usize,
    pub removed: bool,
}

impl MockMedium {
    pub fn empty() -> Self {
        MockMedium::default()
    }

    pub fn with(image: MockImage) -> Self {
        MockMedium {
            image: Some(image),
            ..MockMedium::default()
        }
    }

    pub fn with_image(data: Vec<u8>) -> Self {
        MockMedium::with(MockImage::new(data))
    }

    pub fn failing(error: ErrorKind) -> Self {
        MockMedium {
            open_error: Some(error),
            ..MockMedium::default()
        }
    }
}

impl UpdateMedium for MockMedium {
    type Image = MockImage;

    async fn open(&mut self) -> Result<Option<MockImage>, ErrorKind> {
        match self.open_error {
            Some(error) => Err(error),
            None => Ok(self.image.clone()),
        }
    }

    async fn close(&mut self, _image: MockImage, remove: bool) -> Result<(), ErrorKind> {
        self.closed += 1;
        if remove {
            self.image = None;
            self.removed = true;
        }
        Ok(())
    }
}
