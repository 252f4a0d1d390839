//! Incremental fingerprinting of update images.
//!
//! Every algorithm follows the same session contract: [`Hasher::start`] opens a session,
//! [`Hasher::push`] feeds it an arbitrary number of bytes per call, and [`Hasher::finish`]
//! returns the digest and closes the session. How the input is split over `push` calls
//! never changes the digest.

use serde::{Deserialize, Serialize};

pub mod crc32;
pub mod sha256;

pub use crc32::Crc32;
pub use sha256::Sha256;

/// Fingerprint algorithm recorded in the update metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HashAlgorithm {
    /// Only the image size is compared.
    None,
    Crc32,
    Sha256,
}

impl HashAlgorithm {
    /// Number of digest bytes this algorithm adds to the metadata record.
    pub const fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::None => 0,
            HashAlgorithm::Crc32 => 4,
            HashAlgorithm::Sha256 => 32,
        }
    }

    pub const fn hasher(self) -> AnyHasher {
        match self {
            HashAlgorithm::None => AnyHasher::None(NoHash::new()),
            HashAlgorithm::Crc32 => AnyHasher::Crc32(Crc32::new()),
            HashAlgorithm::Sha256 => AnyHasher::Sha256(Sha256::new()),
        }
    }
}

/// Digest produced by one hashing session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HashValue {
    None,
    Crc32(u32),
    Sha256([u8; 32]),
}

impl HashValue {
    pub const fn algorithm(&self) -> HashAlgorithm {
        match self {
            HashValue::None => HashAlgorithm::None,
            HashValue::Crc32(_) => HashAlgorithm::Crc32,
            HashValue::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// Write the digest in its metadata record layout, returning the number of bytes written.
    ///
    /// `out` must hold at least [`HashAlgorithm::digest_len`] bytes.
    pub fn write_to(&self, out: &mut [u8]) -> usize {
        match self {
            HashValue::None => 0,
            HashValue::Crc32(crc) => {
                out[..4].copy_from_slice(&crc.to_le_bytes());
                4
            }
            HashValue::Sha256(digest) => {
                out[..32].copy_from_slice(digest);
                32
            }
        }
    }

    /// Read a digest laid out by [`HashValue::write_to`].
    pub fn read_from(algorithm: HashAlgorithm, bytes: &[u8]) -> Option<Self> {
        match algorithm {
            HashAlgorithm::None => Some(HashValue::None),
            HashAlgorithm::Crc32 => {
                let b = bytes.get(..4)?;
                Some(HashValue::Crc32(u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            }
            HashAlgorithm::Sha256 => {
                let mut digest = [0u8; 32];
                digest.copy_from_slice(bytes.get(..32)?);
                Some(HashValue::Sha256(digest))
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HashError {
    /// Data was pushed or a digest requested outside of a session.
    NotStarted,
    /// The final block was already padded.
    AlreadyPadded,
}

/// Session based incremental hash.
pub trait Hasher {
    /// Open a new session, discarding any state of a previous one.
    fn start(&mut self) -> Result<(), HashError>;

    /// Feed bytes to the open session.
    fn push(&mut self, data: &[u8]) -> Result<(), HashError>;

    /// Close the session and return its digest.
    ///
    /// A new session has to be started before pushing again.
    fn finish(&mut self) -> Result<HashValue, HashError>;
}

/// Hasher for builds that only compare the image size.
#[derive(Default, Debug)]
pub struct NoHash {
    open: bool,
}

impl NoHash {
    pub const fn new() -> Self {
        NoHash { open: false }
    }
}

impl Hasher for NoHash {
    fn start(&mut self) -> Result<(), HashError> {
        self.open = true;
        Ok(())
    }

    fn push(&mut self, _data: &[u8]) -> Result<(), HashError> {
        if self.open {
            Ok(())
        } else {
            Err(HashError::NotStarted)
        }
    }

    fn finish(&mut self) -> Result<HashValue, HashError> {
        if !core::mem::replace(&mut self.open, false) {
            return Err(HashError::NotStarted);
        }
        Ok(HashValue::None)
    }
}

/// Hasher for the algorithm selected in the [`Config`](crate::Config).
pub enum AnyHasher {
    None(NoHash),
    Crc32(Crc32),
    Sha256(Sha256),
}

impl Hasher for AnyHasher {
    fn start(&mut self) -> Result<(), HashError> {
        match self {
            AnyHasher::None(h) => h.start(),
            AnyHasher::Crc32(h) => h.start(),
            AnyHasher::Sha256(h) => h.start(),
        }
    }

    fn push(&mut self, data: &[u8]) -> Result<(), HashError> {
        match self {
            AnyHasher::None(h) => h.push(data),
            AnyHasher::Crc32(h) => h.push(data),
            AnyHasher::Sha256(h) => h.push(data),
        }
    }

    fn finish(&mut self) -> Result<HashValue, HashError> {
        match self {
            AnyHasher::None(h) => h.finish(),
            AnyHasher::Crc32(h) => h.finish(),
            AnyHasher::Sha256(h) => h.finish(),
        }
    }
}
