//! Second stage bootloader core: update the application from removable storage, check it and leap into it.
//!
//! A boot attempt walks through the modules in order:
//! * [`hash`] fingerprints the update image found on the medium,
//! * [`metadata`] decides whether that image is already in flash,
//! * [`flash`] erases, programs and verifies the application region,
//! * [`validate`] inspects the vector table of the application,
//! * [`boot`] hands control over to it.
//!
//! [`Bootloader`] strings these together.
#![no_std]

use core::fmt;

pub mod boot;
pub mod config;
pub mod flash;
pub mod hash;
pub mod image;
pub mod metadata;
pub mod sequence;
pub mod validate;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

pub use config::Config;
pub use sequence::{Bootloader, Halt, HaltReason, Phase, UpdateMedium, UpdateOutcome, conclude};

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(not(feature = "defmt"))]
pub(crate) mod log {
    macro_rules! trace {
        ( $( $x:expr ),* $(,)? ) => {{ let _ = ( $( &$x ),* ); }};
    }
    pub(crate) use trace;
    macro_rules! debug {
        ( $( $x:expr ),* $(,)? ) => {{ let _ = ( $( &$x ),* ); }};
    }
    pub(crate) use debug;
    macro_rules! info {
        ( $( $x:expr ),* $(,)? ) => {{ let _ = ( $( &$x ),* ); }};
    }
    pub(crate) use info;
    macro_rules! warner {
        ( $( $x:expr ),* $(,)? ) => {{ let _ = ( $( &$x ),* ); }};
    }
    pub(crate) use warner as warn;
    macro_rules! error {
        ( $( $x:expr ),* $(,)? ) => {{ let _ = ( $( &$x ),* ); }};
    }
    pub(crate) use error;
}

/// Address in the flash address space of the device.
///
/// Flash is expected to be mapped from address zero, so addresses double as offsets for the flash traits.
pub type Address = u32;

/// Reasons an update attempt is abandoned.
///
/// Every variant is fatal to the current boot attempt; nothing is retried.
/// A vector table that fails validation is not an [`Error`], see [`validate::CheckFailure`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The update image could not be read.
    Read(embedded_io_async::ErrorKind),
    /// The update image ended before its announced length.
    SourceTruncated { expected: u32, actual: u32 },
    /// The update image continues past its announced length.
    SourceOverrun { expected: u32 },
    /// The bytes programmed do not hash to the fingerprint taken before erasing.
    SourceChanged,
    /// The update image does not fit in the application region.
    ImageTooLarge { size: u64, available: u32 },
    /// The range is empty, misaligned or outside the application region.
    InvalidRange { start: Address, end: Address },
    /// A chunk other than the final one needed word padding.
    Padding { address: Address },
    Hash(hash::HashError),
    Flash(flash::FlashError),
    /// Programmed data does not read back as written.
    Verify { address: Address },
    /// The metadata record read back after the update differs from the one written.
    MetadataVerify,
}

impl From<hash::HashError> for Error {
    fn from(value: hash::HashError) -> Self {
        Error::Hash(value)
    }
}

impl From<flash::FlashError> for Error {
    fn from(value: flash::FlashError) -> Self {
        Error::Flash(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Read(kind) => write!(f, "reading update image failed: {kind:?}"),
            Error::SourceTruncated { expected, actual } => {
                write!(f, "update image truncated: {actual} of {expected} bytes")
            }
            Error::SourceOverrun { expected } => {
                write!(f, "update image longer than {expected} bytes")
            }
            Error::SourceChanged => f.write_str("update image changed while programming"),
            Error::ImageTooLarge { size, available } => {
                write!(f, "update image of {size} bytes exceeds {available} bytes")
            }
            Error::InvalidRange { start, end } => {
                write!(f, "invalid flash range {start:#010x}..{end:#010x}")
            }
            Error::Padding { address } => write!(f, "unexpected padding at {address:#010x}"),
            Error::Hash(e) => write!(f, "hash: {e:?}"),
            Error::Flash(e) => write!(f, "flash: {e:?}"),
            Error::Verify { address } => write!(f, "read-back mismatch at {address:#010x}"),
            Error::MetadataVerify => f.write_str("stored metadata does not match"),
        }
    }
}
