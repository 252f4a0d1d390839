//! Internal flash of the microcontroller.
//!
//! The register level flash controller is reached through [`FlashController`]. On top of it,
//! [`Unlocked`] and [`ReadOnly`] speak the `embedded-storage-async` NOR flash traits, and
//! [`FlashUpdater`] erases, programs and verifies the application region from an update image.

use embedded_storage_async::nor_flash::{NorFlashError, NorFlashErrorKind};

use crate::{Address, Error};

mod controller;
pub mod update;

pub use controller::{ReadOnly, Unlocked};
pub use update::{FlashUpdater, UpdatePlan};

/// Unit of programming; every write covers whole words.
pub const WORD_SIZE: usize = 4;

/// Size of the scratch buffers the update image is streamed through.
pub const CHUNK_SIZE: usize = 512;

/// Value of an erased byte, also used to pad the final word of an image.
pub const ERASED_BYTE: u8 = 0xFF;

/// Status polls before an erase or program operation is considered stuck.
pub const POLL_LIMIT: u32 = 0x1000;

/// Half-open range of flash addresses.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRange {
    pub start: Address,
    /// One past the last byte.
    pub end: Address,
}

impl FlashRange {
    pub const fn new(start: Address, end: Address) -> Result<Self, Error> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        Ok(FlashRange { start, end })
    }

    pub const fn len(&self) -> u32 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub const fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end
    }
}

/// Inclusive run of erase sectors, by sector index.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SectorSpan {
    pub first: u32,
    pub last: u32,
}

impl SectorSpan {
    /// Sectors from the one holding the first byte of `range` through the one holding its last byte.
    pub const fn covering(range: FlashRange, sector_size: u32) -> Self {
        SectorSpan {
            first: range.start / sector_size,
            last: (range.end - 1) / sector_size,
        }
    }

    pub const fn count(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Start address of every sector in the span.
    pub fn addresses(&self, sector_size: u32) -> impl Iterator<Item = Address> + use<> {
        (self.first..=self.last).map(move |sector| sector * sector_size)
    }

    /// Addresses covered by the span.
    pub const fn range(&self, sector_size: u32) -> FlashRange {
        FlashRange {
            start: self.first * sector_size,
            end: (self.last + 1) * sector_size,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    Erase,
    Write,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProgressEvent {
    pub stage: Stage,
    /// Sectors erased or bytes written so far.
    pub done: u32,
    pub total: u32,
}

impl ProgressEvent {
    pub const fn erase(done: u32, total: u32) -> Self {
        ProgressEvent {
            stage: Stage::Erase,
            done,
            total,
        }
    }

    pub const fn write(done: u32, total: u32) -> Self {
        ProgressEvent {
            stage: Stage::Write,
            done,
            total,
        }
    }
}

/// Receiver of progress updates, typically a display or a serial console.
///
/// Called synchronously from within the update; it must not touch the flash.
pub trait Progress {
    fn report(&mut self, event: ProgressEvent);
}

impl<F: FnMut(ProgressEvent)> Progress for F {
    fn report(&mut self, event: ProgressEvent) {
        self(event)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// The controller did not become ready in time.
    Timeout { address: Address },
    /// The controller flagged that a programmed word does not read back.
    Mismatch { address: Address },
    /// The controller flagged an operation error, for example a write protected sector.
    Fault { address: Address },
    NotAligned,
    OutOfBounds,
}

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            FlashError::NotAligned => NorFlashErrorKind::NotAligned,
            FlashError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            _ => NorFlashErrorKind::Other,
        }
    }
}

/// Flags reported by the flash controller.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    /// The last operation completed.
    pub ready: bool,
    /// The last programmed word does not read back as written.
    pub mismatch: bool,
    /// The last operation was rejected.
    pub fault: bool,
}

/// Register level access to the embedded flash controller.
///
/// Operations are only started here; waiting for completion is left to the caller, which polls
/// [`FlashController::status`] a bounded number of times.
pub trait FlashController {
    /// Size of an erase sector in bytes.
    const SECTOR_SIZE: u32;

    /// Usable flash in bytes, mapped from address zero.
    fn capacity(&self) -> u32;

    /// Allow erase and program operations.
    fn unlock(&mut self);

    fn lock(&mut self);

    fn status(&self) -> Status;

    fn clear_status(&mut self);

    /// Start erasing the sector starting at `address`.
    fn start_erase(&mut self, address: Address);

    /// Start programming the word at `address`, read back by the controller when done.
    fn start_program(&mut self, address: Address, word: u32);

    /// Read flash contents through the memory map.
    fn read(&self, address: Address, buf: &mut [u8]);
}
