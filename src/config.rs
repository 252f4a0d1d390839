//! Board level configuration of a boot attempt.
//!
//! Everything here is decided when the bootloader is built for a board, but is kept as a plain
//! value so every variant can be exercised from the same binary. A [`Config`] serializes with
//! serde, so a board can also keep it in a settings blob next to the bootloader.

use serde::{Deserialize, Serialize};

use crate::{Address, hash::HashAlgorithm, validate::CheckTier};

/// RAM window the initial stack pointer of the application has to point into.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RamRegion {
    pub start: Address,
    /// One past the last byte of RAM.
    pub end: Address,
}

impl RamRegion {
    /// Stacks are full-descending, so the top may sit one past the last byte of RAM.
    pub const fn holds_stack_top(&self, stack_top: Address) -> bool {
        stack_top > self.start && stack_top <= self.end
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Where the application and its vector table start. Must be aligned to an erase sector.
    pub app_base: Address,
    pub ram: RamRegion,
    /// Number of peripheral interrupt vectors following the core exceptions.
    pub irq_count: u16,
    /// Fingerprint stored in the update metadata.
    pub hash: HashAlgorithm,
    /// Persist the metadata of the last update at the top of flash, skipping identical updates.
    pub store_metadata: bool,
    /// Vector table checks before the jump, `None` disables them altogether.
    pub check_tier: Option<CheckTier>,
    /// Go through the whole update without erasing or programming anything.
    pub dry_run: bool,
    /// Delete the update image from the medium once it has been applied.
    pub delete_update: bool,
    /// Log size and digest of both metadata records on every update check.
    pub log_metadata: bool,
}

/// SRAM of the HC32F460 family.
pub const HC32F460_RAM: RamRegion = RamRegion {
    start: 0x1FFF_8000,
    end: 0x2002_7000,
};

/// Peripheral interrupt vectors of the HC32F460 family.
pub const HC32F460_IRQ_COUNT: u16 = 144;

impl Config {
    /// All features on: SHA-256 metadata, every vector table check, image deleted after flashing.
    pub const fn full(app_base: Address) -> Self {
        Config {
            app_base,
            ram: HC32F460_RAM,
            irq_count: HC32F460_IRQ_COUNT,
            hash: HashAlgorithm::Sha256,
            store_metadata: true,
            check_tier: Some(CheckTier::Full),
            dry_run: false,
            delete_update: true,
            log_metadata: true,
        }
    }

    /// As [`Config::full`], without dumping metadata to the log.
    pub const fn small(app_base: Address) -> Self {
        Config {
            log_metadata: false,
            ..Self::full(app_base)
        }
    }

    /// Smallest footprint: CRC-32 metadata, minimal checks and the image is left on the medium.
    pub const fn tiny(app_base: Address) -> Self {
        Config {
            hash: HashAlgorithm::Crc32,
            check_tier: Some(CheckTier::Minimal),
            delete_update: false,
            log_metadata: false,
            ..Self::full(app_base)
        }
    }
}
