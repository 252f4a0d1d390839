//! Record of the last applied update, persisted at the top of flash.
//!
//! Before anything is erased, the fingerprint of the image on the medium is compared with the
//! record left behind by the previous update. When they match the update is skipped, which
//! keeps repeated boots with the same image on the medium from wearing out the flash.
//!
//! The record is `app_size` as a little-endian word followed by the digest bytes, padded to a
//! whole number of words, since flash is programmed a word at a time.

use embedded_io_async::Read;
use embedded_storage_async::nor_flash::ReadNorFlash;

use crate::{
    Address, Error,
    flash::{CHUNK_SIZE, FlashError, FlashRange, WORD_SIZE},
    hash::{HashAlgorithm, HashValue, Hasher},
    image, log,
};

/// Value of a flash word that has been erased but not programmed.
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

/// Words in the largest record, which holds a SHA-256 digest.
pub const MAX_WORDS: usize = UpdateMetadata::word_count(HashAlgorithm::Sha256);

/// Length of the largest record in bytes.
pub const RECORD_MAX: usize = MAX_WORDS * WORD_SIZE;

/// Buffer for an encoded record of any algorithm.
pub type Record = [u8; RECORD_MAX];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UpdateMetadata {
    /// Size of the application image in bytes, before word padding.
    pub app_size: u32,
    pub hash: HashValue,
}

impl UpdateMetadata {
    /// Number of flash words a record with this algorithm occupies.
    pub const fn word_count(algorithm: HashAlgorithm) -> usize {
        (4 + algorithm.digest_len()).div_ceil(WORD_SIZE)
    }

    pub const fn record_len(algorithm: HashAlgorithm) -> usize {
        Self::word_count(algorithm) * WORD_SIZE
    }

    pub const fn algorithm(&self) -> HashAlgorithm {
        self.hash.algorithm()
    }

    /// Lay the record out as it is programmed into flash.
    pub fn encode<'r>(&self, record: &'r mut Record) -> &'r [u8] {
        record.fill(0);
        record[..4].copy_from_slice(&self.app_size.to_le_bytes());
        self.hash.write_to(&mut record[4..]);
        &record[..Self::record_len(self.algorithm())]
    }

    /// Interpret a record read from flash, `None` if the slot is erased or too short.
    pub fn decode(algorithm: HashAlgorithm, bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..Self::record_len(algorithm))?;
        let app_size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if app_size == ERASED_WORD {
            return None;
        }

        Some(UpdateMetadata {
            app_size,
            hash: HashValue::read_from(algorithm, &bytes[4..])?,
        })
    }

    pub fn log(&self, description: &str) {
        log::info!("metadata of {}: {} bytes", description, self.app_size);
        match self.hash {
            HashValue::None => {}
            HashValue::Crc32(crc) => log::info!("CRC32: {=u32:#x}", crc),
            HashValue::Sha256(digest) => log::info!("SHA256: {=[u8]:x}", &digest[..]),
        }
    }
}

/// Fingerprint `len` bytes of `source`, reading it exactly once from its current position.
///
/// The source has to end right after `len` bytes.
pub async fn compute<R: Read, H: Hasher>(
    source: &mut R,
    len: u32,
    hasher: &mut H,
    scratch: &mut [u8; CHUNK_SIZE],
) -> Result<UpdateMetadata, Error> {
    hasher.start()?;

    let mut consumed: u32 = 0;
    while consumed < len {
        let want = (len - consumed).min(CHUNK_SIZE as u32) as usize;
        let read = image::fill(source, &mut scratch[..want]).await?;
        hasher.push(&scratch[..read])?;
        consumed += read as u32;

        if read < want {
            return Err(Error::SourceTruncated {
                expected: len,
                actual: consumed,
            });
        }
    }
    image::expect_end(source, len).await?;

    Ok(UpdateMetadata {
        app_size: len,
        hash: hasher.finish()?,
    })
}

/// Whether the stored record describes the candidate image.
///
/// A missing or erased record never matches.
pub fn matches(candidate: &UpdateMetadata, stored: Option<&UpdateMetadata>) -> bool {
    let Some(stored) = stored else {
        return false;
    };

    let mut a = [0u8; RECORD_MAX];
    let mut b = [0u8; RECORD_MAX];
    candidate.encode(&mut a) == stored.encode(&mut b)
}

/// Start of the record slot: the last words below `flash_top`, the highest usable flash address.
pub const fn store_location(flash_top: Address, algorithm: HashAlgorithm) -> Address {
    let address = flash_top - UpdateMetadata::record_len(algorithm) as u32;
    address - address % WORD_SIZE as u32
}

/// Slot holding the record in a flash of `capacity` usable bytes.
pub const fn slot(capacity: u32, algorithm: HashAlgorithm) -> FlashRange {
    let start = store_location(capacity - 1, algorithm);
    FlashRange {
        start,
        end: start + UpdateMetadata::record_len(algorithm) as u32,
    }
}

/// Read the record left behind by the previous update.
pub async fn read_stored<F>(flash: &mut F, algorithm: HashAlgorithm) -> Result<Option<UpdateMetadata>, Error>
where
    F: ReadNorFlash<Error = FlashError>,
{
    let slot = slot(flash.capacity() as u32, algorithm);
    let mut record = [0u8; RECORD_MAX];
    let bytes = &mut record[..slot.len() as usize];
    flash.read(slot.start, bytes).await?;
    Ok(UpdateMetadata::decode(algorithm, bytes))
}
