//! CRC-32 as produced by CRC units running reflected 32-bit mode without output XOR.
//!
//! Polynomial `0x04C11DB7`, input and output reflected, seeded with all-ones and no final XOR.
//! The catalogue name for this variant is CRC-32/JAMCRC; it is the bitwise complement of the
//! common CRC-32/ISO-HDLC checksum. The engine works bitwise, without a lookup table in flash.

use crc::{CRC_32_JAMCRC, Crc, Digest, NoTable};

use super::{HashError, HashValue, Hasher};

static ENGINE: Crc<u32, NoTable> = Crc::<u32, NoTable>::new(&CRC_32_JAMCRC);

#[derive(Default)]
pub struct Crc32 {
    digest: Option<Digest<'static, u32, NoTable>>,
}

impl Crc32 {
    pub const fn new() -> Self {
        Crc32 { digest: None }
    }
}

impl Hasher for Crc32 {
    fn start(&mut self) -> Result<(), HashError> {
        self.digest = Some(ENGINE.digest());
        Ok(())
    }

    fn push(&mut self, data: &[u8]) -> Result<(), HashError> {
        let digest = self.digest.as_mut().ok_or(HashError::NotStarted)?;
        digest.update(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<HashValue, HashError> {
        let digest = self.digest.take().ok_or(HashError::NotStarted)?;
        Ok(HashValue::Crc32(digest.finalize()))
    }
}
