//! SHA-256 driven through a 64-byte block engine, the way block-oriented hash peripherals consume data.
//!
//! Input of any length is collected into whole blocks before it reaches the compression function.
//! Only the final block carries padding: the `0x80` marker followed by the big-endian bit length
//! of the message, spilling into one more block when the marker leaves no room for the trailer.

use sha2::compress256;
use sha2::digest::{consts::U64, generic_array::GenericArray};

use super::{HashError, HashValue, Hasher};

const BLOCK_LEN: usize = 64;
const TRAILER_LEN: usize = 8;

const INITIAL_STATE: [u32; 8] = [
    0x6a09_e667,
    0xbb67_ae85,
    0x3c6e_f372,
    0xa54f_f53a,
    0x510e_527f,
    0x9b05_688c,
    0x1f83_d9ab,
    0x5be0_cd19,
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Session {
    Idle,
    Open,
    /// The final block went through the engine, only the digest can be read.
    Padded,
}

pub struct Sha256 {
    state: [u32; 8],
    block: [u8; BLOCK_LEN],
    filled: usize,
    /// Total number of message bytes in this session.
    length: u64,
    session: Session,
}

impl Default for Sha256 {
    fn default() -> Self {
        Self::new()
    }
}

impl Sha256 {
    pub const fn new() -> Self {
        Sha256 {
            state: INITIAL_STATE,
            block: [0; BLOCK_LEN],
            filled: 0,
            length: 0,
            session: Session::Idle,
        }
    }

    fn compress(&mut self) {
        let block = GenericArray::<u8, U64>::from_slice(&self.block);
        compress256(&mut self.state, core::slice::from_ref(block));
    }

    /// Terminate the message in the pending partial block.
    fn pad(&mut self) -> Result<(), HashError> {
        match self.session {
            Session::Idle => return Err(HashError::NotStarted),
            Session::Padded => return Err(HashError::AlreadyPadded),
            Session::Open => {}
        }

        let bit_length = self.length.wrapping_mul(8);

        self.block[self.filled] = 0x80;
        self.block[self.filled + 1..].fill(0);
        if self.filled + 1 > BLOCK_LEN - TRAILER_LEN {
            self.compress();
            self.block.fill(0);
        }
        self.block[BLOCK_LEN - TRAILER_LEN..].copy_from_slice(&bit_length.to_be_bytes());
        self.compress();

        self.filled = 0;
        self.session = Session::Padded;
        Ok(())
    }
}

impl Hasher for Sha256 {
    fn start(&mut self) -> Result<(), HashError> {
        *self = Sha256 {
            session: Session::Open,
            ..Sha256::new()
        };
        Ok(())
    }

    fn push(&mut self, mut data: &[u8]) -> Result<(), HashError> {
        match self.session {
            Session::Idle => return Err(HashError::NotStarted),
            Session::Padded => return Err(HashError::AlreadyPadded),
            Session::Open => {}
        }

        self.length += data.len() as u64;
        while !data.is_empty() {
            let take = (BLOCK_LEN - self.filled).min(data.len());
            self.block[self.filled..self.filled + take].copy_from_slice(&data[..take]);
            self.filled += take;
            data = &data[take..];

            if self.filled == BLOCK_LEN {
                self.compress();
                self.filled = 0;
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<HashValue, HashError> {
        self.pad()?;

        let mut digest = [0u8; 32];
        for (out, word) in digest.chunks_exact_mut(4).zip(self.state) {
            out.copy_from_slice(&word.to_be_bytes());
        }

        *self = Sha256::new();
        Ok(HashValue::Sha256(digest))
    }
}
