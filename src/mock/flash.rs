use std::{vec, vec::Vec};

use crate::{
    Address,
    flash::{ERASED_BYTE, FlashController, ReadOnly, Status},
    mock::WearTracker,
};

/// Flash of the 256K part.
pub const FLASH_SIZE: usize = 0x4_0000;

pub const SECTOR_SIZE: u32 = 0x2000;

/// Flash controller backed by memory, with fault injection.
///
/// Programming only clears bits, like NOR flash does.
#[derive(Clone, Debug)]
pub struct SimulatedFlash {
    pub memory: Vec<u8>,
    pub wear: WearTracker,
    pub unlocked: bool,
    pub unlocks: usize,
    pub locks: usize,
    pub erases: usize,
    /// Words programmed.
    pub programs: usize,
    status: Status,

    /// Byte that silently ends up wrong when programmed.
    pub corrupt: Option<Address>,
    /// Word whose programming raises the mismatch flag.
    pub mismatch_at: Option<Address>,
    /// Sector whose erase raises the fault flag.
    pub write_protected: Option<Address>,
    /// The controller never becomes ready.
    pub stuck: bool,
}

impl SimulatedFlash {
    pub fn new() -> Self {
        SimulatedFlash {
            memory: vec![ERASED_BYTE; FLASH_SIZE],
            wear: WearTracker::new(),
            unlocked: false,
            unlocks: 0,
            locks: 0,
            erases: 0,
            programs: 0,
            status: Status::default(),
            corrupt: None,
            mismatch_at: None,
            write_protected: None,
            stuck: false,
        }
    }

    pub fn capacity_bytes(&self) -> u32 {
        self.memory.len() as u32
    }

    pub fn reader(&self) -> ReadOnly<'_, Self> {
        ReadOnly::new(self)
    }

    /// Place bytes in flash without going through the controller.
    pub fn poke(&mut self, address: Address, bytes: &[u8]) {
        let start = address as usize;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn contents(&self, address: Address, len: usize) -> &[u8] {
        &self.memory[address as usize..address as usize + len]
    }
}

impl FlashController for SimulatedFlash {
    const SECTOR_SIZE: u32 = SECTOR_SIZE;

    fn capacity(&self) -> u32 {
        self.capacity_bytes()
    }

    fn unlock(&mut self) {
        assert!(!self.unlocked, "flash unlocked twice");
        self.unlocked = true;
        self.unlocks += 1;
    }

    fn lock(&mut self) {
        self.unlocked = false;
        self.locks += 1;
    }

    fn status(&self) -> Status {
        match self.stuck {
            true => Status::default(),
            false => self.status,
        }
    }

    fn clear_status(&mut self) {
        self.status = Status::default();
    }

    fn start_erase(&mut self, address: Address) {
        assert!(self.unlocked, "erase while locked");
        assert_eq!(address % SECTOR_SIZE, 0);

        self.status.ready = true;
        if self.write_protected == Some(address) {
            self.status.fault = true;
            return;
        }

        let start = address as usize;
        let end = (start + SECTOR_SIZE as usize).min(self.memory.len());
        self.memory[start..end].fill(ERASED_BYTE);
        self.wear.increase(address);
        self.erases += 1;
    }

    fn start_program(&mut self, address: Address, word: u32) {
        assert!(self.unlocked, "program while locked");
        assert_eq!(address % 4, 0);

        self.status.ready = true;
        self.programs += 1;
        if self.mismatch_at == Some(address) {
            self.status.mismatch = true;
            return;
        }

        for (i, byte) in word.to_le_bytes().into_iter().enumerate() {
            let target = address + i as u32;
            let cell = &mut self.memory[target as usize];
            *cell &= byte;
            if self.corrupt == Some(target) {
                *cell ^= 0x5A;
            }
        }
    }

    fn read(&self, address: Address, buf: &mut [u8]) {
        buf.copy_from_slice(self.contents(address, buf.len()));
    }
}
