use embedded_storage_async::nor_flash::{ErrorType, NorFlash, ReadNorFlash};

use super::{FlashController, FlashError, POLL_LIMIT, Status, WORD_SIZE};
use crate::{Address, log};

/// Flash controller with erase and program operations allowed.
///
/// The controller is locked again when the guard is dropped, whichever way the update ends.
pub struct Unlocked<'a, C: FlashController> {
    controller: &'a mut C,
}

impl<'a, C: FlashController> Unlocked<'a, C> {
    pub fn new(controller: &'a mut C) -> Self {
        controller.unlock();
        Unlocked { controller }
    }

    /// Poll until the controller is ready, giving up after [`POLL_LIMIT`] polls.
    fn wait_ready(&self, address: Address) -> Result<Status, FlashError> {
        for _ in 0..POLL_LIMIT {
            let status = self.controller.status();
            if status.ready {
                return Ok(status);
            }
        }
        log::error!("flash timeout at {=u32:#x}", address);
        Err(FlashError::Timeout { address })
    }

    /// Highest erasable address, the last sector may extend past the usable capacity.
    fn erase_ceiling(&self) -> u32 {
        self.controller.capacity().div_ceil(C::SECTOR_SIZE) * C::SECTOR_SIZE
    }
}

impl<C: FlashController> Drop for Unlocked<'_, C> {
    fn drop(&mut self) {
        self.controller.lock();
    }
}

impl<C: FlashController> ErrorType for Unlocked<'_, C> {
    type Error = FlashError;
}

impl<C: FlashController> ReadNorFlash for Unlocked<'_, C> {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        read(&*self.controller, offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.controller.capacity() as usize
    }
}

impl<C: FlashController> NorFlash for Unlocked<'_, C> {
    const WRITE_SIZE: usize = WORD_SIZE;
    const ERASE_SIZE: usize = C::SECTOR_SIZE as usize;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from % C::SECTOR_SIZE != 0 || to % C::SECTOR_SIZE != 0 {
            return Err(FlashError::NotAligned);
        }
        if from > to || to > self.erase_ceiling() {
            return Err(FlashError::OutOfBounds);
        }

        for address in (from..to).step_by(C::SECTOR_SIZE as usize) {
            self.controller.clear_status();
            self.controller.start_erase(address);
            if self.wait_ready(address)?.fault {
                return Err(FlashError::Fault { address });
            }
        }
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % WORD_SIZE != 0 || bytes.len() % WORD_SIZE != 0 {
            return Err(FlashError::NotAligned);
        }
        if offset as usize + bytes.len() > self.capacity() {
            return Err(FlashError::OutOfBounds);
        }

        let mut address = offset;
        for word in bytes.chunks_exact(WORD_SIZE) {
            self.controller.clear_status();
            self.controller
                .start_program(address, u32::from_le_bytes([word[0], word[1], word[2], word[3]]));

            let status = self.wait_ready(address)?;
            if status.mismatch {
                return Err(FlashError::Mismatch { address });
            }
            if status.fault {
                return Err(FlashError::Fault { address });
            }
            address += WORD_SIZE as u32;
        }
        Ok(())
    }
}

/// Read access to a flash controller that stays locked.
pub struct ReadOnly<'a, C> {
    controller: &'a C,
}

impl<'a, C: FlashController> ReadOnly<'a, C> {
    pub fn new(controller: &'a C) -> Self {
        ReadOnly { controller }
    }
}

impl<C: FlashController> ErrorType for ReadOnly<'_, C> {
    type Error = FlashError;
}

impl<C: FlashController> ReadNorFlash for ReadOnly<'_, C> {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        read(self.controller, offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.controller.capacity() as usize
    }
}

fn read<C: FlashController>(controller: &C, offset: u32, bytes: &mut [u8]) -> Result<(), FlashError> {
    if offset as usize + bytes.len() > controller.capacity() as usize {
        return Err(FlashError::OutOfBounds);
    }
    controller.read(offset, bytes);
    Ok(())
}
