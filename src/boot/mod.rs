#[cfg(all(feature = "cortex_m", target_arch = "arm"))]
pub mod cortex_m;

use crate::Address;

/// Everything needed to enter the application, prepared up to the branch itself.
///
/// Only a vector table that passed [`Validator::pre_check`](crate::validate::Validator::pre_check) yields a `Leap`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Leap {
    vector_table: Address,
    stack_pointer: u32,
    reset: u32,
}

impl Leap {
    pub(crate) const fn new(vector_table: Address, stack_pointer: u32, reset: u32) -> Self {
        Leap {
            vector_table,
            stack_pointer,
            reset,
        }
    }

    /// Value for the vector table offset register.
    pub const fn vector_table(&self) -> Address {
        self.vector_table
    }

    /// Initial main stack pointer of the application.
    pub const fn stack_pointer(&self) -> u32 {
        self.stack_pointer
    }

    /// Reset handler, Thumb bit included.
    pub const fn reset(&self) -> u32 {
        self.reset
    }
}

/// Bootload mechanism that hands the core over to the application.
///
/// Optionally could drop privileges or mask memory access.
pub trait Boot {
    /// Switch stack and vector table, then branch to the reset handler.
    ///
    /// Interrupts are masked while the stack pointer and vector table are replaced.
    ///
    /// # Safety
    ///
    /// `leap` has to come from a [`Validator::pre_check`](crate::validate::Validator::pre_check)
    /// that passed for the application still in flash, and nothing may have been written there
    /// since. The bootloader's stack is abandoned, so this is called once, from the main thread,
    /// with no interrupt handler or flash operation still running.
    unsafe fn boot(leap: Leap) -> !;
}
