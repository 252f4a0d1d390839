use core::arch::asm;

use crate::boot::{Boot, Leap};

/// Vector table offset register of the system control block.
const VTOR: u32 = 0xE000_ED08;

/// Simple bootload mechanism for Cortex-M without support for TrustZone.
pub struct SimpleCortexM;

impl Boot for SimpleCortexM {
    unsafe fn boot(leap: Leap) -> ! {
        cortex_m::interrupt::disable();

        unsafe {
            asm!(
                "msr msp, {sp}",
                "str {table}, [{vtor}]",
                "dsb",
                "isb",
                "cpsie i",
                "bx {reset}",
                sp = in(reg) leap.stack_pointer(),
                table = in(reg) leap.vector_table(),
                vtor = in(reg) VTOR,
                reset = in(reg) leap.reset(),
                options(noreturn),
            )
        }
    }
}
