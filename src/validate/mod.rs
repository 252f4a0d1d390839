//! Plausibility checks on the vector table of the application before control is handed over.
//!
//! The checks form an ordered list in three cumulative tiers. [`CheckTier::Minimal`] covers the
//! initial stack pointer and the reset vector, [`CheckTier::Extended`] adds the core exception
//! handlers and [`CheckTier::Full`] adds the reserved slots and every peripheral interrupt.
//! The first failing check ends validation.

use serde::{Deserialize, Serialize};

use crate::{Address, Config, boot::Leap, config::RamRegion, log, metadata::ERASED_WORD};

/// Largest vector table read: 16 core slots and up to 240 peripheral interrupts.
pub const MAX_TABLE_BYTES: usize = 1024;

/// Slots of the core exceptions, stack pointer included.
pub const CORE_SLOTS: usize = 16;

/// Slots the architecture reserves; they have to read zero.
pub const RESERVED_SLOTS: [usize; 5] = [7, 8, 9, 10, 13];

const MAX_IRQS: u16 = (MAX_TABLE_BYTES / 4 - CORE_SLOTS) as u16;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CheckTier {
    Minimal,
    Extended,
    Full,
}

/// Core exceptions with a handler in the vector table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Exception {
    Nmi,
    HardFault,
    MemManage,
    BusFault,
    UsageFault,
    SvCall,
    DebugMonitor,
    PendSv,
    SysTick,
}

impl Exception {
    pub const ALL: [Exception; 9] = [
        Exception::Nmi,
        Exception::HardFault,
        Exception::MemManage,
        Exception::BusFault,
        Exception::UsageFault,
        Exception::SvCall,
        Exception::DebugMonitor,
        Exception::PendSv,
        Exception::SysTick,
    ];

    pub const fn slot(self) -> usize {
        match self {
            Exception::Nmi => 2,
            Exception::HardFault => 3,
            Exception::MemManage => 4,
            Exception::BusFault => 5,
            Exception::UsageFault => 6,
            Exception::SvCall => 11,
            Exception::DebugMonitor => 12,
            Exception::PendSv => 14,
            Exception::SysTick => 15,
        }
    }
}

/// Read-only view over the bytes of a vector table.
///
/// Out of range slots read as `None`.
#[derive(Clone, Copy, Debug)]
pub struct VectorTable<'a> {
    bytes: &'a [u8],
}

impl<'a> VectorTable<'a> {
    /// `None` unless at least the stack pointer and reset vector are present.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        (bytes.len() >= 8).then_some(VectorTable { bytes })
    }

    /// Bytes of a table with `irq_count` peripheral interrupts.
    pub const fn table_len(irq_count: u16) -> usize {
        (CORE_SLOTS + irq_count as usize) * 4
    }

    pub fn slot(&self, slot: usize) -> Option<u32> {
        let word = self.bytes.get(slot * 4..slot * 4 + 4)?;
        Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
    }

    pub fn stack_top(&self) -> u32 {
        self.slot(0).unwrap_or(ERASED_WORD)
    }

    pub fn reset(&self) -> u32 {
        self.slot(1).unwrap_or(ERASED_WORD)
    }

    pub fn exception(&self, exception: Exception) -> Option<u32> {
        self.slot(exception.slot())
    }

    /// Reserved word `index` of [`RESERVED_SLOTS`].
    pub fn reserved(&self, index: usize) -> Option<u32> {
        self.slot(*RESERVED_SLOTS.get(index)?)
    }

    pub fn irq(&self, irq: u16) -> Option<u32> {
        self.slot(CORE_SLOTS + irq as usize)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Check {
    StackTop,
    Reset,
    Exception(Exception),
    /// Index into [`RESERVED_SLOTS`].
    Reserved(u8),
    Irq(u16),
}

impl Check {
    /// Lowest tier that runs this check.
    pub const fn tier(&self) -> CheckTier {
        match self {
            Check::StackTop | Check::Reset => CheckTier::Minimal,
            Check::Exception(_) => CheckTier::Extended,
            Check::Reserved(_) | Check::Irq(_) => CheckTier::Full,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Defect {
    /// The table ends before this slot.
    Missing,
    Null,
    /// Reads as erased flash.
    Erased,
    /// Handlers have to be Thumb code, so bit 0 must be set.
    NotThumb,
    OutsideApplication,
    OutsideRam,
    NotZero,
}

/// First check the vector table did not pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CheckFailure {
    /// Position of the check in the list of enabled checks.
    pub index: usize,
    pub check: Check,
    pub value: u32,
    pub defect: Defect,
}

pub struct Validator {
    app_base: Address,
    /// End of the application region, handlers must lie below.
    ceiling: Address,
    ram: RamRegion,
    irq_count: u16,
    tier: Option<CheckTier>,
}

impl Validator {
    /// Validator for an application ending at `ceiling`, the start of the metadata record or the end of flash.
    pub fn new(config: &Config, ceiling: Address) -> Self {
        Validator {
            app_base: config.app_base,
            ceiling,
            ram: config.ram,
            irq_count: config.irq_count.min(MAX_IRQS),
            tier: config.check_tier,
        }
    }

    /// Bytes of the vector table the enabled checks look at.
    pub fn table_len(&self) -> usize {
        match self.tier {
            Some(CheckTier::Minimal) | None => 8,
            Some(CheckTier::Extended) => VectorTable::table_len(0),
            Some(CheckTier::Full) => VectorTable::table_len(self.irq_count),
        }
    }

    /// Enabled checks, in the order they run.
    pub fn checks(&self) -> impl Iterator<Item = Check> + use<> {
        let tier = self.tier;
        [Check::StackTop, Check::Reset]
            .into_iter()
            .chain(Exception::ALL.into_iter().map(Check::Exception))
            .chain((0..RESERVED_SLOTS.len() as u8).map(Check::Reserved))
            .chain((0..self.irq_count).map(Check::Irq))
            .filter(move |check| tier.is_some_and(|tier| check.tier() <= tier))
    }

    /// Run the enabled checks in order, stopping at the first failure.
    ///
    /// Passing yields the [`Leap`] into the application.
    pub fn pre_check(&self, table: &VectorTable<'_>) -> Result<Leap, CheckFailure> {
        if self.tier.is_none() {
            log::warn!("vector table checks are disabled");
        }

        for (index, check) in self.checks().enumerate() {
            if let Err((value, defect)) = self.inspect(check, table) {
                log::error!(
                    "check {=usize} ({}) failed: {=u32:#x} is {}",
                    index,
                    check,
                    value,
                    defect
                );
                return Err(CheckFailure {
                    index,
                    check,
                    value,
                    defect,
                });
            }
        }

        Ok(Leap::new(self.app_base, table.stack_top(), table.reset()))
    }

    fn inspect(&self, check: Check, table: &VectorTable<'_>) -> Result<(), (u32, Defect)> {
        let value = match check {
            Check::StackTop => Some(table.stack_top()),
            Check::Reset => Some(table.reset()),
            Check::Exception(exception) => table.exception(exception),
            Check::Reserved(index) => table.reserved(index as usize),
            Check::Irq(irq) => table.irq(irq),
        };
        let Some(value) = value else {
            return Err((0, Defect::Missing));
        };

        let outcome = match check {
            Check::StackTop => self.stack_top(value),
            Check::Reserved(_) if value != 0 => Err(Defect::NotZero),
            Check::Reserved(_) => Ok(()),
            _ => self.handler(value),
        };
        outcome.map_err(|defect| (value, defect))
    }

    fn stack_top(&self, value: u32) -> Result<(), Defect> {
        match value {
            0 => Err(Defect::Null),
            ERASED_WORD => Err(Defect::Erased),
            _ if !self.ram.holds_stack_top(value) => Err(Defect::OutsideRam),
            _ => Ok(()),
        }
    }

    fn handler(&self, value: u32) -> Result<(), Defect> {
        let address = value & !1;
        match value {
            0 => Err(Defect::Null),
            ERASED_WORD => Err(Defect::Erased),
            _ if value & 1 == 0 => Err(Defect::NotThumb),
            _ if address < self.app_base || address >= self.ceiling => Err(Defect::OutsideApplication),
            _ => Ok(()),
        }
    }
}
