pub mod flash;
pub mod medium;

use std::collections::BTreeMap;

use crate::Address;

pub use flash::SimulatedFlash;
pub use medium::{MockImage, MockMedium};

/// Erase count per sector, by sector start address.
#[derive(Clone, Debug)]
pub struct WearTracker(BTreeMap<Address, usize>);

impl WearTracker {
    pub const fn new() -> Self {
        WearTracker(BTreeMap::new())
    }

    pub fn increase(&mut self, sector: Address) {
        if let Some(wear) = self.0.get_mut(&sector) {
            *wear += 1;
        } else {
            self.0.insert(sector, 1);
        }
    }

    pub fn erases(&self, sector: Address) -> usize {
        self.0.get(&sector).copied().unwrap_or(0)
    }

    /// Check wear on all sectors for worst wear.
    pub fn check(&self, wear_level: usize) -> bool {
        self.0.values().all(|v| *v <= wear_level)
    }
}
