//! Persistent boot state: the decision record and the firmware version string.

use serde::{Deserialize, Serialize};

use crate::{SlotChoice, select::Selection};

pub mod nvdata;
pub mod version;

/// Remaining boot attempts for a tentatively selected slot, `0..=15`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TryCount(u8);

impl TryCount {
    pub const MAX: TryCount = TryCount(15);

    pub const fn new(count: u8) -> Option<Self> {
        if count <= Self::MAX.0 {
            Some(Self(count))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn is_exhausted(self) -> bool {
        self.0 == 0
    }

    /// One attempt fewer, never going below zero.
    pub const fn decrement(self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

/// Recorded result of the previous boot attempt of the alternate slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TryOutcome {
    /// Nothing is being tried, or the last try succeeded.
    #[default]
    None,
    /// The alternate slot is being tried.
    Trying,
    /// The alternate slot ran out of attempts.
    Bad,
}

/// The decoded persistent decision record.
///
/// Only ever constructed from a record that passed its integrity checks, or as the
/// all-default record that replaces one that did not.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NvdataRecord {
    /// Bits 31:16 hold the key version, bits 15:0 the firmware version.
    pub firmware_version_number: u32,
    pub try_count: TryCount,
    /// The alternate slot is requested.
    pub try_b: bool,
    /// Recovery is requested unconditionally.
    pub recovery: bool,
    /// Slot picked last time.
    pub pick: SlotChoice,
    pub try_result: TryOutcome,
}

impl NvdataRecord {
    pub const fn key_version(&self) -> u16 {
        (self.firmware_version_number >> 16) as u16
    }

    pub const fn version(&self) -> u16 {
        self.firmware_version_number as u16
    }

    /// The record as it should be persisted after `selection` was acted upon.
    pub fn with_selection(self, selection: &Selection) -> Self {
        Self {
            pick: selection.choice,
            try_count: selection.try_count,
            try_result: selection.outcome,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_count_range() {
        assert_eq!(TryCount::new(15), Some(TryCount::MAX));
        assert_eq!(TryCount::new(16), None);
        assert_eq!(TryCount::new(0).unwrap().decrement().get(), 0);
        assert_eq!(TryCount::new(3).unwrap().decrement().get(), 2);
    }

    #[test]
    fn version_halves() {
        let record = NvdataRecord {
            firmware_version_number: 0x0002_0105,
            ..Default::default()
        };

        assert_eq!(record.key_version(), 2);
        assert_eq!(record.version(), 0x105);
    }
}
