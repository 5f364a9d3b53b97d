//! Decision handed from one boot stage to the next within a single boot attempt.
//!
//! The record lives in memory that survives the jump between stages but not a power
//! cycle. The stage that ran the selector writes it; later stages only add their bit.

use serde::{Deserialize, Serialize};

use crate::{BootStage, Error, FormatFault, SizeFault, SlotChoice};

/// Bytes reserved for the handoff record.
pub const HANDOFF_SIZE: usize = 64;

/// Tag marking a region that holds a record ("PICK").
const HANDOFF_MAGIC: [u8; 4] = *b"PICK";

/// Set of stages that have run the slot logic in this boot attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stages(u8);

impl Stages {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, stage: BootStage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub const fn with(self, stage: BootStage) -> Self {
        Self(self.0 | stage.bit())
    }

    /// Whether any stage running before `stage` is recorded.
    pub const fn any_before(self, stage: BootStage) -> bool {
        self.0 & (stage.bit() - 1) != 0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StageHandoff {
    /// Absolute byte offset of the main image container.
    pub next_image_offset: u64,
    pub next_image_size: u64,
    pub pick: SlotChoice,
    pub stages: Stages,
}

impl StageHandoff {
    /// Write the record into `region`, replacing whatever it held.
    pub fn store(&self, region: &mut [u8]) -> Result<(), Error> {
        let region = region
            .get_mut(..HANDOFF_SIZE)
            .ok_or(Error::Size(SizeFault::Handoff))?;
        region.fill(0);

        let (tag, body) = region.split_at_mut(HANDOFF_MAGIC.len());
        tag.copy_from_slice(&HANDOFF_MAGIC);
        postcard::to_slice(self, body).map_err(|_| Error::Size(SizeFault::Handoff))?;
        Ok(())
    }

    /// Read the record from `region`, or `None` if nothing was stored there.
    pub fn load(region: &[u8]) -> Result<Option<Self>, Error> {
        let region = region
            .get(..HANDOFF_SIZE)
            .ok_or(Error::Size(SizeFault::Handoff))?;

        let (tag, body) = region.split_at(HANDOFF_MAGIC.len());
        if tag != HANDOFF_MAGIC {
            return Ok(None);
        }
        postcard::from_bytes(body)
            .map(Some)
            .map_err(|_| Error::Format(FormatFault::Handoff))
    }

    /// Record that `stage` has run, leaving every other field as it was.
    pub fn mark(region: &mut [u8], stage: BootStage) -> Result<Self, Error> {
        let mut handoff = Self::load(region)?.ok_or(Error::Format(FormatFault::Handoff))?;
        handoff.stages = handoff.stages.with(stage);
        handoff.store(region)?;
        Ok(handoff)
    }
}
