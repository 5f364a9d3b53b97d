//! Running the slot logic of one boot stage.
//!
//! A [`Bootflow`] is the context a stage owns for the duration of its run: the storage
//! geometry, the build-time slot table, the devices it can reach and its scratch memory.
//! Nothing here lives in a static.

use heapless::String;

use crate::{
    BlockDevice, BlockDeviceMut, BootStage, Error, Scratch, SizeFault, SlotChoice,
    config::ConfigDescriptor,
    device::{self, DeviceLookup},
    handoff::{StageHandoff, Stages},
    manifest::{self, EntryFilter, LoadWindow, ManifestHandle},
    select::{self, Selection, SelectorInput},
    state::{NvdataRecord, nvdata, version},
};

/// Capacity of the firmware version string.
pub const VERSION_LEN: usize = 256;

/// A region of the boot area, relative to its start plus the skip offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

/// Where the images of one slot live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotLayout {
    /// Container with the loader stage.
    pub loader: Region,
    /// Container with the main firmware.
    pub main: Region,
}

/// Fixed image locations for every slot, decided when the board is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotTable {
    pub a: SlotLayout,
    pub b: SlotLayout,
    pub recovery: SlotLayout,
}

impl SlotTable {
    pub const fn layout(&self, choice: SlotChoice) -> &SlotLayout {
        match choice {
            SlotChoice::A => &self.a,
            SlotChoice::B => &self.b,
            SlotChoice::Recovery => &self.recovery,
        }
    }
}

/// Persistent state as read at the start of a stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootState {
    /// Version text up to the first zero byte. Bytes that are not printable ASCII
    /// read back as `?`, so the string is not a byte-exact copy of the stored one.
    pub version: String<VERSION_LEN>,
    pub record: NvdataRecord,
    /// False if the stored record was unusable and `record` holds defaults.
    pub provisioned: bool,
}

/// What a stage run produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageOutcome {
    pub handle: ManifestHandle,
    pub pick: SlotChoice,
    /// Present when this stage made the decision itself.
    pub selection: Option<Selection>,
    pub state: Option<BootState>,
    /// Record to persist if the stage glue decides to commit the decision.
    pub pending: Option<NvdataRecord>,
}

pub struct Bootflow<'c, L> {
    config: &'c ConfigDescriptor,
    slots: &'c SlotTable,
    arch: Option<&'c str>,
    lookup: L,
    scratch: Scratch,
}

impl<'c, L: DeviceLookup> Bootflow<'c, L> {
    pub fn new(config: &'c ConfigDescriptor, slots: &'c SlotTable, lookup: L) -> Self {
        Self {
            config,
            slots,
            arch: None,
            lookup,
            scratch: Scratch::new(),
        }
    }

    /// Only accept images built for `arch`.
    pub fn with_arch(self, arch: &'c str) -> Self {
        Self {
            arch: Some(arch),
            ..self
        }
    }

    pub fn lookup(&mut self) -> &mut L {
        &mut self.lookup
    }

    /// Read the version string and decision record.
    ///
    /// A record that fails its integrity check is replaced by the default record.
    pub async fn read_state(&mut self) -> Result<BootState, Error> {
        let config = self.config;
        let dev = device::resolve(&mut self.lookup, &config.storage)?;
        config.validate(dev.block_size())?;

        let version = if config.version_size == 0 {
            String::new()
        } else {
            version::read(
                dev,
                &mut self.scratch,
                config.version_abs()?,
                config.version_size as usize,
            )
            .await?
        };

        let read = nvdata::read(
            dev,
            &mut self.scratch,
            config.state_abs()?,
            config.state_size as usize,
        )
        .await;
        let (record, provisioned) = match read {
            Ok(record) => (record, true),
            Err(err) if err.is_unprovisioned() => {
                warn!("state record unusable ({}), using defaults", err);
                (NvdataRecord::default(), false)
            }
            Err(err) => return Err(err),
        };

        Ok(BootState {
            version,
            record,
            provisioned,
        })
    }

    /// Load the image `stage` starts next for slot `choice`, and record the decision.
    ///
    /// The policy stage loads the slot's loader; a loader stage without a policy stage
    /// before it loads the main firmware directly. Either way the handoff records where
    /// the slot's main firmware lives.
    pub async fn build(
        &mut self,
        stage: BootStage,
        choice: SlotChoice,
        window: &mut LoadWindow<'_>,
        handoff: &mut [u8],
    ) -> Result<ManifestHandle, Error> {
        let layout = *self.slots.layout(choice);
        let image = match stage {
            BootStage::Policy => layout.loader,
            BootStage::Loader => layout.main,
        };
        self.check_region(image)?;
        self.check_region(layout.main)?;

        let offset = self.config.image_abs(image.offset)?;
        let handle = self.load(stage, offset, image.size, window).await?;

        StageHandoff {
            next_image_offset: self.config.image_abs(layout.main.offset)?,
            next_image_size: layout.main.size,
            pick: choice,
            stages: Stages::empty().with(stage),
        }
        .store(handoff)?;

        Ok(handle)
    }

    /// Run the slot logic for `stage`.
    ///
    /// If an earlier stage of this boot attempt already decided, its decision is used
    /// as is: the recorded image is loaded and the selector does not run again.
    pub async fn run(
        &mut self,
        stage: BootStage,
        window: &mut LoadWindow<'_>,
        handoff: &mut [u8],
    ) -> Result<StageOutcome, Error> {
        if let Some(recorded) = StageHandoff::load(handoff)? {
            if recorded.stages.any_before(stage) {
                info!("slot {} already picked", recorded.pick.as_str());
                let handle = self
                    .load(
                        stage,
                        recorded.next_image_offset,
                        recorded.next_image_size,
                        window,
                    )
                    .await?;
                StageHandoff::mark(handoff, stage)?;

                return Ok(StageOutcome {
                    handle,
                    pick: recorded.pick,
                    selection: None,
                    state: None,
                    pending: None,
                });
            }
        }

        let state = self.read_state().await?;
        let selection = select::select(SelectorInput::from_record(&state.record));
        info!(
            "picked slot {} (tries left {})",
            selection.choice.as_str(),
            selection.try_count.get()
        );

        let handle = self.build(stage, selection.choice, window, handoff).await?;
        let pending = state.record.with_selection(&selection);

        Ok(StageOutcome {
            handle,
            pick: selection.choice,
            selection: Some(selection),
            state: Some(state),
            pending: Some(pending),
        })
    }

    async fn load(
        &mut self,
        stage: BootStage,
        offset: u64,
        size: u64,
        window: &mut LoadWindow<'_>,
    ) -> Result<ManifestHandle, Error> {
        let filter = EntryFilter {
            phase: stage.next_phase(),
            arch: self.arch,
        };
        let dev = device::resolve(&mut self.lookup, &self.config.storage)?;
        manifest::load(dev, window, offset, size, &filter).await
    }

    fn check_region(&self, region: Region) -> Result<(), Error> {
        let end = self
            .config
            .skip_offset
            .checked_add(region.offset)
            .and_then(|start| start.checked_add(region.size));
        match end {
            Some(end) if region.size > 0 && end <= self.config.area_size => Ok(()),
            _ => Err(Error::Size(SizeFault::Area)),
        }
    }
}

impl<'c, L> Bootflow<'c, L>
where
    L: DeviceLookup,
    L::Device: BlockDeviceMut,
{
    /// Persist `record` as the new decision record.
    pub async fn commit(&mut self, record: &NvdataRecord) -> Result<(), Error> {
        let config = self.config;
        let dev = device::resolve(&mut self.lookup, &config.storage)?;
        config.validate(dev.block_size())?;

        nvdata::write(
            dev,
            &mut self.scratch,
            config.state_abs()?,
            config.state_size as usize,
            record,
        )
        .await
    }
}
