//! A/B/Recovery slot selection for multi-stage bootloaders.
//!
//! Reads the persistent boot decision from block storage, picks the slot to boot,
//! loads the matching image out of a self-describing container, and hands the decision
//! over to later boot stages so it is never re-evaluated halfway through a boot attempt.
#![no_std]

// Must come first, the logging macros are used by every other module.
mod fmt;

pub mod bootflow;
pub mod config;
pub mod device;
pub mod handoff;
pub mod manifest;
pub mod select;
pub mod state;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

use serde::{Deserialize, Serialize};

/// Largest storage block this crate can buffer.
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Storage that can only be read in whole, fixed-size blocks.
#[allow(async_fn_in_trait)]
pub trait BlockDevice {
    /// Size of a single block in bytes. Always a power of two.
    fn block_size(&self) -> usize;

    /// Read `buf.len() / block_size()` blocks, starting at block index `start`.
    ///
    /// The length of `buf` is always a whole number of blocks.
    async fn read_blocks(&mut self, start: u64, buf: &mut [u8]) -> Result<(), Error>;
}

/// Block storage which can also be written.
#[allow(async_fn_in_trait)]
pub trait BlockDeviceMut: BlockDevice {
    /// Write `buf.len() / block_size()` blocks, starting at block index `start`.
    async fn write_blocks(&mut self, start: u64, buf: &[u8]) -> Result<(), Error>;
}

/// One of the interchangeable firmware image sets the device can boot from.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotChoice {
    #[default]
    A,
    B,
    Recovery,
}

impl SlotChoice {
    pub const fn as_str(self) -> &'static str {
        match self {
            SlotChoice::A => "a",
            SlotChoice::B => "b",
            SlotChoice::Recovery => "recovery",
        }
    }
}

/// Boot stages that take part in slot selection, in the order they run.
///
/// The earliest loader never touches any of this and has no entry here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootStage {
    /// Reads the persistent state, picks the slot and loads that slot's loader.
    Policy,
    /// Loads the main firmware of the slot picked before it.
    Loader,
}

impl BootStage {
    pub const fn bit(self) -> u8 {
        1 << self as u8
    }

    /// The `phase` of the image this stage loads for the next one.
    pub const fn next_phase(self) -> &'static str {
        match self {
            BootStage::Policy => "loader",
            BootStage::Loader => "firmware",
        }
    }
}

/// Scratch memory of exactly one maximum-sized block.
///
/// Owned by whoever drives a boot stage and lent to every read that needs to
/// stage a single block before picking bytes out of it.
pub struct Scratch {
    buf: [u8; MAX_BLOCK_SIZE],
}

impl Scratch {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_BLOCK_SIZE],
        }
    }

    /// The first `block_size` bytes of scratch, or an error if a block does not fit.
    pub(crate) fn block(&mut self, block_size: usize) -> Result<&mut [u8], Error> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::Config(ConfigFault::BlockSize));
        }
        self.buf
            .get_mut(..block_size)
            .ok_or(Error::Config(ConfigFault::BlockSize))
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(ConfigFault),
    #[error("block device read or write failed")]
    Io,
    #[error("persistent state failed integrity check: {0}")]
    Integrity(IntegrityFault),
    #[error("{0} does not fit its reserved space")]
    Size(SizeFault),
    #[error("storage device not found")]
    NotFound,
    #[error("malformed container: {0}")]
    Format(FormatFault),
}

impl Error {
    /// Whether this error means "no usable state was ever written".
    ///
    /// Blank, erased and corrupt records all land here; callers continue with
    /// a default record instead of aborting the boot.
    pub const fn is_unprovisioned(&self) -> bool {
        matches!(self, Error::Integrity(_))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigFault {
    #[error("offset is not aligned to the storage block size")]
    Unaligned,
    #[error("region is larger than one storage block")]
    ExceedsBlock,
    #[error("unsupported storage block size")]
    BlockSize,
    #[error("region is empty")]
    Empty,
    #[error("descriptor could not be decoded")]
    Descriptor,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IntegrityFault {
    #[error("unsupported header version {0}")]
    HeaderVersion(u8),
    #[error("crc mismatch (stored {stored:#04x}, computed {computed:#04x})")]
    Crc { stored: u8, computed: u8 },
    #[error("field holds an impossible value")]
    Field,
    #[error("declared record size is out of range")]
    Size,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SizeFault {
    #[error("state record")]
    Record,
    #[error("version string")]
    Version,
    #[error("container header")]
    Manifest,
    #[error("image payload")]
    Payload,
    #[error("load window")]
    Window,
    #[error("entry name")]
    Name,
    #[error("device class name")]
    DeviceClass,
    #[error("stage handoff")]
    Handoff,
    #[error("byte offset")]
    Offset,
    #[error("slot region")]
    Area,
    #[error("hash list")]
    Hashes,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FormatFault {
    #[error("bad magic")]
    Magic,
    #[error("truncated or inconsistent structure")]
    Structure,
    #[error("no entry for this boot stage")]
    NoEntry,
    #[error("entry has no payload location")]
    NoPayload,
    #[error("stage handoff could not be decoded")]
    Handoff,
    #[error("payload does not match its hash")]
    Hash,
    #[error("unsupported hash algorithm")]
    HashAlgo,
}

/// Convert a byte offset to a block index, requiring block alignment.
pub(crate) fn block_index(byte_offset: u64, block_size: usize) -> Result<u64, Error> {
    let block_size = block_size as u64;
    if block_size == 0 {
        return Err(Error::Config(ConfigFault::BlockSize));
    }
    if byte_offset % block_size != 0 {
        return Err(Error::Config(ConfigFault::Unaligned));
    }
    Ok(byte_offset / block_size)
}
