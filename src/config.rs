//! Storage geometry of the boot area, as read from the device description.

use heapless::String;
use serde::{Deserialize, Serialize};

use crate::{ConfigFault, Error, SizeFault};

/// Capacity of the storage device specifier, e.g. `"mmc1"`.
pub const STORAGE_SPEC_LEN: usize = 32;

/// Where the boot area lives and how it is carved up.
///
/// Version and state offsets are relative to `area_start`.
/// Image regions are additionally shifted by `skip_offset`.
///
/// On the wire `skip_offset` is an optional trailing field after everything else;
/// descriptors that leave it out decode with a skip offset of 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    pub area_start: u64,
    pub area_size: u64,
    pub version_offset: u64,
    pub version_size: u32,
    pub state_offset: u64,
    pub state_size: u32,
    pub storage: String<STORAGE_SPEC_LEN>,
    #[serde(skip)]
    pub skip_offset: u64,
}

fn malformed(_: postcard::Error) -> Error {
    Error::Config(ConfigFault::Descriptor)
}

impl ConfigDescriptor {
    /// Decode a descriptor blob as provisioned in the device description.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let (mut config, rest): (Self, _) = postcard::take_from_bytes(bytes).map_err(malformed)?;
        if !rest.is_empty() {
            config.skip_offset = postcard::from_bytes(rest).map_err(malformed)?;
        }
        Ok(config)
    }

    /// Encode into `buf`, leaving out `skip_offset` when it is 0.
    pub fn to_slice<'b>(&self, buf: &'b mut [u8]) -> Result<&'b mut [u8], Error> {
        let mut len = postcard::to_slice(self, buf).map_err(malformed)?.len();
        if self.skip_offset != 0 {
            let rest = buf
                .get_mut(len..)
                .ok_or(Error::Config(ConfigFault::Descriptor))?;
            len += postcard::to_slice(&self.skip_offset, rest)
                .map_err(malformed)?
                .len();
        }
        Ok(&mut buf[..len])
    }

    /// Check the descriptor against the geometry of the device it refers to.
    pub fn validate(&self, block_size: usize) -> Result<(), Error> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::Config(ConfigFault::BlockSize));
        }
        let block = block_size as u64;

        if self.area_size == 0 || self.state_size == 0 || self.storage.is_empty() {
            return Err(Error::Config(ConfigFault::Empty));
        }
        if self.state_size as u64 > block || self.version_size as u64 > block {
            return Err(Error::Config(ConfigFault::ExceedsBlock));
        }
        if self.state_abs()? % block != 0 || self.version_abs()? % block != 0 {
            return Err(Error::Config(ConfigFault::Unaligned));
        }

        Ok(())
    }

    /// Absolute byte offset of the persistent state record.
    pub fn state_abs(&self) -> Result<u64, Error> {
        self.area_start
            .checked_add(self.state_offset)
            .ok_or(Error::Size(SizeFault::Offset))
    }

    /// Absolute byte offset of the version string block.
    pub fn version_abs(&self) -> Result<u64, Error> {
        self.area_start
            .checked_add(self.version_offset)
            .ok_or(Error::Size(SizeFault::Offset))
    }

    /// Absolute byte offset of an image region at `offset` within the area.
    pub fn image_abs(&self, offset: u64) -> Result<u64, Error> {
        self.area_start
            .checked_add(self.skip_offset)
            .and_then(|start| start.checked_add(offset))
            .ok_or(Error::Size(SizeFault::Offset))
    }
}
