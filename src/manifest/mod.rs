//! Loading an image out of a self-describing container on block storage.
//!
//! The container header is read in two steps: one block to learn how large the header
//! is, then the rest of the header if it spans more than that one block. Payload stored
//! after the header is only fetched if the selected entry actually lives there, and then
//! only the blocks covering it.

use heapless::String;

use crate::{BlockDevice, ConfigFault, Error, SizeFault, block_index};

pub mod fdt;
pub mod fit;

pub use fit::{Entry, EntryFilter, Manifest};

/// Capacity of an entry name.
pub const NAME_LEN: usize = 32;

/// Memory that a container is loaded into.
///
/// `mem[0]` is at address `base`; the container header lands at the start and payload
/// lands at its offset within the container.
pub struct LoadWindow<'m> {
    pub base: u64,
    pub mem: &'m mut [u8],
}

impl<'m> LoadWindow<'m> {
    pub fn new(base: u64, mem: &'m mut [u8]) -> Self {
        Self { base, mem }
    }

    /// Bytes of a previously loaded image.
    pub fn image(&self, handle: &ManifestHandle) -> Option<&[u8]> {
        let start = usize::try_from(handle.load_address.checked_sub(self.base)?).ok()?;
        self.mem.get(start..start.checked_add(handle.length)?)
    }
}

/// An image that is ready in memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestHandle {
    pub load_address: u64,
    pub length: usize,
    pub name: Option<String<NAME_LEN>>,
    /// Load address requested by the entry. Informational; the image is not moved there.
    pub load_hint: Option<u64>,
}

/// Load the entry matching `filter` from the container at `area_offset`.
///
/// `area_size` bounds both the container header and any payload it points at.
pub async fn load<D: BlockDevice>(
    dev: &mut D,
    window: &mut LoadWindow<'_>,
    area_offset: u64,
    area_size: u64,
    filter: &EntryFilter<'_>,
) -> Result<ManifestHandle, Error> {
    let block_size = dev.block_size();
    if block_size < fdt::PROBE_LEN || !block_size.is_power_of_two() {
        return Err(Error::Config(ConfigFault::BlockSize));
    }
    let start = block_index(area_offset, block_size)?;

    let probe = window
        .mem
        .get_mut(..block_size)
        .ok_or(Error::Size(SizeFault::Window))?;
    dev.read_blocks(start, probe).await?;

    let total = fdt::total_size(probe)?;
    if total as u64 > area_size {
        return Err(Error::Size(SizeFault::Manifest));
    }

    let blocks = total.div_ceil(block_size);
    let loaded = blocks * block_size;
    if blocks > 1 {
        trace!("reading {} header blocks from {}", blocks, start);
        let header = window
            .mem
            .get_mut(..loaded)
            .ok_or(Error::Size(SizeFault::Window))?;
        dev.read_blocks(start, header).await?;
    }

    let Entry {
        name,
        offset,
        len,
        load_hint,
        hashes,
    } = Manifest::new(&window.mem[..total])?.find_entry(filter)?;
    let name: String<NAME_LEN> =
        String::try_from(name).map_err(|_| Error::Size(SizeFault::Name))?;

    let end = offset
        .checked_add(len)
        .ok_or(Error::Size(SizeFault::Payload))?;
    if end as u64 > area_size {
        return Err(Error::Size(SizeFault::Payload));
    }

    if end > loaded {
        let aligned = offset - offset % block_size;
        let count = (end - aligned).div_ceil(block_size);
        let first = start + (aligned / block_size) as u64;
        debug!(
            "reading {} payload blocks from {} for {}",
            count,
            first,
            name.as_str()
        );

        let payload = window
            .mem
            .get_mut(aligned..aligned + count * block_size)
            .ok_or(Error::Size(SizeFault::Window))?;
        dev.read_blocks(first, payload).await?;
    }

    let data = window
        .mem
        .get(offset..end)
        .ok_or(Error::Size(SizeFault::Window))?;
    for hash in &hashes {
        hash.verify(data)?;
    }
    if !hashes.is_empty() {
        debug!("{} hashes of {} match", hashes.len(), name.as_str());
    }

    let load_address = window
        .base
        .checked_add(offset as u64)
        .ok_or(Error::Size(SizeFault::Window))?;

    Ok(ManifestHandle {
        load_address,
        length: len,
        name: Some(name),
        load_hint,
    })
}
