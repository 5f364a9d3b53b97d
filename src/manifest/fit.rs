//! Image entries of a FIT container.
//!
//! Entries live under `/images`. Which one a boot stage wants is decided by the default
//! configuration under `/configurations` if there is one, otherwise by scanning every
//! image. An image without a `phase` property is usable by any stage.
//!
//! `hash*` subnodes of an entry are collected with it and checked once its payload is
//! in memory.

use crc::{CRC_32_ISO_HDLC, Crc};
use heapless::Vec;
use sha2::{Digest, Sha256};

use crate::{
    Error, FormatFault, SizeFault,
    manifest::fdt::{Fdt, Node},
};

/// Hash nodes checked per entry.
pub const MAX_HASHES: usize = 4;

/// Longest digest of any supported algorithm.
const MAX_DIGEST_LEN: usize = 32;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Which entry a boot stage is looking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryFilter<'f> {
    pub phase: &'f str,
    /// Only checked against images that declare an `arch`.
    pub arch: Option<&'f str>,
}

/// A located image entry; `offset` is relative to the start of the container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry<'a> {
    pub name: &'a str,
    pub offset: usize,
    pub len: usize,
    pub load_hint: Option<u64>,
    pub hashes: Vec<HashCheck, MAX_HASHES>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HashAlgo {
    Crc32,
    Sha256,
}

impl HashAlgo {
    fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "crc32" => Ok(HashAlgo::Crc32),
            "sha256" => Ok(HashAlgo::Sha256),
            _ => Err(Error::Format(FormatFault::HashAlgo)),
        }
    }
}

/// Expected digest of an entry's payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashCheck {
    pub algo: HashAlgo,
    pub value: Vec<u8, MAX_DIGEST_LEN>,
}

impl HashCheck {
    fn from_node(node: &Node<'_>) -> Result<Self, Error> {
        let algo = node
            .property("algo")?
            .ok_or(Error::Format(FormatFault::Structure))?;
        let algo = HashAlgo::from_name(algo.as_str()?)?;

        let value = node
            .property("value")?
            .ok_or(Error::Format(FormatFault::Structure))?;
        // A digest longer than any supported one can never match.
        let value = Vec::from_slice(value.value).map_err(|_| Error::Format(FormatFault::Hash))?;

        Ok(Self { algo, value })
    }

    /// Compare the digest of `data` against the stored one.
    pub fn verify(&self, data: &[u8]) -> Result<(), Error> {
        let matches = match self.algo {
            HashAlgo::Crc32 => self.value[..] == CRC32.checksum(data).to_be_bytes(),
            HashAlgo::Sha256 => self.value[..] == Sha256::digest(data)[..],
        };
        if matches {
            Ok(())
        } else {
            Err(Error::Format(FormatFault::Hash))
        }
    }
}

pub struct Manifest<'a> {
    fdt: Fdt<'a>,
    total_size: usize,
}

/// Configuration properties listing the images a configuration boots, in order.
const IMAGE_LISTS: [&str; 2] = ["firmware", "loadables"];

impl<'a> Manifest<'a> {
    pub fn new(blob: &'a [u8]) -> Result<Self, Error> {
        let fdt = Fdt::new(blob)?;
        let total_size = crate::manifest::fdt::total_size(blob)?;
        Ok(Self { fdt, total_size })
    }

    pub fn find_entry(&self, filter: &EntryFilter<'_>) -> Result<Entry<'a>, Error> {
        let root = self.fdt.root()?;
        let images = root
            .child("images")?
            .ok_or(Error::Format(FormatFault::NoEntry))?;

        if let Some(config) = self.default_config(&root)? {
            for list in IMAGE_LISTS {
                let Some(list) = config.property(list)? else {
                    continue;
                };
                for name in list.strings() {
                    let image = images
                        .child(name?)?
                        .ok_or(Error::Format(FormatFault::Structure))?;
                    if matches(&image, filter)? {
                        return self.entry(&image);
                    }
                }
            }
            return Err(Error::Format(FormatFault::NoEntry));
        }

        for image in images.children() {
            let image = image?;
            if matches(&image, filter)? {
                return self.entry(&image);
            }
        }
        Err(Error::Format(FormatFault::NoEntry))
    }

    fn default_config(&self, root: &Node<'a>) -> Result<Option<Node<'a>>, Error> {
        let Some(configs) = root.child("configurations")? else {
            return Ok(None);
        };
        let Some(default) = configs.property("default")? else {
            return Ok(None);
        };
        configs.child(default.as_str()?)
    }

    /// Resolve where the payload of `image` lives.
    ///
    /// `data-position` is absolute, `data-offset` counts from the end of the
    /// (4-byte aligned) container header, and `data` is embedded in the header.
    fn entry(&self, image: &Node<'a>) -> Result<Entry<'a>, Error> {
        let load_hint = image
            .property("load")?
            .map(|load| load.as_address())
            .transpose()?;

        let external = if let Some(position) = image.property("data-position")? {
            Some(position.as_u32()? as usize)
        } else if let Some(offset) = image.property("data-offset")? {
            let header = (self.total_size + 3) & !3;
            Some(header + offset.as_u32()? as usize)
        } else {
            None
        };

        let (offset, len) = match external {
            Some(offset) => {
                let size = image
                    .property("data-size")?
                    .ok_or(Error::Format(FormatFault::NoPayload))?;
                (offset, size.as_u32()? as usize)
            }
            None => {
                let data = image
                    .property("data")?
                    .ok_or(Error::Format(FormatFault::NoPayload))?;
                (data.offset, data.value.len())
            }
        };

        Ok(Entry {
            name: image.name(),
            offset,
            len,
            load_hint,
            hashes: hashes(image)?,
        })
    }
}

/// Hash checks of every `hash*` subnode of `image`, skipping those marked `hash-ignore`.
fn hashes(image: &Node<'_>) -> Result<Vec<HashCheck, MAX_HASHES>, Error> {
    let mut hashes = Vec::new();
    for node in image.children() {
        let node = node?;
        if !node.name().starts_with("hash") {
            continue;
        }
        if let Some(ignore) = node.property("hash-ignore")? {
            if ignore.as_u32().is_ok_and(|ignore| ignore != 0) {
                continue;
            }
        }
        hashes
            .push(HashCheck::from_node(&node)?)
            .map_err(|_| Error::Size(SizeFault::Hashes))?;
    }
    Ok(hashes)
}

fn matches(image: &Node<'_>, filter: &EntryFilter<'_>) -> Result<bool, Error> {
    if let Some(phase) = image.property("phase")? {
        if phase.as_str()? != filter.phase {
            return Ok(false);
        }
    }
    if let (Some(arch), Some(wanted)) = (image.property("arch")?, filter.arch) {
        if arch.as_str()? != wanted {
            return Ok(false);
        }
    }
    Ok(true)
}
