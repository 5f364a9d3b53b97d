//! Turning a storage specifier like `"mmc1"` into a concrete block device.

use heapless::String;

use crate::{BlockDevice, Error, SizeFault};

pub mod flash;

/// Room for a device class name, including the terminator it is displayed with.
pub const CLASS_NAME_LEN: usize = 16;

/// A parsed storage specifier: `<class><index>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSpec {
    pub class: String<{ CLASS_NAME_LEN - 1 }>,
    pub index: u32,
}

impl DeviceSpec {
    /// Split `spec` into its class name and the trailing run of decimal digits.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let digits = spec
            .bytes()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if digits == 0 {
            return Err(Error::NotFound);
        }

        let (class, index) = spec.split_at(spec.len() - digits);
        if class.is_empty() {
            return Err(Error::NotFound);
        }
        let index = index.parse::<u32>().map_err(|_| Error::NotFound)?;

        let mut name = String::new();
        name.push_str(class)
            .map_err(|_| Error::Size(SizeFault::DeviceClass))?;

        Ok(Self { class: name, index })
    }
}

/// Registry of the block devices a boot stage can reach.
pub trait DeviceLookup {
    type Device: BlockDevice;

    fn find(&mut self, class: &str, index: u32) -> Option<&mut Self::Device>;
}

/// Resolve a storage specifier to a device handle.
pub fn resolve<'a, L: DeviceLookup>(
    lookup: &'a mut L,
    spec: &str,
) -> Result<&'a mut L::Device, Error> {
    let spec = DeviceSpec::parse(spec)?;

    match lookup.find(&spec.class, spec.index) {
        Some(dev) => Ok(dev),
        None => {
            warn!("no block device {}{}", spec.class.as_str(), spec.index);
            Err(Error::NotFound)
        }
    }
}
