mod fdt;

pub use fdt::FdtBuilder;

use std::vec::Vec;

use embedded_storage_async::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

use crate::{BlockDevice, BlockDeviceMut, Error, device::DeviceLookup};

/// In-memory block storage which records every access.
#[derive(Debug)]
pub struct MockBlockDevice {
    pub block_size: usize,
    pub data: Vec<u8>,
    /// `(first block, block count)` of each read, in order.
    pub reads: Vec<(u64, usize)>,
    pub writes: Vec<(u64, usize)>,
    /// Fail every access with [`Error::Io`].
    pub fail: bool,
}

impl MockBlockDevice {
    /// Blank device, reading back as erased flash.
    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self {
            block_size,
            data: std::vec![0xff; block_size * blocks],
            reads: Vec::new(),
            writes: Vec::new(),
            fail: false,
        }
    }

    /// Place `bytes` at `byte_offset` without going through the block interface.
    pub fn load(&mut self, byte_offset: usize, bytes: &[u8]) {
        self.data[byte_offset..byte_offset + bytes.len()].copy_from_slice(bytes);
    }

    fn range(&self, start: u64, len: usize) -> Result<core::ops::Range<usize>, Error> {
        assert_eq!(len % self.block_size, 0, "partial block access");
        if self.fail {
            return Err(Error::Io);
        }

        let from = start as usize * self.block_size;
        let to = from + len;
        if to > self.data.len() {
            return Err(Error::Io);
        }
        Ok(from..to)
    }
}

impl BlockDevice for MockBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn read_blocks(&mut self, start: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.reads.push((start, buf.len() / self.block_size));
        let range = self.range(start, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }
}

impl BlockDeviceMut for MockBlockDevice {
    async fn write_blocks(&mut self, start: u64, buf: &[u8]) -> Result<(), Error> {
        self.writes.push((start, buf.len() / self.block_size));
        let range = self.range(start, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}

/// A board with exactly one block device.
pub struct MockLookup {
    pub class: &'static str,
    pub index: u32,
    pub dev: MockBlockDevice,
}

impl MockLookup {
    pub fn new(class: &'static str, index: u32, dev: MockBlockDevice) -> Self {
        Self { class, index, dev }
    }
}

impl DeviceLookup for MockLookup {
    type Device = MockBlockDevice;

    fn find(&mut self, class: &str, index: u32) -> Option<&mut MockBlockDevice> {
        (class == self.class && index == self.index).then_some(&mut self.dev)
    }
}

/// NOR flash with byte granular reads and writes and 512 byte sectors.
pub struct MockFlash {
    pub data: Vec<u8>,
    pub erase_count: usize,
}

impl MockFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: std::vec![0xff; size],
            erase_count: 0,
        }
    }

    fn get(&self, from: u32, len: usize) -> Result<core::ops::Range<usize>, NorFlashErrorKind> {
        let from = from as usize;
        let to = from + len;
        if to > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        Ok(from..to)
    }
}

impl ErrorType for MockFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.get(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 512;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % Self::ERASE_SIZE != 0 || to as usize % Self::ERASE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.get(from, to.saturating_sub(from) as usize)?;
        self.data[range].fill(0xff);
        self.erase_count += 1;
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.get(offset, bytes.len())?;
        // NOR can only clear bits.
        for (cell, &b) in self.data[range].iter_mut().zip(bytes) {
            *cell &= b;
        }
        Ok(())
    }
}
