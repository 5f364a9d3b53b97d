//! Block view over NOR flash.
//!
//! Lets the boot area live on memory-mapped or SPI NOR flash, which has no notion of blocks
//! by itself. Writes erase every sector they touch before programming.

use embedded_storage_async::nor_flash::{NorFlash, ReadNorFlash};

use crate::{BlockDevice, BlockDeviceMut, ConfigFault, Error, SizeFault};

pub struct FlashBlocks<F> {
    flash: F,
    block_size: usize,
}

impl<F: ReadNorFlash> FlashBlocks<F> {
    /// Wrap `flash`, exposing it as blocks of `block_size` bytes.
    pub fn new(flash: F, block_size: usize) -> Result<Self, Error> {
        if block_size == 0
            || !block_size.is_power_of_two()
            || block_size % F::READ_SIZE != 0
            || block_size > crate::MAX_BLOCK_SIZE
        {
            return Err(Error::Config(ConfigFault::BlockSize));
        }
        Ok(Self { flash, block_size })
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn byte_range(&self, start: u64, len: usize) -> Result<(u32, u32), Error> {
        let from = start
            .checked_mul(self.block_size as u64)
            .and_then(|from| u32::try_from(from).ok())
            .ok_or(Error::Size(SizeFault::Offset))?;
        let to = u32::try_from(len)
            .ok()
            .and_then(|len| from.checked_add(len))
            .filter(|&to| to as usize <= self.flash.capacity())
            .ok_or(Error::Size(SizeFault::Offset))?;
        Ok((from, to))
    }
}

impl<F: ReadNorFlash> BlockDevice for FlashBlocks<F> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    async fn read_blocks(&mut self, start: u64, buf: &mut [u8]) -> Result<(), Error> {
        let (from, _) = self.byte_range(start, buf.len())?;
        self.flash.read(from, buf).await.map_err(|_| Error::Io)
    }
}

impl<F: NorFlash> BlockDeviceMut for FlashBlocks<F> {
    async fn write_blocks(&mut self, start: u64, buf: &[u8]) -> Result<(), Error> {
        if self.block_size % F::ERASE_SIZE != 0 || self.block_size % F::WRITE_SIZE != 0 {
            return Err(Error::Config(ConfigFault::BlockSize));
        }

        let (from, to) = self.byte_range(start, buf.len())?;
        self.flash.erase(from, to).await.map_err(|_| Error::Io)?;
        self.flash.write(from, buf).await.map_err(|_| Error::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFlash;

    #[test]
    fn read_and_write_blocks() {
        let mut blocks = FlashBlocks::new(MockFlash::new(4096), 512).unwrap();

        embassy_futures::block_on(async {
            blocks.write_blocks(2, &[0x5a; 512]).await.unwrap();

            let mut buf = [0u8; 1024];
            blocks.read_blocks(1, &mut buf).await.unwrap();
            assert!(buf[..512].iter().all(|&b| b == 0xff));
            assert!(buf[512..].iter().all(|&b| b == 0x5a));
        });

        let flash = blocks.into_inner();
        assert_eq!(flash.erase_count, 1);
    }

    #[test]
    fn out_of_bounds() {
        let mut blocks = FlashBlocks::new(MockFlash::new(4096), 512).unwrap();

        embassy_futures::block_on(async {
            let mut buf = [0u8; 512];
            assert_eq!(
                blocks.read_blocks(8, &mut buf).await,
                Err(Error::Size(SizeFault::Offset))
            );
        });
    }

    #[test]
    fn block_size_must_cover_flash_granularity() {
        assert!(matches!(
            FlashBlocks::new(MockFlash::new(4096), 3),
            Err(Error::Config(ConfigFault::BlockSize))
        ));
    }
}
