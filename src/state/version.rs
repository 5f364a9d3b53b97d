use heapless::String;

use crate::{BlockDevice, ConfigFault, Error, Scratch, SizeFault, block_index};

/// Read the human-readable firmware version stored in the block at `byte_offset`.
///
/// At most `max_len - 1` characters are returned, stopping early at a zero byte.
/// Bytes that are not printable ASCII read back as `?`, which keeps the result valid
/// text at the cost of not being a byte-exact copy.
pub async fn read<D: BlockDevice, const N: usize>(
    dev: &mut D,
    scratch: &mut Scratch,
    byte_offset: u64,
    max_len: usize,
) -> Result<String<N>, Error> {
    let block_size = dev.block_size();
    if max_len == 0 {
        return Err(Error::Config(ConfigFault::Empty));
    }
    if max_len > block_size {
        return Err(Error::Config(ConfigFault::ExceedsBlock));
    }
    if max_len - 1 > N {
        return Err(Error::Size(SizeFault::Version));
    }
    let start = block_index(byte_offset, block_size)?;

    let buf = scratch.block(block_size)?;
    dev.read_blocks(start, buf).await?;

    let mut version = String::new();
    for &b in buf[..max_len - 1].iter().take_while(|&&b| b != 0) {
        let c = if b.is_ascii_graphic() || b == b' ' {
            b as char
        } else {
            '?'
        };
        version
            .push(c)
            .map_err(|_| Error::Size(SizeFault::Version))?;
    }

    Ok(version)
}
