//! On-media decision record.
//!
//! The record fits in a single storage block:
//!
//! | Offset | Size | Field                                                         |
//! |--------|------|---------------------------------------------------------------|
//! | 0      | 1    | CRC-8 over bytes `[1, data_size)`                             |
//! | 1      | 1    | bits 3:0 format version, bits 7:4 size exponent               |
//! | 2      | 2    | reserved, zero                                                |
//! | 4      | 4    | firmware version number (little endian)                       |
//! | 8      | 4    | flags: 3:0 try count, 4 try B, 5 recovery, 7:6 pick, 9:8 result |
//! | 12     | ..   | spare up to `data_size`                                       |
//!
//! Any torn, blank or erased record fails the version or CRC check and is reported
//! as [`Error::Integrity`], which callers treat as "never written".

use crc::{Algorithm, Crc};

use crate::{
    BlockDevice, BlockDeviceMut, ConfigFault, Error, IntegrityFault, Scratch, SizeFault,
    SlotChoice, block_index,
    state::{NvdataRecord, TryCount, TryOutcome},
};

/// The one record format version understood here.
pub const FORMAT_VERSION: u8 = 1;

/// Largest record, in bytes.
pub const MAX_RECORD_SIZE: usize = 64;

/// Smallest record that still covers every decoded field with its CRC.
pub const MIN_RECORD_SIZE: usize = 16;

const OFFSET_CRC: usize = 0;
const OFFSET_HEADER: usize = 1;
const RESERVED: core::ops::Range<usize> = 2..4;
const FIRMWARE_VERSION: core::ops::Range<usize> = 4..8;
const FLAGS: core::ops::Range<usize> = 8..12;

const HEADER_VERSION_MASK: u8 = 0x0f;
const HEADER_SIZE_SHIFT: u32 = 4;

const FLAG_TRY_COUNT_MASK: u32 = 0xf;
const FLAG_TRY_B: u32 = 1 << 4;
const FLAG_RECOVERY: u32 = 1 << 5;
const FLAG_PICK_SHIFT: u32 = 6;
const FLAG_RESULT_SHIFT: u32 = 8;
const FLAG_TWO_BIT_MASK: u32 = 0x3;

/// CRC-8 with polynomial 0x31, zero initial value and no reflection.
const CRC_8_NVDATA: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xa2,
    residue: 0x00,
};

const CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_NVDATA);

fn check_region(block_size: usize, byte_size: usize) -> Result<(), Error> {
    if byte_size == 0 {
        return Err(Error::Config(ConfigFault::Empty));
    }
    if byte_size > block_size {
        return Err(Error::Config(ConfigFault::ExceedsBlock));
    }
    Ok(())
}

/// Read and verify the decision record stored at `byte_offset`.
///
/// `byte_offset` must be block aligned and `byte_size` must not exceed one block.
pub async fn read<D: BlockDevice>(
    dev: &mut D,
    scratch: &mut Scratch,
    byte_offset: u64,
    byte_size: usize,
) -> Result<NvdataRecord, Error> {
    let block_size = dev.block_size();
    check_region(block_size, byte_size)?;
    let start = block_index(byte_offset, block_size)?;

    let buf = scratch.block(block_size)?;
    dev.read_blocks(start, buf).await?;

    decode(&buf[..byte_size])
}

/// Persist `record` at `byte_offset`, leaving the rest of its block untouched.
///
/// Nothing in this crate calls this on its own; when to commit a selection is up to
/// the stage glue.
pub async fn write<D: BlockDeviceMut>(
    dev: &mut D,
    scratch: &mut Scratch,
    byte_offset: u64,
    byte_size: usize,
    record: &NvdataRecord,
) -> Result<(), Error> {
    let block_size = dev.block_size();
    check_region(block_size, byte_size)?;
    let start = block_index(byte_offset, block_size)?;

    let buf = scratch.block(block_size)?;
    dev.read_blocks(start, buf).await?;
    encode(record, &mut buf[..byte_size])?;

    debug!("writing state record at block {}", start);
    dev.write_blocks(start, buf).await
}

/// Verify and decode a raw record.
///
/// A region shorter than the smallest record is a [`SizeFault::Record`]. A header
/// declaring a size the region cannot hold is treated like any other corruption.
pub fn decode(raw: &[u8]) -> Result<NvdataRecord, Error> {
    if raw.len() < MIN_RECORD_SIZE {
        return Err(Error::Size(SizeFault::Record));
    }
    let header = raw[OFFSET_HEADER];

    let version = header & HEADER_VERSION_MASK;
    if version != FORMAT_VERSION {
        return Err(Error::Integrity(IntegrityFault::HeaderVersion(version)));
    }

    let data_size = 1usize << (header >> HEADER_SIZE_SHIFT);
    let capacity = usize::min(raw.len(), MAX_RECORD_SIZE);
    if data_size < MIN_RECORD_SIZE || data_size > capacity {
        return Err(Error::Integrity(IntegrityFault::Size));
    }

    let stored = raw[OFFSET_CRC];
    let computed = CRC.checksum(&raw[OFFSET_HEADER..data_size]);
    if stored != computed {
        return Err(Error::Integrity(IntegrityFault::Crc { stored, computed }));
    }

    if raw[RESERVED].iter().any(|&b| b != 0) {
        return Err(Error::Integrity(IntegrityFault::Field));
    }

    let firmware_version_number = read_u32(&raw[FIRMWARE_VERSION]);
    let flags = read_u32(&raw[FLAGS]);

    Ok(NvdataRecord {
        firmware_version_number,
        try_count: try_count_from_flags(flags)?,
        try_b: flags & FLAG_TRY_B != 0,
        recovery: flags & FLAG_RECOVERY != 0,
        pick: pick_from_flags(flags)?,
        try_result: result_from_flags(flags)?,
    })
}

/// Encode `record` into `out`, using the largest record size `out` can hold.
///
/// Bytes of `out` past the record are left alone.
pub fn encode(record: &NvdataRecord, out: &mut [u8]) -> Result<(), Error> {
    let capacity = usize::min(out.len(), MAX_RECORD_SIZE);
    if capacity < MIN_RECORD_SIZE {
        return Err(Error::Size(SizeFault::Record));
    }
    // Round down to a power of two.
    let exponent = usize::BITS - 1 - capacity.leading_zeros();
    let data_size = 1usize << exponent;

    let raw = &mut out[..data_size];
    raw.fill(0);
    raw[OFFSET_HEADER] = FORMAT_VERSION | ((exponent as u8) << HEADER_SIZE_SHIFT);
    raw[FIRMWARE_VERSION].copy_from_slice(&record.firmware_version_number.to_le_bytes());
    raw[FLAGS].copy_from_slice(&flags_from_record(record).to_le_bytes());
    raw[OFFSET_CRC] = CRC.checksum(&raw[OFFSET_HEADER..]);

    Ok(())
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    u32::from_le_bytes(word)
}

fn try_count_from_flags(flags: u32) -> Result<TryCount, Error> {
    TryCount::new((flags & FLAG_TRY_COUNT_MASK) as u8)
        .ok_or(Error::Integrity(IntegrityFault::Field))
}

fn pick_from_flags(flags: u32) -> Result<SlotChoice, Error> {
    match (flags >> FLAG_PICK_SHIFT) & FLAG_TWO_BIT_MASK {
        0 => Ok(SlotChoice::A),
        1 => Ok(SlotChoice::B),
        2 => Ok(SlotChoice::Recovery),
        _ => Err(Error::Integrity(IntegrityFault::Field)),
    }
}

fn result_from_flags(flags: u32) -> Result<TryOutcome, Error> {
    match (flags >> FLAG_RESULT_SHIFT) & FLAG_TWO_BIT_MASK {
        0 => Ok(TryOutcome::None),
        1 => Ok(TryOutcome::Trying),
        2 => Ok(TryOutcome::Bad),
        _ => Err(Error::Integrity(IntegrityFault::Field)),
    }
}

fn flags_from_record(record: &NvdataRecord) -> u32 {
    let pick = match record.pick {
        SlotChoice::A => 0,
        SlotChoice::B => 1,
        SlotChoice::Recovery => 2,
    };
    let result = match record.try_result {
        TryOutcome::None => 0,
        TryOutcome::Trying => 1,
        TryOutcome::Bad => 2,
    };

    let mut flags = record.try_count.get() as u32 & FLAG_TRY_COUNT_MASK;
    if record.try_b {
        flags |= FLAG_TRY_B;
    }
    if record.recovery {
        flags |= FLAG_RECOVERY;
    }
    flags | (pick << FLAG_PICK_SHIFT) | (result << FLAG_RESULT_SHIFT)
}
