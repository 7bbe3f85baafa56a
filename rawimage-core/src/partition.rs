//! Read-only decoding of MBR and GPT partition tables.
//!
//! The MBR decoder answers one question: how far into the device do the
//! partitions reach. Some media report fewer sectors through their geometry
//! than a hidden trailing partition actually uses, so the read operation can
//! size its image from the table instead.
//!
//! The GPT decoder works on a raw buffer holding the first sectors of a
//! device and lists the partitions with byte addresses.
use crate::cursor::{self, ByteCursor};
use thiserror::Error;

pub const MBR_SIZE: usize = 512;
const MBR_TABLE_OFFSET: usize = 0x1BE;
const MBR_ENTRY_LEN: usize = 16;
const MBR_ENTRIES: usize = 4;

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_ENTRY_LEN: usize = 128;
pub const GPT_MAX_ENTRIES: usize = 128;
const GPT_FIRST_LBA: usize = 0x20;
const GPT_LAST_LBA: usize = 0x28;
const GPT_NAME: usize = 0x38;
const GPT_NAME_LEN: usize = 72;

/// Label of the pseudo-entry covering the table area in front of the first
/// partition.
pub const GPT_HEADER_LABEL: &str = "GPT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("need {wanted} bytes at offset {offset}, buffer holds {len}")]
    Truncated {
        offset: usize,
        wanted: usize,
        len: usize,
    },

    #[error("no GPT header signature found")]
    NoGptSignature,

    #[error("GPT header at offset {0} does not give a usable block size")]
    InvalidBlockSize(usize),
}

/// One of the four primary entries of an MBR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MbrEntry {
    pub start_lba: u32,
    pub sector_count: u32,
}

impl MbrEntry {
    /// First sector past the end of this partition.
    pub fn end(&self) -> u64 {
        u64::from(self.start_lba) + u64::from(self.sector_count)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mbr {
    pub entries: [MbrEntry; MBR_ENTRIES],
}

impl Mbr {
    /// Decodes the partition table of a 512-byte boot sector.
    pub fn parse(sector: &[u8]) -> Result<Self, PartitionError> {
        if sector.len() < MBR_SIZE {
            return Err(PartitionError::Truncated {
                offset: 0,
                wanted: MBR_SIZE,
                len: sector.len(),
            });
        }
        let mut entries = [MbrEntry::default(); MBR_ENTRIES];
        for (i, entry) in entries.iter_mut().enumerate() {
            let mut cursor = ByteCursor::at(sector, MBR_TABLE_OFFSET + MBR_ENTRY_LEN * i)?;
            cursor.skip(8)?;
            entry.start_lba = cursor.u32_le()?;
            entry.sector_count = cursor.u32_le()?;
        }
        Ok(Self { entries })
    }

    /// The furthest sector any entry reaches, i.e. `max(start + count)`.
    pub fn extent(&self) -> u64 {
        self.entries.iter().map(MbrEntry::end).max().unwrap_or(0)
    }
}

/// A decoded partition with byte addresses. `end_byte` is exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionExtent {
    pub name: String,
    pub start_byte: u64,
    pub size_bytes: u64,
    pub end_byte: u64,
}

/// The kind of flash storage suggested by the GPT block size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashKind {
    Ufs,
    Emmc,
}

impl std::fmt::Display for FlashKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashKind::Ufs => f.write_str("UFS"),
            FlashKind::Emmc => f.write_str("eMMC"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GptLayout {
    /// Byte offset of the `EFI PART` signature inside the scanned buffer.
    pub header_offset: usize,
    /// Logical block size used to turn LBAs into byte addresses.
    pub block_size: u64,
    /// The synthetic header entry followed by the real partitions.
    pub partitions: Vec<PartitionExtent>,
}

impl GptLayout {
    pub fn flash_kind(&self) -> FlashKind {
        if self.block_size == 0x1000 {
            FlashKind::Ufs
        } else {
            FlashKind::Emmc
        }
    }
}

/// Decodes the GPT found in `buf`, the first sectors of a device.
///
/// The header sits at LBA 1, so the offset where its signature is found is
/// taken as the logical block size, and the entry array is read from the
/// block after the header. Parsing stops at the first entry with an all-zero
/// first LBA, at [`GPT_MAX_ENTRIES`], or where the buffer ends.
pub fn decode_gpt(buf: &[u8]) -> Result<GptLayout, PartitionError> {
    let header_offset = cursor::find(buf, GPT_SIGNATURE).ok_or(PartitionError::NoGptSignature)?;
    if header_offset == 0 {
        return Err(PartitionError::InvalidBlockSize(header_offset));
    }
    let block_size = header_offset as u64;
    let mut partitions = Vec::new();

    let table_start = header_offset.checked_mul(2);
    for i in 0..GPT_MAX_ENTRIES {
        let Some(entry_offset) = table_start.and_then(|s| s.checked_add(GPT_ENTRY_LEN * i)) else {
            break;
        };
        let Some(entry) = buf
            .get(entry_offset..)
            .and_then(|rest| rest.get(..GPT_NAME + GPT_NAME_LEN))
        else {
            break;
        };

        let mut cursor = ByteCursor::at(entry, GPT_FIRST_LBA)?;
        let first_raw: [u8; 8] = cursor.array()?;
        if first_raw == [0u8; 8] {
            break;
        }
        let first_lba = u64::from_le_bytes(first_raw);
        cursor.seek(GPT_LAST_LBA)?;
        let last_lba = cursor.u64_le()?;
        cursor.seek(GPT_NAME)?;
        let name = cursor.utf16_le(GPT_NAME_LEN)?;

        let start_byte = first_lba.checked_mul(block_size).unwrap_or(0);
        let end_byte = last_lba
            .checked_mul(block_size)
            .and_then(|end| end.checked_add(block_size))
            .unwrap_or(0);

        if partitions.is_empty() {
            partitions.push(PartitionExtent {
                name: GPT_HEADER_LABEL.to_string(),
                start_byte: 0,
                size_bytes: start_byte,
                end_byte: start_byte,
            });
        }
        partitions.push(PartitionExtent {
            name,
            start_byte,
            size_bytes: end_byte.saturating_sub(start_byte),
            end_byte,
        });
    }

    Ok(GptLayout {
        header_offset,
        block_size,
        partitions,
    })
}
