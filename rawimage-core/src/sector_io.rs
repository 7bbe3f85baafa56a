//! Validated, block-aligned transfers against an open device or file.
//!
//! Every call is one bounded transfer. Callers move data in chunks of
//! [`CHUNK_SECTORS`]; nothing in here splits a request.
use crate::error::{Error, IoStep, Result};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

/// Largest sector size accepted by the transfer functions.
pub const MAX_SECTOR_SIZE: u64 = 65536;

/// Number of sectors moved per engine transfer.
pub const CHUNK_SECTORS: u64 = 1024;

/// Checks the sector arithmetic of a transfer and returns the byte offset and
/// byte length it covers.
///
/// The products are never formed before the reciprocal division test has
/// shown they fit in a `u64`.
pub fn span(start_sector: u64, num_sectors: u64, sector_size: u64) -> Result<(u64, usize)> {
    if sector_size == 0 || sector_size > MAX_SECTOR_SIZE || num_sectors == 0 {
        return Err(Error::InvalidParameter {
            sector_size,
            num_sectors,
        });
    }
    if start_sector > u64::MAX / sector_size {
        return Err(Error::Overflow {
            what: "sector offset",
            value: start_sector,
            sector_size,
        });
    }
    if num_sectors > u64::MAX / sector_size {
        return Err(Error::Overflow {
            what: "buffer size",
            value: num_sectors,
            sector_size,
        });
    }
    let len = usize::try_from(num_sectors * sector_size).map_err(|_| Error::Overflow {
        what: "buffer size",
        value: num_sectors,
        sector_size,
    })?;
    Ok((start_sector * sector_size, len))
}

/// Reads `num_sectors` sectors starting at `start_sector`.
///
/// The returned buffer is always `num_sectors * sector_size` bytes long. When
/// the source ends early the tail is zero-filled.
pub fn read_sectors<H>(
    handle: &mut H,
    start_sector: u64,
    num_sectors: u64,
    sector_size: u64,
) -> Result<Vec<u8>>
where
    H: Read + Seek + ?Sized,
{
    let (offset, len) = span(start_sector, num_sectors, sector_size)?;

    handle
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::Io {
            step: IoStep::Seek,
            sector: start_sector,
            source,
        })?;

    let mut data = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match handle.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(Error::Io {
                    step: IoStep::Read,
                    sector: start_sector,
                    source,
                });
            }
        }
    }
    // `vec!` zeroed the buffer, so anything past `filled` is already padding.
    Ok(data)
}

/// Writes `data` as `num_sectors` sectors starting at `start_sector`.
///
/// The write succeeds only if the handle accepts every byte in one transfer;
/// a short count is reported as [`Error::IncompleteWrite`].
pub fn write_sectors<H>(
    handle: &mut H,
    data: &[u8],
    start_sector: u64,
    num_sectors: u64,
    sector_size: u64,
) -> Result<()>
where
    H: Write + Seek + ?Sized,
{
    let (offset, len) = span(start_sector, num_sectors, sector_size)?;
    if data.len() != len {
        return Err(Error::InvalidParameter {
            sector_size,
            num_sectors,
        });
    }

    handle
        .seek(SeekFrom::Start(offset))
        .map_err(|source| Error::Io {
            step: IoStep::Seek,
            sector: start_sector,
            source,
        })?;

    let written = handle.write(data).map_err(|source| Error::Io {
        step: IoStep::Write,
        sector: start_sector,
        source,
    })?;
    if written != len {
        return Err(Error::IncompleteWrite {
            sector: start_sector,
            expected: len,
            written,
        });
    }
    Ok(())
}

/// Size of a byte length in whole sectors, rounding a partial sector up.
pub fn sectors_for_len(len: u64, sector_size: u64) -> u64 {
    if sector_size == 0 {
        return 0;
    }
    len / sector_size + u64::from(len % sector_size != 0)
}
