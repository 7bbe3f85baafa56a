//! Partition layout detection on a selected device.
use crate::device::BlockAccess;
use crate::error::Result;
use crate::partition::{GptLayout, Mbr, PartitionError, decode_gpt};
use crate::sector_io::read_sectors;
use crate::session::{EngineState, OperationContext, Session};
use tracing::{debug, info};

/// Sectors read from the start of the device for detection.
pub const DETECT_SECTORS: u64 = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detection {
    /// `None` when the device carries no GPT header.
    pub gpt: Option<GptLayout>,
    /// Furthest sector reached by the protective or legacy MBR, if any entry
    /// is populated.
    pub mbr_extent: Option<u64>,
}

/// Reads the first [`DETECT_SECTORS`] sectors of `device` and decodes its
/// partition tables.
pub fn run<D: BlockAccess>(ctx: &OperationContext, device: D) -> Result<Detection> {
    let _guard = ctx.enter(EngineState::Reading)?;
    let mut session = Session::open(device)?;
    let sector_size = session.geometry().sector_size;
    let count = DETECT_SECTORS.min(session.geometry().sector_count);

    let buf = read_sectors(session.device(), 0, count, sector_size)?;
    session.close()?;

    let mbr_extent = Mbr::parse(&buf).ok().map(|mbr| mbr.extent()).filter(|&e| e > 0);
    let gpt = match decode_gpt(&buf) {
        Ok(gpt) => {
            debug!("GPT header at byte {}", gpt.header_offset);
            info!(
                "{} partition(s), {} byte blocks ({})",
                gpt.partitions.len().saturating_sub(1),
                gpt.block_size,
                gpt.flash_kind()
            );
            Some(gpt)
        }
        Err(PartitionError::NoGptSignature) => {
            info!("no GPT header in the first {count} sectors");
            None
        }
        Err(e) => return Err(e.into()),
    };
    Ok(Detection { gpt, mbr_extent })
}
