//! Contains the logic for reading a device into an image file.
use crate::device::BlockAccess;
use crate::error::{Error, IoStep, Result};
use crate::partition::{MBR_SIZE, Mbr};
use crate::sector_io::{read_sectors, sectors_for_len, write_sectors};
use crate::session::{EngineState, Event, OperationContext, Outcome, Session, run_chunks};
use crate::space::FreeSpace;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Size the image from the MBR partition table instead of the device
    /// geometry, so unallocated space past the last partition is skipped and
    /// a trailing partition the geometry under-reports is kept.
    pub allocated_only: bool,
}

/// Reads a device sector by sector into `image_path`.
///
/// The device is locked and dismounted for the whole transfer. Before the
/// image file is created, the destination filesystem must have room for
/// the sectors the existing file (if any) does not already cover.
///
/// A cancelled read deletes the partial image and returns
/// [`Outcome::Canceled`].
///
/// # Errors
///
/// Fails if the device cannot be locked or sized, if there is not enough
/// free space, or on any sector transfer error. The device is unlocked
/// before the error is returned.
pub fn run<D, S, E>(
    ctx: &OperationContext,
    device: D,
    image_path: &Path,
    options: &ReadOptions,
    space: &S,
    mut on_event: E,
) -> Result<Outcome>
where
    D: BlockAccess,
    S: FreeSpace + ?Sized,
    E: FnMut(Event),
{
    let _guard = ctx.enter(EngineState::Reading)?;
    let mut session = Session::open(device)?;
    let geometry = session.geometry();
    let sector_size = geometry.sector_size;

    let num_sectors = if options.allocated_only {
        let boot_sectors = sectors_for_len(MBR_SIZE as u64, sector_size);
        let boot = read_sectors(session.device(), 0, boot_sectors, sector_size)?;
        let extent = Mbr::parse(&boot)?.extent();
        debug!("MBR extent {extent} sectors, geometry {} sectors", geometry.sector_count);
        extent.max(1)
    } else {
        geometry.sector_count
    };

    let existing = fs::metadata(image_path).map(|m| m.len() / sector_size).unwrap_or(0);
    let needed = num_sectors.saturating_sub(existing).saturating_mul(sector_size);
    let available = space.available(image_path)?;
    if needed > available {
        return Err(Error::Space { needed, available });
    }

    let handle_err = |source| Error::Handle {
        path: image_path.to_path_buf(),
        source,
    };
    let mut image = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(image_path)
        .map_err(handle_err)?;

    info!(
        "reading {num_sectors} sectors from {} into {}",
        session.device().path().display(),
        image_path.display()
    );
    let state = EngineState::Reading;
    let outcome = run_chunks(ctx, state, num_sectors, sector_size, &mut on_event, |start, count| {
        let data = read_sectors(session.device(), start, count, sector_size)?;
        write_sectors(&mut image, &data, start, count, sector_size)
    })?;

    if outcome == Outcome::Canceled {
        drop(image);
        if let Err(e) = fs::remove_file(image_path) {
            warn!("could not remove partial image {}: {e}", image_path.display());
        }
        session.close()?;
        return Ok(outcome);
    }

    finish(&mut image, num_sectors)?;
    session.close()?;
    info!("read complete");
    Ok(outcome)
}

fn finish(image: &mut File, num_sectors: u64) -> Result<()> {
    let flush_err = |source| Error::Io {
        step: IoStep::Flush,
        sector: num_sectors,
        source,
    };
    image.flush().map_err(flush_err)?;
    image.sync_all().map_err(flush_err)
}
