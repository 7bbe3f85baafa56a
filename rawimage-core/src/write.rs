//! Contains the logic for writing an image file to a device.
//!
//! A write runs in up to three stages:
//! 1.  Decompressing the image if it is compressed (`.gz`, `.xz`, `.zst`).
//! 2.  Writing the image to the device, sector by sector.
//! 3.  Optionally verifying the device against the image in the same
//!     session, before the device is unlocked.
use crate::device::BlockAccess;
use crate::error::{Error, IoStep, Result};
use crate::image::{Oversize, SourceImage};
use crate::sector_io::{read_sectors, write_sectors};
use crate::session::{EngineState, Event, OperationContext, Outcome, Session, run_chunks};
use crate::verify;
use std::path::Path;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteOptions {
    pub verify: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { verify: true }
    }
}

/// Writes an image file to a device, with optional verification.
///
/// When the image is larger than the device, `confirm_oversize` decides
/// between writing a truncated image and cancelling. Declining, or clearing
/// the running flag, ends the operation with [`Outcome::Canceled`].
///
/// # Errors
///
/// Fails on an empty image, if the device cannot be locked or sized, on any
/// transfer error, and with [`Error::VerifyMismatch`] when the verification
/// pass finds a difference.
pub fn run<D, C, E>(
    ctx: &OperationContext,
    device: D,
    image_path: &Path,
    options: &WriteOptions,
    confirm_oversize: C,
    mut on_event: E,
) -> Result<Outcome>
where
    D: BlockAccess,
    C: FnOnce(&Oversize) -> bool,
    E: FnMut(Event),
{
    let _guard = ctx.enter(EngineState::Writing)?;
    let mut image = match SourceImage::open(image_path, ctx.running(), |bytes| {
        on_event(Event::Decompressing { bytes })
    }) {
        Ok(image) => image,
        Err(Error::Cancelled) => {
            ctx.set_state(EngineState::Canceled);
            return Ok(Outcome::Canceled);
        }
        Err(e) => return Err(e),
    };

    let mut session = Session::open(device)?;
    let sector_size = session.geometry().sector_size;
    let Some(num_sectors) = image.fit(session.geometry(), confirm_oversize)? else {
        info!("oversized image declined");
        ctx.set_state(EngineState::Canceled);
        session.close()?;
        return Ok(Outcome::Canceled);
    };

    info!(
        "writing {num_sectors} sectors from {} to {}",
        image.origin().display(),
        session.device().path().display()
    );
    let state = EngineState::Writing;
    let outcome = run_chunks(ctx, state, num_sectors, sector_size, &mut on_event, |start, count| {
        let data = read_sectors(&mut image, start, count, sector_size)?;
        write_sectors(session.device(), &data, start, count, sector_size)
    })?;
    if outcome == Outcome::Canceled {
        session.close()?;
        return Ok(outcome);
    }

    session.device().flush().map_err(|source| Error::Io {
        step: IoStep::Flush,
        sector: num_sectors,
        source,
    })?;
    info!("write complete");

    let outcome = if options.verify {
        verify::compare(ctx, session.device(), &mut image, num_sectors, sector_size, &mut on_event)?
    } else {
        outcome
    };
    session.close()?;
    Ok(outcome)
}
