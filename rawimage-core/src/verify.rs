//! Byte-for-byte comparison of a device against an image file.
use crate::device::BlockAccess;
use crate::error::{Error, Result};
use crate::image::{Oversize, SourceImage};
use crate::sector_io::read_sectors;
use crate::session::{EngineState, Event, OperationContext, Outcome, Session, run_chunks};
use std::io::{Read, Seek};
use std::path::Path;
use tracing::info;

/// Compares `image_path` with the first sectors of `device`.
///
/// Oversized images are handled as for a write: `confirm_oversize` decides
/// whether only the part that fits is compared.
pub fn run<D, C, E>(
    ctx: &OperationContext,
    device: D,
    image_path: &Path,
    confirm_oversize: C,
    mut on_event: E,
) -> Result<Outcome>
where
    D: BlockAccess,
    C: FnOnce(&Oversize) -> bool,
    E: FnMut(Event),
{
    let _guard = ctx.enter(EngineState::Verifying)?;
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
        ctx.set_state(EngineState::Canceled);
        session.close()?;
        return Ok(Outcome::Canceled);
    };

    let outcome = compare(
        ctx,
        session.device(),
        &mut image,
        num_sectors,
        sector_size,
        &mut on_event,
    )?;
    session.close()?;
    Ok(outcome)
}

/// Compares `num_sectors` sectors of `device` and `image` chunk by chunk.
///
/// The first differing byte is reported as the sector that contains it.
pub(crate) fn compare<D, I, E>(
    ctx: &OperationContext,
    device: &mut D,
    image: &mut I,
    num_sectors: u64,
    sector_size: u64,
    on_event: &mut E,
) -> Result<Outcome>
where
    D: Read + Seek + ?Sized,
    I: Read + Seek + ?Sized,
    E: FnMut(Event),
{
    info!("verifying {num_sectors} sectors");
    let state = EngineState::Verifying;
    let outcome = run_chunks(ctx, state, num_sectors, sector_size, on_event, |start, count| {
        let expected = read_sectors(&mut *image, start, count, sector_size)?;
        let actual = read_sectors(&mut *device, start, count, sector_size)?;
        match first_difference(&expected, &actual) {
            None => Ok(()),
            Some(offset) => Err(Error::VerifyMismatch {
                sector: start + offset as u64 / sector_size,
            }),
        }
    })?;
    if outcome == Outcome::Completed {
        info!("verification passed");
    }
    Ok(outcome)
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b).position(|(x, y)| x != y)
}
