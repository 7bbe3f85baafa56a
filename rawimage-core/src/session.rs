//! Engine state, operation scoping and the chunked transfer loop.
//!
//! Every operation runs inside an [`OperationContext::enter`] scope and owns
//! its device through a [`Session`]. Leaving the scope, whether by success,
//! error or cancellation, unlocks the device and returns the engine to
//! [`EngineState::Idle`] (or [`EngineState::Exit`] once an exit was
//! requested).
use crate::device::{BlockAccess, Device, Geometry};
use crate::error::{Error, Result};
use crate::progress::{Progress, RateTracker};
use crate::sector_io::{CHUNK_SECTORS, MAX_SECTOR_SIZE};
use crate::volume::ExclusiveVolume;
use std::cell::Cell;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Reading,
    Writing,
    Verifying,
    Canceled,
    Exit,
}

/// How an operation that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Canceled,
}

/// Notifications emitted while an operation runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    /// Bytes of a compressed image unpacked so far.
    Decompressing { bytes: u64 },
    /// A transfer phase began.
    Started {
        state: EngineState,
        total_sectors: u64,
        sector_size: u64,
    },
    Progress(Progress),
}

/// Shared state of the imaging engine.
///
/// The `running` flag is the only part meant to cross threads: a signal
/// handler clears it and the engine notices at the next chunk boundary.
#[derive(Debug)]
pub struct OperationContext {
    running: Arc<AtomicBool>,
    exit_requested: Cell<bool>,
    state: Cell<EngineState>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(true)))
    }
}

impl OperationContext {
    pub fn new(running: Arc<AtomicBool>) -> Self {
        Self {
            running,
            exit_requested: Cell::new(false),
            state: Cell::new(EngineState::Idle),
        }
    }

    pub fn running(&self) -> &Arc<AtomicBool> {
        &self.running
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    pub fn is_cancelled(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Re-arms the cancellation flag before a new operation.
    pub fn reset_cancel(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Asks the engine to end in [`EngineState::Exit`] once the current
    /// operation unwinds. Cancels that operation too.
    pub fn request_exit(&self) {
        self.exit_requested.set(true);
        self.running.store(false, Ordering::SeqCst);
        if self.state.get() == EngineState::Idle {
            self.state.set(EngineState::Exit);
        }
    }

    /// Starts an operation in `state`. Fails with [`Error::Busy`] unless the
    /// engine is idle.
    pub fn enter(&self, state: EngineState) -> Result<StateGuard<'_>> {
        if self.state.get() != EngineState::Idle {
            return Err(Error::Busy);
        }
        debug!("engine {state:?}");
        self.state.set(state);
        Ok(StateGuard { ctx: self })
    }

    pub(crate) fn set_state(&self, state: EngineState) {
        self.state.set(state);
    }
}

/// Returns the engine to idle when dropped.
#[derive(Debug)]
pub struct StateGuard<'a> {
    ctx: &'a OperationContext,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let next = if self.ctx.exit_requested.get() {
            EngineState::Exit
        } else {
            EngineState::Idle
        };
        debug!("engine {:?} -> {next:?}", self.ctx.state.get());
        self.ctx.state.set(next);
    }
}

/// One locked, dismounted device and its geometry.
#[derive(Debug)]
pub struct Session<D: BlockAccess> {
    volume: ExclusiveVolume<D>,
    geometry: Geometry,
}

impl<D: BlockAccess> Session<D> {
    /// Locks and dismounts `device`, then reads its geometry.
    pub fn open(device: D) -> Result<Self> {
        let mut volume = ExclusiveVolume::acquire(device)?;
        let geometry = volume.geometry()?;
        if geometry.sector_size == 0 {
            return Err(Error::Geometry {
                path: volume.path().to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidData, "zero sector size"),
            });
        }
        if geometry.sector_size > MAX_SECTOR_SIZE {
            return Err(Error::InvalidParameter {
                sector_size: geometry.sector_size,
                num_sectors: geometry.sector_count,
            });
        }
        if geometry.sector_count == 0 {
            return Err(Error::Geometry {
                path: volume.path().to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidData, "device reports zero sectors"),
            });
        }
        info!(
            "opened {}: {} sectors of {} bytes",
            volume.path().display(),
            geometry.sector_count,
            geometry.sector_size
        );
        Ok(Self { volume, geometry })
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn device(&mut self) -> &mut D {
        &mut self.volume
    }

    /// Unlocks the device, reporting an unlock failure.
    pub fn close(self) -> Result<()> {
        self.volume.release()
    }
}

/// Runs `step` over `[0, total)` in chunks of [`CHUNK_SECTORS`].
///
/// Cancellation is checked before each chunk, so a chunk that has started
/// always finishes. A progress event follows every chunk.
pub(crate) fn run_chunks<E, F>(
    ctx: &OperationContext,
    state: EngineState,
    total: u64,
    sector_size: u64,
    on_event: &mut E,
    mut step: F,
) -> Result<Outcome>
where
    E: FnMut(Event),
    F: FnMut(u64, u64) -> Result<()>,
{
    ctx.set_state(state);
    on_event(Event::Started {
        state,
        total_sectors: total,
        sector_size,
    });

    let mut tracker = RateTracker::new(sector_size, Instant::now());
    let mut done = 0;
    while done < total {
        if ctx.is_cancelled() {
            info!("{state:?} cancelled at sector {done} of {total}");
            ctx.set_state(EngineState::Canceled);
            return Ok(Outcome::Canceled);
        }
        let count = CHUNK_SECTORS.min(total - done);
        step(done, count)?;
        done += count;

        let (rate, remaining) = tracker.update(done, total, Instant::now());
        on_event(Event::Progress(Progress {
            state,
            done_sectors: done,
            total_sectors: total,
            sector_size,
            rate,
            remaining,
        }));
    }
    Ok(Outcome::Completed)
}

/// Refuses an image path that lives on one of the device's mount points.
pub fn ensure_distinct(image: &Path, device: &Device) -> Result<()> {
    let image_abs = normalize(&std::path::absolute(image).unwrap_or_else(|_| image.to_path_buf()));
    let on_target = device
        .mount_points
        .iter()
        .map(|mp| normalize(mp))
        .any(|mp| image_abs.starts_with(&mp));
    if on_target {
        return Err(Error::SourceOnTarget {
            image: image.to_path_buf(),
        });
    }
    Ok(())
}

fn normalize(path: &Path) -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path.to_path_buf()
    }
}
