//! Exclusive access to a device: lock, dismount, and a guaranteed unlock.
//!
//! [`ExclusiveVolume::acquire`] is the only way the engine gets at a device it
//! is about to transfer sectors on. It locks first, dismounts second, and if
//! the dismount fails the lock is dropped again before the error is returned.
//! Once locked, the unlock runs exactly once: either through
//! [`ExclusiveVolume::release`] or from `Drop` on any early return.
use crate::error::Result;
use std::ops::{Deref, DerefMut};
use tracing::{debug, warn};

/// Volume-level controls of an open device handle.
pub trait VolumeControl {
    /// Takes an exclusive lock. Fails if someone else holds the volume open.
    fn lock(&mut self) -> Result<()>;

    /// Detaches the volume from its filesystem. Only called while locked.
    fn dismount(&mut self) -> Result<()>;

    /// Gives up the lock taken by [`VolumeControl::lock`].
    fn unlock(&mut self) -> Result<()>;
}

impl<T: VolumeControl + ?Sized> VolumeControl for &mut T {
    fn lock(&mut self) -> Result<()> {
        (**self).lock()
    }

    fn dismount(&mut self) -> Result<()> {
        (**self).dismount()
    }

    fn unlock(&mut self) -> Result<()> {
        (**self).unlock()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    Dismounted,
}

/// A device that is locked and dismounted for the lifetime of this value.
#[derive(Debug)]
pub struct ExclusiveVolume<D: VolumeControl> {
    device: D,
    state: LockState,
}

impl<D: VolumeControl> ExclusiveVolume<D> {
    /// Locks and dismounts `device`.
    ///
    /// On failure nothing stays acquired: a failed lock needs no unlock, a
    /// failed dismount is followed by an unlock before returning.
    pub fn acquire(device: D) -> Result<Self> {
        let mut volume = Self {
            device,
            state: LockState::Unlocked,
        };
        volume.device.lock()?;
        volume.state = LockState::Locked;
        debug!("volume locked");

        volume.device.dismount()?;
        volume.state = LockState::Dismounted;
        debug!("volume dismounted");
        Ok(volume)
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    /// Unlocks the device now, reporting an unlock failure instead of only
    /// logging it the way `Drop` does.
    pub fn release(mut self) -> Result<()> {
        self.unlock_once()
    }

    fn unlock_once(&mut self) -> Result<()> {
        if self.state == LockState::Unlocked {
            return Ok(());
        }
        self.state = LockState::Unlocked;
        self.device.unlock()?;
        debug!("volume unlocked");
        Ok(())
    }
}

impl<D: VolumeControl> Deref for ExclusiveVolume<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.device
    }
}

impl<D: VolumeControl> DerefMut for ExclusiveVolume<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: VolumeControl> Drop for ExclusiveVolume<D> {
    fn drop(&mut self) {
        if let Err(e) = self.unlock_once() {
            warn!(error = &e as &dyn std::error::Error, "failed to unlock volume during cleanup");
        }
    }
}
