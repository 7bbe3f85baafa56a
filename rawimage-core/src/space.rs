use crate::error::{Error, Result};
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Free space lookup for the filesystem holding a path.
pub trait FreeSpace {
    /// Bytes available to the current user on the filesystem that would hold
    /// `path`. The path itself need not exist.
    fn available(&self, path: &Path) -> Result<u64>;
}

impl<F> FreeSpace for F
where
    F: Fn(&Path) -> Result<u64>,
{
    fn available(&self, path: &Path) -> Result<u64> {
        self(path)
    }
}

/// Looks up free space through the mounted filesystem table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpace for SystemFreeSpace {
    fn available(&self, path: &Path) -> Result<u64> {
        let target = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(PathBuf, u64)> = disks
            .iter()
            .map(|d| (d.mount_point().to_path_buf(), d.available_space()))
            .collect();
        longest_mount(&target, &mounts).ok_or_else(|| Error::Query {
            what: "free space",
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mounted filesystem holds {}", target.display()),
            ),
        })
    }
}

/// Available bytes of the most specific mount point containing `target`.
fn longest_mount(target: &Path, mounts: &[(PathBuf, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mp, _)| starts_with(target, mp))
        .max_by_key(|(mp, _)| mp.components().count())
        .map(|&(_, available)| available)
}

fn starts_with(target: &Path, mount_point: &Path) -> bool {
    if cfg!(windows) {
        target
            .to_string_lossy()
            .to_lowercase()
            .starts_with(&mount_point.to_string_lossy().to_lowercase())
    } else {
        target.starts_with(mount_point)
    }
}
