//! The error type shared by every engine operation.
//!
//! Each variant maps to one failure class of the imaging engine. Variants that
//! wrap an [`io::Error`] keep the operating system's error code so the front
//! end can show it next to the message (see [`Error::os_code`]). The wrapped
//! error is exposed as the `source`, never repeated in the message.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::partition::PartitionError;

/// A specialized `Result` for engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The I/O step that failed inside a sector transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoStep {
    Seek,
    Read,
    Write,
    Flush,
}

impl std::fmt::Display for IoStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IoStep::Seek => "seek",
            IoStep::Read => "read",
            IoStep::Write => "write",
            IoStep::Flush => "flush",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open {}", path.display())]
    Handle {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot lock {}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot dismount {}", path.display())]
    Dismount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot unlock {}", path.display())]
    Unlock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot query the geometry of {}", path.display())]
    Geometry {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{step} failed at sector {sector}")]
    Io {
        step: IoStep,
        sector: u64,
        #[source]
        source: io::Error,
    },

    #[error("incomplete write at sector {sector}: expected {expected} bytes, wrote {written}")]
    IncompleteWrite {
        sector: u64,
        expected: usize,
        written: usize,
    },

    #[error("invalid sector parameters: sector size {sector_size}, {num_sectors} sectors")]
    InvalidParameter { sector_size: u64, num_sectors: u64 },

    #[error("{what} overflow: {value} sectors of {sector_size} bytes")]
    Overflow {
        what: &'static str,
        value: u64,
        sector_size: u64,
    },

    #[error("not enough space: {needed} bytes required, {available} available")]
    Space { needed: u64, available: u64 },

    #[error("verification failed: data differs at sector {sector}")]
    VerifyMismatch { sector: u64 },

    #[error("device unavailable")]
    ExpectedDeviceUnavailable {
        #[source]
        source: io::Error,
    },

    #[error("{what} query failed")]
    Query {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("partition table: {0}")]
    Partition(#[from] PartitionError),

    #[error("{} is empty", path.display())]
    EmptyImage { path: PathBuf },

    #[error("{} is stored on the selected device", image.display())]
    SourceOnTarget { image: PathBuf },

    #[error("another operation is already running")]
    Busy,

    #[error("operation cancelled by user")]
    Cancelled,
}

impl Error {
    /// The raw operating system error code behind this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        self.io_source().and_then(io::Error::raw_os_error)
    }

    /// Whether this error only means "skip this device" during discovery.
    pub fn is_expected_unavailable(&self) -> bool {
        matches!(self, Error::ExpectedDeviceUnavailable { .. })
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            Error::Handle { source, .. }
            | Error::Lock { source, .. }
            | Error::Dismount { source, .. }
            | Error::Unlock { source, .. }
            | Error::Geometry { source, .. }
            | Error::Io { source, .. }
            | Error::ExpectedDeviceUnavailable { source }
            | Error::Query { source, .. } => Some(source),
            _ => None,
        }
    }
}
