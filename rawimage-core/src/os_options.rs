//! `OpenOptions` presets for raw device and volume handles.
use crate::device::Access;
use std::fs::OpenOptions;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(windows)]
use std::os::windows::fs::OpenOptionsExt;
#[cfg(windows)]
use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};

/// Options for a handle sector data is transferred through.
///
/// Writable handles are synchronous on unix so a completed write has reached
/// the device. On Windows the handle is shared, since the volumes on the
/// disk are locked separately.
pub(crate) fn device_options(access: Access) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true);
    if access == Access::ReadWrite {
        options.write(true);
        #[cfg(unix)]
        options.custom_flags(libc::O_SYNC);
    }
    #[cfg(windows)]
    options.share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE);
    options
}

/// Options for a handle that only issues device queries.
///
/// An access mask of `0` opens the device for attribute access, which works
/// even while another process holds it open.
#[cfg(windows)]
pub(crate) fn query_options(access_mask: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    options
        .access_mode(access_mask)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE);
    options
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn read_write_handle_round_trips_through_a_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        device_options(Access::ReadWrite)
            .open(file.path())
            .unwrap()
            .write_all(b"sector")
            .unwrap();

        let mut back = String::new();
        device_options(Access::Read)
            .open(file.path())
            .unwrap()
            .read_to_string(&mut back)
            .unwrap();
        assert_eq!(back, "sector");
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut handle = device_options(Access::Read).open(file.path()).unwrap();
        assert!(handle.write_all(b"x").is_err());
    }
}
