//! Provides platform-specific functionality.
//!
//! Each submodule exposes the same public API: a `SystemProbe` implementing
//! [`crate::enumerate::DeviceProbe`], a `BlockDevice` implementing
//! [`crate::device::BlockAccess`], and `get_removable_devices`, so the rest of
//! the library and the front end can use them without worrying about the
//! underlying platform.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use self::windows::*;
