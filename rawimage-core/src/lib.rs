//! The core, UI-agnostic library for the `rawimage` disk imaging utility.
//!
//! `rawimage-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `rawimage`) or a graphical one.
//! It handles device discovery and eligibility, exclusive volume access,
//! validated sector I/O, image decompression and partition table decoding.
//!
//! The library is structured into several key modules:
//! - [`enumerate`]: Lists the drives that are safe to image, through the
//!   platform [`enumerate::DeviceProbe`].
//! - [`platform`]: Windows and Linux device probes and block device handles.
//! - [`session`]: Engine state, operation scoping and cancellation.
//! - [`mod@read`], [`mod@write`], [`verify`], [`detect`]: The imaging
//!   operations.
//! - [`partition`]: MBR and GPT decoding.
//!
//! Operations run synchronously on the calling thread and report progress
//! through an event callback at every chunk boundary, allowing the calling
//! application to display progress in any way it chooses. Cancellation is
//! cooperative: clearing the context's `running` flag stops the operation
//! after the chunk in flight.
//!
//! ## Example: Writing an Image with Progress Reporting
//!
//! ```rust,no_run
//! use rawimage_core::device::Access;
//! use rawimage_core::ignore::IgnoreList;
//! use rawimage_core::session::{Event, OperationContext};
//! use rawimage_core::{platform, write};
//! use std::path::Path;
//!
//! fn main() -> rawimage_core::Result<()> {
//!     let found = platform::get_removable_devices(&IgnoreList::new())?;
//!     let Some(target) = found.devices.first() else {
//!         return Ok(());
//!     };
//!
//!     let ctx = OperationContext::default();
//!     let device = platform::BlockDevice::open(target, Access::ReadWrite)?;
//!     write::run(
//!         &ctx,
//!         device,
//!         Path::new("path/to/image.img.xz"),
//!         &write::WriteOptions { verify: true },
//!         |_oversize| false,
//!         |event| {
//!             if let Event::Progress(p) = event {
//!                 println!("{}%", p.percent());
//!             }
//!         },
//!     )?;
//!     Ok(())
//! }
//! ```

pub mod cursor;
pub mod detect;
pub mod device;
pub mod enumerate;
pub mod error;
pub mod ignore;
pub mod image;
mod os_options;
pub mod partition;
pub mod platform;
pub mod progress;
pub mod read;
pub mod sector_io;
pub mod session;
pub mod space;
pub mod verify;
pub mod volume;
pub mod write;

pub use error::{Error, Result};
