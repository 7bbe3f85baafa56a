use crate::error::Result;
use crate::volume::VolumeControl;
use std::fmt;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Physical transport of a storage device, as reported by the storage stack.
///
/// The raw numbering follows the Windows `STORAGE_BUS_TYPE` enumeration so the
/// Windows probe can convert directly; the Linux probe maps sysfs paths onto
/// the same variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BusType {
    Unknown,
    Scsi,
    Atapi,
    Ata,
    Ieee1394,
    Usb,
    Raid,
    Sas,
    Sata,
    Sd,
    Mmc,
    Virtual,
    Nvme,
    Other(u32),
}

impl BusType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => BusType::Unknown,
            1 => BusType::Scsi,
            2 => BusType::Atapi,
            3 => BusType::Ata,
            4 => BusType::Ieee1394,
            7 => BusType::Usb,
            8 => BusType::Raid,
            10 => BusType::Sas,
            11 => BusType::Sata,
            12 => BusType::Sd,
            13 => BusType::Mmc,
            14 | 15 => BusType::Virtual,
            17 => BusType::Nvme,
            other => BusType::Other(other),
        }
    }

    /// SD and MMC cards are removable by construction.
    pub fn is_card(self) -> bool {
        matches!(self, BusType::Sd | BusType::Mmc)
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Unknown => f.write_str("unknown"),
            BusType::Scsi => f.write_str("SCSI"),
            BusType::Atapi => f.write_str("ATAPI"),
            BusType::Ata => f.write_str("ATA"),
            BusType::Ieee1394 => f.write_str("1394"),
            BusType::Usb => f.write_str("USB"),
            BusType::Raid => f.write_str("RAID"),
            BusType::Sas => f.write_str("SAS"),
            BusType::Sata => f.write_str("SATA"),
            BusType::Sd => f.write_str("SD"),
            BusType::Mmc => f.write_str("MMC"),
            BusType::Virtual => f.write_str("virtual"),
            BusType::Nvme => f.write_str("NVMe"),
            BusType::Other(raw) => write!(f, "bus {raw}"),
        }
    }
}

/// What the OS says about the drive behind a drive letter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveType {
    Unknown,
    NoRootDir,
    Removable,
    Fixed,
    Remote,
    CdRom,
    RamDisk,
}

impl DriveType {
    /// Converts a `GetDriveType` return value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => DriveType::NoRootDir,
            2 => DriveType::Removable,
            3 => DriveType::Fixed,
            4 => DriveType::Remote,
            5 => DriveType::CdRom,
            6 => DriveType::RamDisk,
            _ => DriveType::Unknown,
        }
    }
}

/// Media type from the legacy drive geometry query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Removable,
    Fixed,
    /// Floppy formats and anything else that is not disk-like media.
    Other(i32),
}

impl MediaType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            11 => MediaType::Removable,
            12 => MediaType::Fixed,
            other => MediaType::Other(other),
        }
    }

    pub fn is_disk(self) -> bool {
        matches!(self, MediaType::Removable | MediaType::Fixed)
    }
}

/// Access requested when opening a block device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// Sector layout of an open device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u64,
    pub sector_count: u64,
}

impl Geometry {
    pub fn size_bytes(&self) -> u64 {
        self.sector_size.saturating_mul(self.sector_count)
    }
}

/// An open device the engine can lock, dismount and transfer sectors on.
pub trait BlockAccess: Read + Write + Seek + VolumeControl {
    /// The path the device was opened from, for error messages.
    fn path(&self) -> &Path;

    /// Sector size and count. A zero sector size is a geometry error.
    fn geometry(&mut self) -> Result<Geometry>;
}

impl<T: BlockAccess + ?Sized> BlockAccess for &mut T {
    fn path(&self) -> &Path {
        (**self).path()
    }

    fn geometry(&mut self) -> Result<Geometry> {
        (**self).geometry()
    }
}

/// Represents a block device discovered on the system and eligible for
/// imaging.
///
/// Populated by [`crate::enumerate::enumerate`] through the platform probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Physical drive number (`N` in `\\.\PhysicalDriveN`) or the probe's index.
    pub id: u32,
    /// The system path to the device (e.g., `/dev/sdb` or `\\.\PhysicalDrive1`).
    pub path: PathBuf,
    /// Short display name (e.g., "PhysicalDrive1" or "sdb").
    pub name: String,
    pub size_bytes: u64,
    pub bus: BusType,
    pub removable: bool,
    /// Drive letter this device was discovered through, if any.
    pub letter: Option<char>,
    /// Mount points backed by this device.
    pub mount_points: Vec<PathBuf>,
}

impl Device {
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(letter) = self.letter {
            write!(f, " [{letter}:\\]")?;
        } else if let Some(mp) = self.mount_points.first() {
            write!(f, " [{}]", mp.display())?;
        }
        write!(f, " ({:.2} GB, {})", self.size_gb(), self.bus)
    }
}
