use crate::device::{Access, BlockAccess, BusType, Device, DriveType, Geometry, MediaType};
use crate::enumerate::{
    self, CheckVerify, DeviceProbe, Enumeration, StorageDescriptor, VolumeDescriptor,
};
use crate::error::{Error, Result};
use crate::ignore::IgnoreList;
use crate::os_options::device_options;
use crate::sector_io::sectors_for_len;
use crate::volume::VolumeControl;
use nix::errno::Errno;
use nix::mount::{MntFlags, umount2};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, warn};

const SYS_BLOCK: &str = "/sys/block";

/// Sector size assumed for regular files opened as devices.
const FILE_SECTOR_SIZE: u64 = 512;

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
nix::ioctl_read_bad!(blksszget, 0x1268, libc::c_int);

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = Path::new(SYS_BLOCK).join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Helper to find the parent device of a partition (e.g., /dev/sda1 -> /dev/sda).
/// This is used to find the system drive's parent for exclusion.
fn parent_device(path: &Path) -> PathBuf {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return path.to_path_buf();
    };
    let parent = if name.starts_with("mmcblk") || name.starts_with("nvme") {
        // Partition suffixes on these are `p<N>`.
        match name.rfind('p') {
            Some(i)
                if i > 0
                    && i + 1 < name.len()
                    && name[i + 1..].bytes().all(|b| b.is_ascii_digit()) =>
            {
                &name[..i]
            }
            _ => name,
        }
    } else {
        name.trim_end_matches(|c: char| c.is_ascii_digit())
    };
    path.with_file_name(parent)
}

/// Whether block device `part` is `disk` itself or one of its partitions.
fn is_partition_of(part: &str, disk: &str) -> bool {
    let Some(rest) = part.strip_prefix(disk) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    let digits = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        match rest.strip_prefix('p') {
            Some(d) => d,
            None => return false,
        }
    } else {
        rest
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Loop, RAM and compressed-RAM devices are never imaging targets.
fn is_virtual(name: &str) -> bool {
    ["loop", "ram", "zram"].iter().any(|p| name.starts_with(p))
}

/// Maps the resolved sysfs path of a block device onto a bus type.
fn bus_from_sysfs(name: &str, sysfs_path: &str, mmc_type: Option<&str>) -> BusType {
    if sysfs_path.contains("/usb") {
        BusType::Usb
    } else if name.starts_with("mmcblk") {
        match mmc_type {
            Some("SD") => BusType::Sd,
            _ => BusType::Mmc,
        }
    } else if sysfs_path.contains("/nvme") {
        BusType::Nvme
    } else if sysfs_path.contains("/ata") {
        BusType::Sata
    } else if sysfs_path.contains("/virtio") {
        BusType::Virtual
    } else if sysfs_path.contains("/host") {
        BusType::Scsi
    } else {
        BusType::Unknown
    }
}

#[derive(Clone, Debug)]
struct BlockEntry {
    name: String,
    bus: BusType,
    removable: bool,
    size_bytes: u64,
}

/// A snapshot of `/sys/block`, indexed in name order.
///
/// Linux has no drive letters, so only the index path of the enumerator
/// finds anything here.
#[derive(Debug)]
pub struct SystemProbe {
    blocks: Vec<BlockEntry>,
    /// `(device name, mount point)` for every mounted filesystem.
    mounts: Vec<(String, PathBuf)>,
}

impl SystemProbe {
    /// Scans `/sys/block`, leaving out virtual devices and the disk that
    /// holds the root filesystem.
    pub fn new() -> Result<Self> {
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(String, PathBuf)> = disks
            .iter()
            .filter_map(|disk| {
                let dev = Path::new("/dev/").join(disk.name());
                let name = dev.file_name()?.to_str()?.to_string();
                Some((name, disk.mount_point().to_path_buf()))
            })
            .collect();

        let system_disk = disks
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .map(|disk| parent_device(&Path::new("/dev/").join(disk.name())));
        match &system_disk {
            Some(path) => debug!("system disk {}", path.display()),
            None => warn!("could not determine the system drive"),
        }

        let mut names: Vec<String> = fs::read_dir(SYS_BLOCK)
            .map_err(|source| Error::Query {
                what: "block device list",
                source,
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !is_virtual(name))
            .filter(|name| system_disk.as_deref() != Some(Path::new("/dev/").join(name).as_path()))
            .collect();
        names.sort();

        let blocks = names
            .into_iter()
            .map(|name| {
                let removable = read_sys_file(&name, "removable").is_ok_and(|s| s == "1");
                let size_bytes = read_sys_file(&name, "size")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0)
                    .saturating_mul(512);
                let sysfs = fs::canonicalize(Path::new(SYS_BLOCK).join(&name)).unwrap_or_default();
                let mmc_type = read_sys_file(&name, "device/type").ok();
                let bus = bus_from_sysfs(&name, &sysfs.to_string_lossy(), mmc_type.as_deref());
                BlockEntry {
                    name,
                    bus,
                    removable,
                    size_bytes,
                }
            })
            .collect();

        Ok(Self { blocks, mounts })
    }

    fn entry(&self, index: u32) -> Option<&BlockEntry> {
        self.blocks.get(index as usize)
    }
}

impl DeviceProbe for SystemProbe {
    fn logical_drives(&mut self) -> Vec<char> {
        Vec::new()
    }

    fn drive_type(&mut self, _letter: char) -> DriveType {
        DriveType::NoRootDir
    }

    fn media_type(&mut self, _letter: char) -> Result<MediaType> {
        Err(no_drive_letters())
    }

    fn volume_descriptor(&mut self, _letter: char) -> Result<VolumeDescriptor> {
        Err(no_drive_letters())
    }

    fn check_verify(&mut self, _letter: char, _check: CheckVerify) -> bool {
        false
    }

    /// Devices reporting zero size (empty card readers) are treated as absent.
    fn physical_descriptor(&mut self, index: u32) -> Option<StorageDescriptor> {
        self.entry(index)
            .filter(|b| b.size_bytes > 0)
            .map(|b| StorageDescriptor {
                bus: b.bus,
                removable: b.removable,
            })
    }

    fn disk_size(&mut self, index: u32) -> Option<u64> {
        self.entry(index).map(|b| b.size_bytes)
    }

    fn physical_path(&self, index: u32) -> PathBuf {
        self.entry(index)
            .map(|b| Path::new("/dev/").join(&b.name))
            .unwrap_or_default()
    }

    fn physical_name(&self, index: u32) -> String {
        self.entry(index).map(|b| b.name.clone()).unwrap_or_default()
    }

    fn mount_points(&mut self, index: u32, _ignored: &IgnoreList) -> Vec<PathBuf> {
        let Some(block) = self.entry(index) else {
            return Vec::new();
        };
        self.mounts
            .iter()
            .filter(|(dev, _)| is_partition_of(dev, &block.name))
            .map(|(_, mp)| mp.clone())
            .collect()
    }

    fn physical_drive_count(&self) -> u32 {
        u32::try_from(self.blocks.len()).unwrap_or(u32::MAX)
    }
}

fn no_drive_letters() -> Error {
    Error::ExpectedDeviceUnavailable {
        source: io::Error::from(io::ErrorKind::Unsupported),
    }
}

/// Scans for every removable block device eligible for imaging.
///
/// Ignored drive letters have no meaning on Linux, but the list is passed
/// through for parity with the other platforms.
pub fn get_removable_devices(ignored: &IgnoreList) -> Result<Enumeration> {
    let mut probe = SystemProbe::new()?;
    Ok(enumerate::enumerate(&mut probe, ignored))
}

/// An open block device or image file.
///
/// Locking takes an exclusive `flock` on the device node; dismounting
/// unmounts every filesystem the device backs.
#[derive(Debug)]
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    mount_points: Vec<PathBuf>,
}

impl BlockDevice {
    pub fn open(device: &Device, access: Access) -> Result<Self> {
        let mut handle = Self::open_path(&device.path, access)?;
        handle.mount_points = device.mount_points.clone();
        Ok(handle)
    }

    pub fn open_path(path: &Path, access: Access) -> Result<Self> {
        let file = device_options(access).open(path).map_err(|source| Error::Handle {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("opened {} ({access:?})", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
            mount_points: Vec::new(),
        })
    }

    fn flock(&self, operation: libc::c_int) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and stays open for the call.
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), operation) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Read for BlockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for BlockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Seek for BlockDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl VolumeControl for BlockDevice {
    fn lock(&mut self) -> Result<()> {
        self.flock(libc::LOCK_EX | libc::LOCK_NB).map_err(|source| Error::Lock {
            path: self.path.clone(),
            source,
        })
    }

    fn dismount(&mut self) -> Result<()> {
        for mp in &self.mount_points {
            match umount2(mp.as_path(), MntFlags::empty()) {
                Ok(()) => debug!("unmounted {}", mp.display()),
                Err(Errno::EINVAL | Errno::ENOENT) => debug!("{} was not mounted", mp.display()),
                Err(errno) => {
                    return Err(Error::Dismount {
                        path: mp.clone(),
                        source: errno.into(),
                    });
                }
            }
        }
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.flock(libc::LOCK_UN).map_err(|source| Error::Unlock {
            path: self.path.clone(),
            source,
        })
    }
}

impl BlockAccess for BlockDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn geometry(&mut self) -> Result<Geometry> {
        let geometry_err = |source| Error::Geometry {
            path: self.path.clone(),
            source,
        };
        let meta = self.file.metadata().map_err(geometry_err)?;
        if !meta.file_type().is_block_device() {
            return Ok(Geometry {
                sector_size: FILE_SECTOR_SIZE,
                sector_count: sectors_for_len(meta.len(), FILE_SECTOR_SIZE),
            });
        }

        let fd = self.file.as_raw_fd();
        let mut sector_size: libc::c_int = 0;
        let mut size_bytes: u64 = 0;
        // SAFETY: both ioctls write one integer through a valid pointer.
        unsafe {
            blksszget(fd, &mut sector_size).map_err(|errno| geometry_err(errno.into()))?;
            blkgetsize64(fd, &mut size_bytes).map_err(|errno| geometry_err(errno.into()))?;
        }
        let sector_size = u64::try_from(sector_size).unwrap_or(0);
        Ok(Geometry {
            sector_size,
            sector_count: size_bytes.checked_div(sector_size).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_map_to_their_parent_disk() {
        assert_eq!(parent_device(Path::new("/dev/sda1")), Path::new("/dev/sda"));
        assert_eq!(parent_device(Path::new("/dev/sdb")), Path::new("/dev/sdb"));
        assert_eq!(parent_device(Path::new("/dev/nvme0n1p2")), Path::new("/dev/nvme0n1"));
        assert_eq!(parent_device(Path::new("/dev/nvme0n1")), Path::new("/dev/nvme0n1"));
        assert_eq!(parent_device(Path::new("/dev/mmcblk0p1")), Path::new("/dev/mmcblk0"));
    }

    #[test]
    fn partition_membership_respects_name_boundaries() {
        assert!(is_partition_of("sdb", "sdb"));
        assert!(is_partition_of("sdb1", "sdb"));
        assert!(!is_partition_of("sdba", "sdb"));
        assert!(!is_partition_of("sda1", "sdb"));
        assert!(is_partition_of("mmcblk0p2", "mmcblk0"));
        assert!(!is_partition_of("mmcblk01", "mmcblk0"));
        assert!(!is_partition_of("mmcblk0boot0", "mmcblk0"));
    }

    #[test]
    fn bus_type_follows_sysfs_topology() {
        let usb = concat!(
            "/sys/devices/pci0000:00/0000:00:14.0/usb2/2-1/2-1:1.0",
            "/host6/target6:0:0/6:0:0:0/block/sdb"
        );
        assert_eq!(bus_from_sysfs("sdb", usb, None), BusType::Usb);
        let sata = "/sys/devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0/block/sda";
        assert_eq!(bus_from_sysfs("sda", sata, None), BusType::Sata);
        let nvme = "/sys/devices/pci0000:00/0000:00:1d.0/0000:3d:00.0/nvme/nvme0/nvme0n1";
        assert_eq!(bus_from_sysfs("nvme0n1", nvme, None), BusType::Nvme);
        let mmc = "/sys/devices/platform/soc/mmc0/mmc0:0001/block/mmcblk0";
        assert_eq!(bus_from_sysfs("mmcblk0", mmc, Some("SD")), BusType::Sd);
        assert_eq!(bus_from_sysfs("mmcblk0", mmc, Some("MMC")), BusType::Mmc);
    }

    #[test]
    fn virtual_devices_are_skipped() {
        assert!(is_virtual("loop0"));
        assert!(is_virtual("zram0"));
        assert!(!is_virtual("sdc"));
    }

    #[test]
    fn regular_file_reports_rounded_up_512_byte_sectors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 1300]).unwrap();
        let mut dev = BlockDevice::open_path(file.path(), Access::Read).unwrap();
        assert_eq!(
            dev.geometry().unwrap(),
            Geometry {
                sector_size: 512,
                sector_count: 3
            }
        );
    }

    #[test]
    fn second_lock_on_the_same_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut first = BlockDevice::open_path(file.path(), Access::Read).unwrap();
        let mut second = BlockDevice::open_path(file.path(), Access::Read).unwrap();
        first.lock().unwrap();
        assert!(matches!(second.lock(), Err(Error::Lock { .. })));
        first.unlock().unwrap();
        second.lock().unwrap();
        second.unlock().unwrap();
    }
}
