use crate::device::{Access, BlockAccess, BusType, Device, DriveType, Geometry, MediaType};
use crate::enumerate::{
    self, CheckVerify, DeviceProbe, Enumeration, StorageDescriptor, VolumeDescriptor,
};
use crate::error::{Error, Result};
use crate::ignore::IgnoreList;
use crate::os_options::{device_options, query_options};
use crate::sector_io::sectors_for_len;
use crate::volume::VolumeControl;
use std::ffi::c_void;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem::{MaybeUninit, size_of};
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::debug;
use windows_sys::Win32::Foundation::{
    ERROR_INVALID_FUNCTION, ERROR_NO_MEDIA_IN_DRIVE, ERROR_NOT_READY, HANDLE,
};
use windows_sys::Win32::Storage::FileSystem::{FILE_READ_DATA, GetDriveTypeW, GetLogicalDrives};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{
    DISK_GEOMETRY, DISK_GEOMETRY_EX, FSCTL_DISMOUNT_VOLUME, FSCTL_IS_VOLUME_MOUNTED,
    FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME, IOCTL_DISK_GET_DRIVE_GEOMETRY,
    IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, IOCTL_STORAGE_CHECK_VERIFY, IOCTL_STORAGE_CHECK_VERIFY2,
    IOCTL_STORAGE_GET_DEVICE_NUMBER, IOCTL_STORAGE_QUERY_PROPERTY,
    IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, PropertyStandardQuery, STORAGE_DEVICE_DESCRIPTOR,
    STORAGE_DEVICE_NUMBER, STORAGE_PROPERTY_QUERY, StorageDeviceProperty, VOLUME_DISK_EXTENTS,
};

/// Sector size assumed for regular files opened as devices.
const FILE_SECTOR_SIZE: u64 = 512;

/// Failures that removable slots without media, and system volumes that do
/// not support storage queries, always produce.
const EXPECTED_ERRORS: [u32; 3] = [
    ERROR_INVALID_FUNCTION,
    ERROR_NOT_READY,
    ERROR_NO_MEDIA_IN_DRIVE,
];

/// Room for the vendor and serial strings that follow the descriptor.
#[repr(C)]
struct DescriptorBuffer {
    descriptor: STORAGE_DEVICE_DESCRIPTOR,
    _strings: [u8; 512],
}

fn volume_path(letter: char) -> PathBuf {
    PathBuf::from(format!(r"\\.\{letter}:"))
}

fn physical_drive_path(index: u32) -> PathBuf {
    PathBuf::from(format!(r"\\.\PhysicalDrive{index}"))
}

fn is_expected(e: &io::Error) -> bool {
    e.raw_os_error()
        .is_some_and(|code| EXPECTED_ERRORS.iter().any(|&x| x as i32 == code))
}

/// Turns a classification failure into the error the enumerator expects.
fn classify(what: &'static str, source: io::Error) -> Error {
    if is_expected(&source) {
        Error::ExpectedDeviceUnavailable { source }
    } else {
        Error::Query { what, source }
    }
}

fn ioctl(
    file: &File,
    code: u32,
    input: *const c_void,
    in_len: usize,
    output: *mut c_void,
    out_len: usize,
) -> io::Result<u32> {
    let mut returned = 0u32;
    // SAFETY: the handle is open for the duration of the call and the
    // buffers are valid for the lengths passed alongside them.
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as HANDLE,
            code,
            input,
            in_len as u32,
            output,
            out_len as u32,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(returned)
    }
}

/// Issues a control code that takes and returns no data.
fn control(file: &File, code: u32) -> io::Result<()> {
    ioctl(file, code, ptr::null(), 0, ptr::null_mut(), 0).map(|_| ())
}

/// Issues a control code that fills an output structure of type `O`.
///
/// # Safety
///
/// `O` must be a plain C structure for which all-zero bytes are a valid value.
unsafe fn query<I, O>(file: &File, code: u32, input: Option<&I>) -> io::Result<O> {
    let mut out = MaybeUninit::<O>::zeroed();
    let (in_ptr, in_len) = match input {
        Some(i) => ((i as *const I).cast::<c_void>(), size_of::<I>()),
        None => (ptr::null(), 0),
    };
    ioctl(file, code, in_ptr, in_len, out.as_mut_ptr().cast(), size_of::<O>())?;
    // SAFETY: zeroed is a valid `O` per the contract, and the call only wrote into it.
    Ok(unsafe { out.assume_init() })
}

fn storage_descriptor(file: &File) -> io::Result<StorageDescriptor> {
    let request = STORAGE_PROPERTY_QUERY {
        PropertyId: StorageDeviceProperty,
        QueryType: PropertyStandardQuery,
        AdditionalParameters: [0],
    };
    // SAFETY: DescriptorBuffer is a C structure of integers and byte arrays.
    let buffer: DescriptorBuffer =
        unsafe { query(file, IOCTL_STORAGE_QUERY_PROPERTY, Some(&request))? };
    Ok(StorageDescriptor {
        bus: BusType::from_raw(buffer.descriptor.BusType as u32),
        removable: buffer.descriptor.RemovableMedia != 0,
    })
}

fn disk_geometry_ex(file: &File) -> io::Result<DISK_GEOMETRY_EX> {
    // SAFETY: DISK_GEOMETRY_EX is a C structure of integers.
    unsafe { query::<(), DISK_GEOMETRY_EX>(file, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, None) }
}

/// Queries storage devices through `DeviceIoControl`.
#[derive(Debug, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    fn open_volume(&self, letter: char, access_mask: u32) -> Result<File> {
        let path = volume_path(letter);
        query_options(access_mask).open(&path).map_err(|source| {
            if is_expected(&source) {
                Error::ExpectedDeviceUnavailable { source }
            } else {
                Error::Handle { path, source }
            }
        })
    }

    fn open_physical(&self, index: u32) -> io::Result<File> {
        query_options(0).open(physical_drive_path(index))
    }
}

impl DeviceProbe for SystemProbe {
    fn logical_drives(&mut self) -> Vec<char> {
        // SAFETY: no arguments, returns a bitmask.
        let mask = unsafe { GetLogicalDrives() };
        (b'A'..=b'Z')
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, letter)| char::from(letter))
            .collect()
    }

    fn drive_type(&mut self, letter: char) -> DriveType {
        let root: Vec<u16> = format!("{letter}:\\").encode_utf16().chain(Some(0)).collect();
        // SAFETY: `root` is a NUL-terminated UTF-16 string.
        DriveType::from_raw(unsafe { GetDriveTypeW(root.as_ptr()) })
    }

    fn media_type(&mut self, letter: char) -> Result<MediaType> {
        let volume = self.open_volume(letter, 0)?;
        // SAFETY: DISK_GEOMETRY is a C structure of integers.
        let geometry: DISK_GEOMETRY =
            unsafe { query::<(), _>(&volume, IOCTL_DISK_GET_DRIVE_GEOMETRY, None) }
                .map_err(|e| classify("drive geometry", e))?;
        Ok(MediaType::from_raw(geometry.MediaType))
    }

    fn volume_descriptor(&mut self, letter: char) -> Result<VolumeDescriptor> {
        let volume = self.open_volume(letter, 0)?;
        let storage = storage_descriptor(&volume).map_err(|e| classify("storage property", e))?;
        // SAFETY: STORAGE_DEVICE_NUMBER is a C structure of integers.
        let number: STORAGE_DEVICE_NUMBER =
            unsafe { query::<(), _>(&volume, IOCTL_STORAGE_GET_DEVICE_NUMBER, None) }
                .map_err(|e| classify("device number", e))?;
        debug!(
            "drive {letter}: PhysicalDrive{}, {} bus, removable {}",
            number.DeviceNumber, storage.bus, storage.removable
        );
        Ok(VolumeDescriptor {
            storage,
            device_number: number.DeviceNumber,
        })
    }

    fn check_verify(&mut self, letter: char, check: CheckVerify) -> bool {
        let (access, code) = match check {
            CheckVerify::Fast => (0, IOCTL_STORAGE_CHECK_VERIFY2),
            CheckVerify::Legacy => (FILE_READ_DATA, IOCTL_STORAGE_CHECK_VERIFY),
        };
        let result = self
            .open_volume(letter, access)
            .and_then(|volume| control(&volume, code).map_err(|e| classify("check verify", e)));
        if let Err(e) = &result {
            debug!(
                error = e as &dyn std::error::Error,
                "drive {letter}: {check:?} check-verify failed"
            );
        }
        result.is_ok()
    }

    fn physical_descriptor(&mut self, index: u32) -> Option<StorageDescriptor> {
        let disk = self.open_physical(index).ok()?;
        storage_descriptor(&disk)
            .inspect_err(|e| debug!("PhysicalDrive{index}: storage property failed: {e}"))
            .ok()
    }

    fn disk_size(&mut self, index: u32) -> Option<u64> {
        let disk = self.open_physical(index).ok()?;
        disk_geometry_ex(&disk)
            .ok()
            .and_then(|g| u64::try_from(g.DiskSize).ok())
    }

    fn physical_path(&self, index: u32) -> PathBuf {
        physical_drive_path(index)
    }

    fn mount_points(&mut self, index: u32, ignored: &IgnoreList) -> Vec<PathBuf> {
        self.logical_drives()
            .into_iter()
            .filter(|&letter| !ignored.contains(letter))
            .filter(|&letter| {
                let Ok(volume) = self.open_volume(letter, 0) else {
                    return false;
                };
                // Volumes spanning several disks fail with ERROR_MORE_DATA and
                // are skipped.
                // SAFETY: VOLUME_DISK_EXTENTS is a C structure of integers.
                let extents: io::Result<VOLUME_DISK_EXTENTS> =
                    unsafe { query::<(), _>(&volume, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS, None) };
                extents
                    .is_ok_and(|e| e.NumberOfDiskExtents >= 1 && e.Extents[0].DiskNumber == index)
            })
            .map(|letter| PathBuf::from(format!("{letter}:\\")))
            .collect()
    }
}

/// Scans for every removable drive eligible for imaging, skipping `ignored`
/// drive letters.
pub fn get_removable_devices(ignored: &IgnoreList) -> Result<Enumeration> {
    let mut probe = SystemProbe::new()?;
    Ok(enumerate::enumerate(&mut probe, ignored))
}

/// An open physical drive, plus the volumes on it while they are locked.
///
/// Sector data goes through the physical drive handle; locking and
/// dismounting act on each lettered volume the drive holds.
#[derive(Debug)]
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    letters: Vec<char>,
    locked: Vec<(char, File)>,
}

impl BlockDevice {
    pub fn open(device: &Device, access: Access) -> Result<Self> {
        let mut handle = Self::open_path(&device.path, access)?;
        handle.letters = device
            .letter
            .into_iter()
            .chain(device.mount_points.iter().filter_map(|mp| drive_letter(mp)))
            .fold(Vec::new(), |mut letters, l| {
                if !letters.contains(&l) {
                    letters.push(l);
                }
                letters
            });
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
            letters: Vec::new(),
            locked: Vec::new(),
        })
    }
}

/// `E:\` to `E`.
fn drive_letter(mount_point: &Path) -> Option<char> {
    let s = mount_point.to_str()?;
    let mut chars = s.chars();
    let letter = chars.next().filter(char::is_ascii_alphabetic)?;
    matches!(chars.as_str(), ":" | ":\\").then(|| letter.to_ascii_uppercase())
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
        for &letter in &self.letters {
            let path = volume_path(letter);
            let locked = device_options(Access::ReadWrite)
                .open(&path)
                .and_then(|volume| control(&volume, FSCTL_LOCK_VOLUME).map(|()| volume));
            match locked {
                Ok(volume) => self.locked.push((letter, volume)),
                Err(source) => {
                    // Closing the handles drops the locks already taken.
                    self.locked.clear();
                    return Err(Error::Lock { path, source });
                }
            }
        }
        Ok(())
    }

    fn dismount(&mut self) -> Result<()> {
        for (letter, volume) in &self.locked {
            control(volume, FSCTL_DISMOUNT_VOLUME).map_err(|source| Error::Dismount {
                path: volume_path(*letter),
                source,
            })?;
            let mounted = control(volume, FSCTL_IS_VOLUME_MOUNTED).is_ok();
            debug!("volume {letter}: dismounted, still mounted: {mounted}");
        }
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        let mut first_err = None;
        for (letter, volume) in self.locked.drain(..) {
            if let Err(source) = control(&volume, FSCTL_UNLOCK_VOLUME) {
                first_err.get_or_insert(Error::Unlock {
                    path: volume_path(letter),
                    source,
                });
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl BlockAccess for BlockDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn geometry(&mut self) -> Result<Geometry> {
        if let Ok(meta) = self.file.metadata() {
            if meta.is_file() {
                return Ok(Geometry {
                    sector_size: FILE_SECTOR_SIZE,
                    sector_count: sectors_for_len(meta.len(), FILE_SECTOR_SIZE),
                });
            }
        }
        let geometry = disk_geometry_ex(&self.file).map_err(|source| Error::Geometry {
            path: self.path.clone(),
            source,
        })?;
        let sector_size = u64::from(geometry.Geometry.BytesPerSector);
        let disk_size = u64::try_from(geometry.DiskSize).unwrap_or(0);
        Ok(Geometry {
            sector_size,
            sector_count: disk_size.checked_div(sector_size).unwrap_or(0),
        })
    }
}
