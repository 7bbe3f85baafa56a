//! Discovery and eligibility classification of imaging targets.
//!
//! Two discovery paths feed the candidate list:
//!
//! 1. Drive letters. Removable and fixed drives are checked for disk media,
//!    bus type and media presence. A removable drive qualifies unless it sits
//!    on SATA; a fixed drive qualifies only on USB, SD or MMC.
//! 2. Physical drive indices. Drives without a letter (fresh or unformatted
//!    media) qualify when they are USB with removable media, or SD/MMC.
//!
//! Ignored letters are dropped before any hardware is queried, and a drive
//! found through its letter is not listed again by index.
//!
//! All hardware access goes through [`DeviceProbe`], so the rules here are
//! independent of the operating system.
use crate::device::{BusType, Device, DriveType, MediaType};
use crate::error::{Error, Result};
use crate::ignore::IgnoreList;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::debug;

/// Physical drive indices probed by the index path.
pub const MAX_PHYSICAL_DRIVES: u32 = 16;

/// Physical drive indices covered by the diagnostic scan.
pub const LEGACY_SCAN_LIMIT: u32 = 64;

/// What the storage stack reports about one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageDescriptor {
    pub bus: BusType,
    pub removable: bool,
}

/// The storage descriptor of a volume plus the physical drive it lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub storage: StorageDescriptor,
    pub device_number: u32,
}

/// Media presence checks, fastest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckVerify {
    /// Works on a handle opened for attribute access only.
    Fast,
    /// Older variant for hosts where [`CheckVerify::Fast`] is unsupported.
    Legacy,
}

/// OS access needed by the enumerator.
///
/// Letter queries return [`Error::ExpectedDeviceUnavailable`] for the
/// failures that system-internal drives and empty card readers always
/// produce; those drives are skipped silently. Any other error is collected
/// as a warning.
pub trait DeviceProbe {
    /// Mounted drive letters, `A` to `Z`.
    fn logical_drives(&mut self) -> Vec<char>;

    fn drive_type(&mut self, letter: char) -> DriveType;

    fn media_type(&mut self, letter: char) -> Result<MediaType>;

    fn volume_descriptor(&mut self, letter: char) -> Result<VolumeDescriptor>;

    fn check_verify(&mut self, letter: char, check: CheckVerify) -> bool;

    /// `None` when no drive exists at `index`.
    fn physical_descriptor(&mut self, index: u32) -> Option<StorageDescriptor>;

    /// Size in bytes of physical drive `index`, if its geometry is readable.
    fn disk_size(&mut self, index: u32) -> Option<u64>;

    fn physical_path(&self, index: u32) -> PathBuf;

    fn physical_name(&self, index: u32) -> String {
        format!("PhysicalDrive{index}")
    }

    /// Mount points backed by physical drive `index`. Letters in `ignored`
    /// must not be queried.
    fn mount_points(&mut self, _index: u32, _ignored: &IgnoreList) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Number of indices the index path walks.
    fn physical_drive_count(&self) -> u32 {
        MAX_PHYSICAL_DRIVES
    }
}

/// The result of one enumeration pass.
#[derive(Debug, Default)]
pub struct Enumeration {
    pub devices: Vec<Device>,
    /// Unexpected query failures. Each excluded one drive from the list.
    pub warnings: Vec<Error>,
}

/// Lists every device that is safe to image.
pub fn enumerate<P: DeviceProbe + ?Sized>(probe: &mut P, ignored: &IgnoreList) -> Enumeration {
    let mut result = Enumeration::default();
    let mut seen = BTreeSet::new();

    for letter in probe.logical_drives() {
        if ignored.contains(letter) {
            debug!("drive {letter}: ignored");
            continue;
        }
        match classify_letter(probe, letter) {
            Ok(Some(volume)) => {
                let number = volume.device_number;
                if !seen.insert(number) {
                    debug!("drive {letter}: PhysicalDrive{number} already listed");
                    continue;
                }
                let size_bytes = probe.disk_size(number).unwrap_or(0);
                let mut mount_points = vec![PathBuf::from(format!("{letter}:\\"))];
                for mp in probe.mount_points(number, ignored) {
                    if !mount_points.contains(&mp) {
                        mount_points.push(mp);
                    }
                }
                result.devices.push(Device {
                    id: number,
                    path: probe.physical_path(number),
                    name: probe.physical_name(number),
                    size_bytes,
                    bus: volume.storage.bus,
                    removable: volume.storage.removable,
                    letter: Some(letter),
                    mount_points,
                });
            }
            Ok(None) => {}
            Err(e) if e.is_expected_unavailable() => {
                debug!(error = &e as &dyn std::error::Error, "drive {letter}: skipped");
            }
            Err(e) => {
                debug!(error = &e as &dyn std::error::Error, "drive {letter}: unexpected failure");
                result.warnings.push(e);
            }
        }
    }

    for index in 0..probe.physical_drive_count() {
        if seen.contains(&index) {
            continue;
        }
        let Some(storage) = probe.physical_descriptor(index) else {
            continue;
        };
        debug!(
            "PhysicalDrive{index}: bus {}, removable {}",
            storage.bus, storage.removable
        );
        if !physical_eligible(storage) {
            continue;
        }
        seen.insert(index);
        result.devices.push(Device {
            id: index,
            path: probe.physical_path(index),
            name: probe.physical_name(index),
            size_bytes: probe.disk_size(index).unwrap_or(0),
            bus: storage.bus,
            removable: storage.removable,
            letter: None,
            mount_points: probe.mount_points(index, ignored),
        });
    }

    debug!("enumeration found {} device(s)", result.devices.len());
    result
}

/// Lists every physical drive that can be opened, eligible or not.
pub fn scan_physical_drives<P: DeviceProbe + ?Sized>(
    probe: &mut P,
) -> Vec<(u32, StorageDescriptor, u64)> {
    (0..LEGACY_SCAN_LIMIT.max(probe.physical_drive_count()))
        .filter_map(|index| {
            let storage = probe.physical_descriptor(index)?;
            Some((index, storage, probe.disk_size(index).unwrap_or(0)))
        })
        .collect()
}

/// Eligibility rule for a drive reached through its letter.
pub fn letter_eligible(drive_type: DriveType, bus: BusType) -> bool {
    match drive_type {
        DriveType::Removable => bus != BusType::Sata,
        DriveType::Fixed => bus == BusType::Usb || bus.is_card(),
        _ => false,
    }
}

/// Eligibility rule for a drive reached through its physical index.
///
/// Internal USB controllers report a USB bus without removable media.
pub fn physical_eligible(storage: StorageDescriptor) -> bool {
    (storage.bus == BusType::Usb && storage.removable) || storage.bus.is_card()
}

/// Returns what the storage stack reports for `letter` if it is eligible.
fn classify_letter<P: DeviceProbe + ?Sized>(
    probe: &mut P,
    letter: char,
) -> Result<Option<VolumeDescriptor>> {
    let drive_type = probe.drive_type(letter);
    if !matches!(drive_type, DriveType::Removable | DriveType::Fixed) {
        debug!("drive {letter}: {drive_type:?}, not a candidate");
        return Ok(None);
    }

    let media = probe.media_type(letter)?;
    if !media.is_disk() {
        debug!("drive {letter}: media {media:?}, not a disk");
        return Ok(None);
    }

    let volume = probe.volume_descriptor(letter)?;
    if !letter_eligible(drive_type, volume.storage.bus) {
        debug!(
            "drive {letter}: {drive_type:?} on {} bus, not eligible",
            volume.storage.bus
        );
        return Ok(None);
    }

    // Multi-card hubs report removable slots even when they are empty.
    if probe.check_verify(letter, CheckVerify::Fast)
        || probe.check_verify(letter, CheckVerify::Legacy)
    {
        Ok(Some(volume))
    } else {
        debug!("drive {letter}: no media present");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    #[derive(Clone)]
    struct Letter {
        drive_type: DriveType,
        media: MediaType,
        volume: std::result::Result<VolumeDescriptor, i32>,
        fast: bool,
        legacy: bool,
    }

    #[derive(Default)]
    struct ScriptedProbe {
        letters: Vec<(char, Letter)>,
        physical: HashMap<u32, StorageDescriptor>,
        queried: Vec<char>,
        extent_queries: Vec<char>,
        checks: Vec<(char, CheckVerify)>,
    }

    impl ScriptedProbe {
        fn letter(&self, letter: char) -> &Letter {
            &self.letters.iter().find(|(l, _)| *l == letter).unwrap().1
        }
    }

    impl DeviceProbe for ScriptedProbe {
        fn logical_drives(&mut self) -> Vec<char> {
            self.letters.iter().map(|(l, _)| *l).collect()
        }

        fn drive_type(&mut self, letter: char) -> DriveType {
            self.queried.push(letter);
            self.letter(letter).drive_type
        }

        fn media_type(&mut self, letter: char) -> Result<MediaType> {
            Ok(self.letter(letter).media)
        }

        fn volume_descriptor(&mut self, letter: char) -> Result<VolumeDescriptor> {
            match self.letter(letter).volume {
                Ok(v) => Ok(v),
                Err(code @ (1 | 21 | 1112)) => Err(Error::ExpectedDeviceUnavailable {
                    source: io::Error::from_raw_os_error(code),
                }),
                Err(code) => Err(Error::Query {
                    what: "storage property",
                    source: io::Error::from_raw_os_error(code),
                }),
            }
        }

        fn check_verify(&mut self, letter: char, check: CheckVerify) -> bool {
            self.checks.push((letter, check));
            let l = self.letter(letter);
            match check {
                CheckVerify::Fast => l.fast,
                CheckVerify::Legacy => l.legacy,
            }
        }

        fn physical_descriptor(&mut self, index: u32) -> Option<StorageDescriptor> {
            self.physical.get(&index).copied()
        }

        fn disk_size(&mut self, index: u32) -> Option<u64> {
            self.physical.contains_key(&index).then_some(u64::from(index + 1) << 30)
        }

        fn physical_path(&self, index: u32) -> PathBuf {
            PathBuf::from(format!(r"\\.\PhysicalDrive{index}"))
        }

        fn mount_points(&mut self, index: u32, ignored: &IgnoreList) -> Vec<PathBuf> {
            let mut found = Vec::new();
            for letter in self.logical_drives() {
                if ignored.contains(letter) {
                    continue;
                }
                self.extent_queries.push(letter);
                if matches!(self.letter(letter).volume, Ok(v) if v.device_number == index) {
                    found.push(PathBuf::from(format!("{letter}:\\")));
                }
            }
            found
        }
    }

    fn usb(removable: bool) -> StorageDescriptor {
        StorageDescriptor {
            bus: BusType::Usb,
            removable,
        }
    }

    fn letter(drive_type: DriveType, bus: BusType, number: u32) -> Letter {
        Letter {
            drive_type,
            media: MediaType::Removable,
            volume: Ok(VolumeDescriptor {
                storage: StorageDescriptor {
                    bus,
                    removable: drive_type == DriveType::Removable,
                },
                device_number: number,
            }),
            fast: true,
            legacy: false,
        }
    }

    fn ids(result: &Enumeration) -> Vec<u32> {
        result.devices.iter().map(|d| d.id).collect()
    }

    #[test]
    fn physical_path_requires_removable_usb() {
        let mut probe = ScriptedProbe::default();
        probe.physical.insert(0, usb(false));
        probe.physical.insert(1, usb(true));

        let result = enumerate(&mut probe, &IgnoreList::new());

        assert_eq!(ids(&result), [1]);
        assert_eq!(result.devices[0].size_bytes, 2 << 30);
        assert_eq!(result.devices[0].letter, None);
    }

    #[test]
    fn physical_path_accepts_cards_and_rejects_sata() {
        let mut probe = ScriptedProbe::default();
        let buses = [BusType::Sd, BusType::Mmc, BusType::Sata, BusType::Nvme];
        for (i, bus) in buses.into_iter().enumerate() {
            probe.physical.insert(
                i as u32,
                StorageDescriptor {
                    bus,
                    removable: false,
                },
            );
        }
        assert_eq!(ids(&enumerate(&mut probe, &IgnoreList::new())), [0, 1]);
    }

    #[test]
    fn letter_rules_follow_drive_and_bus_type() {
        assert!(letter_eligible(DriveType::Removable, BusType::Usb));
        assert!(letter_eligible(DriveType::Removable, BusType::Scsi));
        assert!(!letter_eligible(DriveType::Removable, BusType::Sata));
        assert!(letter_eligible(DriveType::Fixed, BusType::Usb));
        assert!(letter_eligible(DriveType::Fixed, BusType::Sd));
        assert!(letter_eligible(DriveType::Fixed, BusType::Mmc));
        assert!(!letter_eligible(DriveType::Fixed, BusType::Sata));
        assert!(!letter_eligible(DriveType::Remote, BusType::Usb));
        assert!(!letter_eligible(DriveType::CdRom, BusType::Usb));
    }

    #[test]
    fn ignored_letters_are_never_queried() {
        let mut probe = ScriptedProbe::default();
        probe.letters.push(('C', letter(DriveType::Fixed, BusType::Sata, 0)));
        probe.letters.push(('E', letter(DriveType::Removable, BusType::Usb, 2)));
        let mut ignored = IgnoreList::new();
        ignored.insert('c');

        let result = enumerate(&mut probe, &ignored);

        assert_eq!(probe.queried, ['E']);
        assert_eq!(ids(&result), [2]);
        assert_eq!(result.devices[0].letter, Some('E'));
        assert_eq!(result.devices[0].mount_points, [PathBuf::from("E:\\")]);
    }

    #[test]
    fn mount_point_lookup_skips_ignored_letters() {
        let mut probe = ScriptedProbe::default();
        probe.letters.push(('C', letter(DriveType::Fixed, BusType::Sata, 0)));
        probe.letters.push(('E', letter(DriveType::Removable, BusType::Usb, 2)));
        probe.letters.push(('F', letter(DriveType::Removable, BusType::Usb, 2)));
        probe.physical.insert(3, usb(true));
        let mut ignored = IgnoreList::new();
        ignored.insert('C');

        let result = enumerate(&mut probe, &ignored);

        assert!(!probe.extent_queries.contains(&'C'));
        assert_eq!(ids(&result), [2, 3]);
        assert_eq!(
            result.devices[0].mount_points,
            [PathBuf::from("E:\\"), PathBuf::from("F:\\")]
        );
        assert!(result.devices[1].mount_points.is_empty());
    }

    #[test]
    fn lettered_drive_is_not_listed_twice() {
        let mut probe = ScriptedProbe::default();
        probe.letters.push(('E', letter(DriveType::Removable, BusType::Usb, 1)));
        probe.letters.push(('F', letter(DriveType::Removable, BusType::Usb, 1)));
        probe.physical.insert(1, usb(true));
        probe.physical.insert(3, usb(true));

        let result = enumerate(&mut probe, &IgnoreList::new());

        assert_eq!(ids(&result), [1, 3]);
        assert_eq!(result.devices[0].letter, Some('E'));
        assert_eq!(result.devices[0].bus, BusType::Usb);
    }

    #[test]
    fn expected_failures_are_silent_and_others_are_reported() {
        let mut probe = ScriptedProbe::default();
        for (l, code) in [('D', 1), ('E', 21), ('F', 1112), ('G', 5)] {
            let mut entry = letter(DriveType::Removable, BusType::Usb, 0);
            entry.volume = Err(code);
            probe.letters.push((l, entry));
        }

        let result = enumerate(&mut probe, &IgnoreList::new());

        assert!(result.devices.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].os_code(), Some(5));
    }

    #[test]
    fn legacy_check_verify_is_the_fallback() {
        let mut probe = ScriptedProbe::default();
        let mut fallback = letter(DriveType::Removable, BusType::Usb, 4);
        fallback.fast = false;
        fallback.legacy = true;
        let mut empty = letter(DriveType::Removable, BusType::Usb, 5);
        empty.fast = false;
        probe.letters.push(('H', fallback));
        probe.letters.push(('I', empty));
        let mut present = letter(DriveType::Removable, BusType::Usb, 6);
        present.legacy = true;
        probe.letters.push(('J', present));

        let result = enumerate(&mut probe, &IgnoreList::new());

        assert_eq!(ids(&result), [4, 6]);
        assert_eq!(
            probe.checks,
            [
                ('H', CheckVerify::Fast),
                ('H', CheckVerify::Legacy),
                ('I', CheckVerify::Fast),
                ('I', CheckVerify::Legacy),
                ('J', CheckVerify::Fast),
            ]
        );
    }

    #[test]
    fn floppies_and_network_drives_are_excluded() {
        let mut probe = ScriptedProbe::default();
        let mut floppy = letter(DriveType::Removable, BusType::Usb, 1);
        floppy.media = MediaType::Other(2);
        probe.letters.push(('A', floppy));
        probe.letters.push(('Z', letter(DriveType::Remote, BusType::Usb, 2)));

        let result = enumerate(&mut probe, &IgnoreList::new());

        assert!(result.devices.is_empty());
        assert!(probe.checks.is_empty());
    }

    #[test]
    fn diagnostic_scan_lists_ineligible_drives_too() {
        let mut probe = ScriptedProbe::default();
        probe.physical.insert(0, StorageDescriptor { bus: BusType::Nvme, removable: false });
        probe.physical.insert(40, usb(false));

        let scan = scan_physical_drives(&mut probe);

        let indices: Vec<_> = scan.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(indices, [0, 40]);
    }
}
