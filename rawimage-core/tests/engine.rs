use flate2::Compression as Level;
use flate2::write::GzEncoder;
use rawimage_core::device::{BlockAccess, Geometry};
use rawimage_core::error::{Error, Result};
use rawimage_core::image::Oversize;
use rawimage_core::read::ReadOptions;
use rawimage_core::session::{EngineState, Event, OperationContext, Outcome};
use rawimage_core::volume::VolumeControl;
use rawimage_core::write::WriteOptions;
use rawimage_core::{detect, read, verify, write};
use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

const SECTOR: u64 = 512;

/// An in-memory disk that records its volume calls.
struct MemDevice {
    data: Cursor<Vec<u8>>,
    calls: Vec<&'static str>,
    fail_lock: bool,
    fail_dismount: bool,
    sector_size: u64,
    path: PathBuf,
}

impl MemDevice {
    fn new(sectors: u64) -> Self {
        Self::with_data(vec![0u8; (sectors * SECTOR) as usize])
    }

    fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Cursor::new(data),
            calls: Vec::new(),
            fail_lock: false,
            fail_dismount: false,
            sector_size: SECTOR,
            path: PathBuf::from("mem0"),
        }
    }

    fn contents(&self) -> &[u8] {
        self.data.get_ref()
    }

    fn unlocks(&self) -> usize {
        self.calls.iter().filter(|&&c| c == "unlock").count()
    }
}

impl Read for MemDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Write for MemDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self
            .data
            .get_ref()
            .len()
            .saturating_sub(self.data.position() as usize);
        let n = buf.len().min(room);
        self.data.write(&buf[..n])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.calls.push("flush");
        Ok(())
    }
}

impl Seek for MemDevice {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.seek(pos)
    }
}

impl VolumeControl for MemDevice {
    fn lock(&mut self) -> Result<()> {
        self.calls.push("lock");
        if self.fail_lock {
            return Err(Error::Lock {
                path: self.path.clone(),
                source: io::Error::from_raw_os_error(32),
            });
        }
        Ok(())
    }

    fn dismount(&mut self) -> Result<()> {
        self.calls.push("dismount");
        if self.fail_dismount {
            return Err(Error::Dismount {
                path: self.path.clone(),
                source: io::Error::from_raw_os_error(5),
            });
        }
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        self.calls.push("unlock");
        Ok(())
    }
}

impl BlockAccess for MemDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn geometry(&mut self) -> Result<Geometry> {
        Ok(Geometry {
            sector_size: self.sector_size,
            sector_count: self.data.get_ref().len() as u64 / SECTOR,
        })
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn image_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).unwrap();
    path
}

fn plenty(_: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

fn no_prompt(_: &Oversize) -> bool {
    panic!("unexpected oversize prompt")
}

#[test]
fn write_then_read_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let payload = pattern(2500 * SECTOR as usize + 100);
    let source = image_file(dir.path(), "source.img", &payload);
    let mut dev = MemDevice::new(4096);
    let ctx = OperationContext::default();

    let mut started = Vec::new();
    let options = WriteOptions { verify: true };
    let outcome = write::run(&ctx, &mut dev, &source, &options, no_prompt, |e| {
        if let Event::Started {
            state,
            total_sectors,
            ..
        } = e
        {
            started.push((state, total_sectors));
        }
    })
    .unwrap();

    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(
        started,
        [(EngineState::Writing, 2501), (EngineState::Verifying, 2501)]
    );
    assert_eq!(&dev.contents()[..payload.len()], &payload[..]);
    assert!(dev.contents()[payload.len()..].iter().all(|&b| b == 0));
    assert_eq!(dev.calls, ["lock", "dismount", "flush", "unlock"]);
    assert_eq!(ctx.state(), EngineState::Idle);

    let copy = dir.path().join("copy.img");
    let options = ReadOptions::default();
    let outcome = read::run(&ctx, &mut dev, &copy, &options, &plenty, |_| {}).unwrap();
    assert_eq!(outcome, Outcome::Completed);
    let back = fs::read(&copy).unwrap();
    assert_eq!(back.len(), 4096 * SECTOR as usize);
    assert_eq!(&back[..payload.len()], &payload[..]);
    assert_eq!(dev.unlocks(), 2);
}

#[test]
fn compressed_images_are_unpacked_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let payload = pattern(3 * SECTOR as usize);
    let path = dir.path().join("disk.img.gz");
    let mut enc = GzEncoder::new(fs::File::create(&path).unwrap(), Level::default());
    enc.write_all(&payload).unwrap();
    enc.finish().unwrap();

    let mut dev = MemDevice::new(16);
    let ctx = OperationContext::default();
    let mut unpacked = 0;
    let options = WriteOptions { verify: true };
    let outcome = write::run(&ctx, &mut dev, &path, &options, no_prompt, |e| {
        if let Event::Decompressing { bytes } = e {
            unpacked = bytes;
        }
    })
    .unwrap();

    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(unpacked, payload.len() as u64);
    assert_eq!(&dev.contents()[..payload.len()], &payload[..]);
}

#[test]
fn verify_reports_the_first_differing_sector() {
    let dir = tempfile::tempdir().unwrap();
    let payload = pattern(2048 * SECTOR as usize);
    let source = image_file(dir.path(), "source.img", &payload);

    let ctx = OperationContext::default();
    let mut same = MemDevice::with_data(payload.clone());
    let outcome = verify::run(&ctx, &mut same, &source, no_prompt, |_| {}).unwrap();
    assert_eq!(outcome, Outcome::Completed);

    let mut corrupted = payload.clone();
    corrupted[1500 * SECTOR as usize + 17] ^= 0x01;
    let mut dev = MemDevice::with_data(corrupted);
    let err = verify::run(&ctx, &mut dev, &source, no_prompt, |_| {}).unwrap_err();

    assert!(matches!(err, Error::VerifyMismatch { sector: 1500 }), "{err}");
    assert_eq!(dev.unlocks(), 1);
    assert_eq!(ctx.state(), EngineState::Idle);
}

#[test]
fn cancellation_stops_after_the_chunk_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let payload = vec![0xEEu8; 4096 * SECTOR as usize];
    let source = image_file(dir.path(), "source.img", &payload);
    let mut dev = MemDevice::new(4096);
    let ctx = OperationContext::default();
    let running = ctx.running().clone();

    let options = WriteOptions { verify: true };
    let outcome = write::run(&ctx, &mut dev, &source, &options, no_prompt, |e| {
        if let Event::Progress(_) = e {
            running.store(false, Ordering::SeqCst);
        }
    })
    .unwrap();

    assert_eq!(outcome, Outcome::Canceled);
    let chunk = 1024 * SECTOR as usize;
    assert!(dev.contents()[..chunk].iter().all(|&b| b == 0xEE));
    assert!(dev.contents()[chunk..].iter().all(|&b| b == 0));
    assert_eq!(dev.calls, ["lock", "dismount", "unlock"]);
    assert_eq!(ctx.state(), EngineState::Idle);
}

#[test]
fn cancelled_read_removes_the_partial_image() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.img");
    let mut dev = MemDevice::new(3000);
    let ctx = OperationContext::default();
    let running = ctx.running().clone();

    let options = ReadOptions::default();
    let outcome = read::run(&ctx, &mut dev, &out, &options, &plenty, |_| {
        running.store(false, Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(outcome, Outcome::Canceled);
    assert!(!out.exists());
    assert_eq!(dev.unlocks(), 1);
}

#[test]
fn exit_request_leaves_the_engine_in_exit() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.img");
    let mut dev = MemDevice::new(3000);
    let ctx = OperationContext::default();

    let options = ReadOptions::default();
    let outcome =
        read::run(&ctx, &mut dev, &out, &options, &plenty, |_| ctx.request_exit()).unwrap();

    assert_eq!(outcome, Outcome::Canceled);
    assert_eq!(ctx.state(), EngineState::Exit);
}

#[test]
fn failed_lock_never_unlocks_and_failed_dismount_unlocks_once() {
    let dir = tempfile::tempdir().unwrap();
    let source = image_file(dir.path(), "source.img", &[1u8; 512]);
    let ctx = OperationContext::default();
    let options = WriteOptions::default();

    let mut locked_elsewhere = MemDevice::new(8);
    locked_elsewhere.fail_lock = true;
    let err = write::run(&ctx, &mut locked_elsewhere, &source, &options, no_prompt, |_| {})
        .unwrap_err();
    assert!(matches!(err, Error::Lock { .. }));
    assert_eq!(err.os_code(), Some(32));
    assert_eq!(locked_elsewhere.calls, ["lock"]);

    let mut busy_fs = MemDevice::new(8);
    busy_fs.fail_dismount = true;
    let err = write::run(&ctx, &mut busy_fs, &source, &options, no_prompt, |_| {}).unwrap_err();
    assert!(matches!(err, Error::Dismount { .. }));
    assert_eq!(busy_fs.calls, ["lock", "dismount", "unlock"]);
    assert!(busy_fs.contents().iter().all(|&b| b == 0));
    assert_eq!(ctx.state(), EngineState::Idle);
}

#[test]
fn oversized_image_is_truncated_only_when_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let payload = pattern(20 * SECTOR as usize);
    let source = image_file(dir.path(), "big.img", &payload);
    let ctx = OperationContext::default();
    let options = WriteOptions::default();
    let decline = |o: &Oversize| {
        assert_eq!((o.image_sectors, o.device_sectors), (20, 8));
        assert!(o.trailing_data);
        false
    };

    let mut declined = MemDevice::new(8);
    let outcome = write::run(&ctx, &mut declined, &source, &options, decline, |_| {}).unwrap();
    assert_eq!(outcome, Outcome::Canceled);
    assert!(declined.contents().iter().all(|&b| b == 0));
    assert_eq!(declined.unlocks(), 1);

    let mut accepted = MemDevice::new(8);
    let outcome = write::run(&ctx, &mut accepted, &source, &options, |_| true, |_| {}).unwrap();
    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(accepted.contents(), &payload[..8 * SECTOR as usize]);
}

#[test]
fn allocated_only_read_stops_at_the_mbr_extent() {
    let dir = tempfile::tempdir().unwrap();
    let mut disk = vec![0u8; 8192 * SECTOR as usize];
    // One partition: start 2048, 2048 sectors.
    disk[0x1BE + 8..0x1BE + 12].copy_from_slice(&2048u32.to_le_bytes());
    disk[0x1BE + 12..0x1BE + 16].copy_from_slice(&2048u32.to_le_bytes());
    disk[510] = 0x55;
    disk[511] = 0xAA;
    let mut dev = MemDevice::with_data(disk);
    let out = dir.path().join("allocated.img");
    let ctx = OperationContext::default();

    let options = ReadOptions {
        allocated_only: true,
    };
    read::run(&ctx, &mut dev, &out, &options, &plenty, |_| {}).unwrap();

    assert_eq!(fs::metadata(&out).unwrap().len(), 4096 * SECTOR);
}

#[test]
fn read_is_refused_without_enough_free_space() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.img");
    let mut dev = MemDevice::new(100);
    let ctx = OperationContext::default();
    let tight = |_: &Path| -> Result<u64> { Ok(99 * SECTOR) };

    let options = ReadOptions::default();
    let err = read::run(&ctx, &mut dev, &out, &options, &tight, |_| {}).unwrap_err();

    match err {
        Error::Space { needed, available } => {
            assert_eq!((needed, available), (100 * SECTOR, 99 * SECTOR))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!out.exists());
    assert_eq!(dev.unlocks(), 1);
}

#[test]
fn existing_image_counts_toward_free_space() {
    let dir = tempfile::tempdir().unwrap();
    let out = image_file(dir.path(), "out.img", &vec![0u8; 60 * SECTOR as usize]);
    let mut dev = MemDevice::new(100);
    let ctx = OperationContext::default();
    let tight = |_: &Path| -> Result<u64> { Ok(40 * SECTOR) };

    let options = ReadOptions::default();
    let outcome = read::run(&ctx, &mut dev, &out, &options, &tight, |_| {}).unwrap();

    assert_eq!(outcome, Outcome::Completed);
    assert_eq!(fs::metadata(&out).unwrap().len(), 100 * SECTOR);
}

#[test]
fn empty_image_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = image_file(dir.path(), "empty.img", &[]);
    let mut dev = MemDevice::new(8);
    let ctx = OperationContext::default();

    let options = WriteOptions::default();
    let err = write::run(&ctx, &mut dev, &source, &options, no_prompt, |_| {}).unwrap_err();

    assert!(matches!(err, Error::EmptyImage { .. }));
    assert_eq!(dev.calls, ["lock", "dismount", "unlock"]);
}

#[test]
fn operations_do_not_nest() {
    let dir = tempfile::tempdir().unwrap();
    let source = image_file(dir.path(), "source.img", &[1u8; 512]);
    let ctx = OperationContext::default();
    let _guard = ctx.enter(EngineState::Reading).unwrap();

    let mut dev = MemDevice::new(8);
    let options = WriteOptions::default();
    let err = write::run(&ctx, &mut dev, &source, &options, no_prompt, |_| {}).unwrap_err();

    assert!(matches!(err, Error::Busy));
    assert!(dev.calls.is_empty());
}

#[test]
fn detect_lists_gpt_partitions() {
    let mut disk = vec![0u8; 256 * SECTOR as usize];
    disk[512..520].copy_from_slice(b"EFI PART");
    let entry = 1024;
    disk[entry] = 0xAF;
    disk[entry + 0x20..entry + 0x28].copy_from_slice(&34u64.to_le_bytes());
    disk[entry + 0x28..entry + 0x30].copy_from_slice(&99u64.to_le_bytes());
    for (i, unit) in "boot".encode_utf16().enumerate() {
        let at = entry + 0x38 + 2 * i;
        disk[at..at + 2].copy_from_slice(&unit.to_le_bytes());
    }
    let mut dev = MemDevice::with_data(disk);
    let ctx = OperationContext::default();

    let found = detect::run(&ctx, &mut dev).unwrap();

    let gpt = found.gpt.expect("GPT header");
    let names: Vec<_> = gpt.partitions.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["GPT", "boot"]);
    assert_eq!(gpt.partitions[1].size_bytes, 66 * SECTOR);
    assert_eq!(found.mbr_extent, None);
    assert_eq!(dev.unlocks(), 1);
}

#[test]
fn detect_on_an_mbr_only_disk_keeps_the_extent() {
    let mut disk = vec![0u8; 128 * SECTOR as usize];
    disk[0x1BE + 8..0x1BE + 12].copy_from_slice(&8u32.to_le_bytes());
    disk[0x1BE + 12..0x1BE + 16].copy_from_slice(&100u32.to_le_bytes());
    disk[510] = 0x55;
    disk[511] = 0xAA;
    let mut dev = MemDevice::with_data(disk);
    let ctx = OperationContext::default();

    let found = detect::run(&ctx, &mut dev).unwrap();

    assert!(found.gpt.is_none());
    assert_eq!(found.mbr_extent, Some(108));
    assert_eq!(dev.unlocks(), 1);
}

#[test]
fn zero_sector_size_is_a_geometry_error() {
    let mut dev = MemDevice::new(100);
    dev.sector_size = 0;
    let ctx = OperationContext::default();

    let err = detect::run(&ctx, &mut dev).unwrap_err();

    assert!(matches!(err, Error::Geometry { .. }), "{err}");
    assert_eq!(dev.calls, ["lock", "dismount", "unlock"]);
    assert_eq!(ctx.state(), EngineState::Idle);
}
