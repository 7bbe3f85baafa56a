//! Image files: transparent decompression, size fitting and hashing.
//!
//! Compressed images (`.gz`, `.xz`, `.zst`) are unpacked to a temporary
//! file before any device is touched, so the transfer loop always works on a
//! seekable, sector-addressable source. The temporary file is deleted when
//! the [`SourceImage`] is dropped.
use crate::device::Geometry;
use crate::error::{Error, Result};
use crate::sector_io::sectors_for_len;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

const BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Picks the decoder from the file extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "gz" | "gzip" => Compression::Gzip,
            "xz" => Compression::Xz,
            "zst" | "zstd" => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

/// An image ready to be transferred sector by sector.
#[derive(Debug)]
pub struct SourceImage {
    origin: PathBuf,
    file: File,
    len: u64,
    _temp: Option<TempPath>,
}

impl SourceImage {
    /// Opens `path`, unpacking it first when compressed.
    ///
    /// Decompression observes `running` between buffers and fails with
    /// [`Error::Cancelled`] once it is cleared.
    pub fn open<F>(path: &Path, running: &AtomicBool, mut on_progress: F) -> Result<Self>
    where
        F: FnMut(u64),
    {
        let handle_err = |source| Error::Handle {
            path: path.to_path_buf(),
            source,
        };
        let input = File::open(path).map_err(handle_err)?;

        let mut reader: Box<dyn Read> = match Compression::from_path(path) {
            Compression::None => {
                let len = input.metadata().map_err(handle_err)?.len();
                return Ok(Self {
                    origin: path.to_path_buf(),
                    file: input,
                    len,
                    _temp: None,
                });
            }
            Compression::Gzip => Box::new(GzDecoder::new(BufReader::new(input))),
            Compression::Xz => Box::new(XzDecoder::new(BufReader::new(input))),
            Compression::Zstd => {
                Box::new(ZstdDecoder::new(BufReader::new(input)).map_err(handle_err)?)
            }
        };

        info!("decompressing {}", path.display());
        let mut temp = NamedTempFile::new().map_err(handle_err)?;
        let mut total: u64 = 0;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            let mut buffer = vec![0u8; BUFFER_SIZE];
            loop {
                if !running.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }
                let n = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(handle_err(e)),
                };
                writer.write_all(&buffer[..n]).map_err(handle_err)?;
                total += n as u64;
                on_progress(total);
            }
            writer.flush().map_err(handle_err)?;
        }
        debug!("decompressed {total} bytes to {}", temp.path().display());

        let (mut file, temp_path) = temp.into_parts();
        file.seek(SeekFrom::Start(0)).map_err(handle_err)?;
        Ok(Self {
            origin: path.to_path_buf(),
            file,
            len: total,
            _temp: Some(temp_path),
        })
    }

    /// The path the image was opened from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn was_decompressed(&self) -> bool {
        self._temp.is_some()
    }

    /// Whether any byte at or after `offset` is non-zero.
    pub fn has_data_after(&mut self, offset: u64) -> Result<bool> {
        if offset >= self.len {
            return Ok(false);
        }
        let handle_err = |source| Error::Handle {
            path: self.origin.clone(),
            source,
        };
        self.file.seek(SeekFrom::Start(offset)).map_err(handle_err)?;
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let n = match self.file.read(&mut buffer) {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(handle_err(e)),
            };
            if buffer[..n].iter().any(|&b| b != 0) {
                return Ok(true);
            }
        }
    }

    /// Decides how many sectors of this image go to a device of `geometry`.
    ///
    /// When the image is larger than the device, `confirm` is asked whether
    /// to write a truncated image and `None` is returned if it declines.
    pub fn fit<C>(&mut self, geometry: Geometry, confirm: C) -> Result<Option<u64>>
    where
        C: FnOnce(&Oversize) -> bool,
    {
        if self.is_empty() {
            return Err(Error::EmptyImage {
                path: self.origin.clone(),
            });
        }
        let image_sectors = sectors_for_len(self.len, geometry.sector_size);
        if image_sectors <= geometry.sector_count {
            return Ok(Some(image_sectors));
        }

        let oversize = Oversize {
            image_sectors,
            device_sectors: geometry.sector_count,
            trailing_data: self.has_data_after(geometry.size_bytes())?,
        };
        debug!("{oversize:?}");
        if confirm(&oversize) {
            info!("truncating image to {} sectors", geometry.sector_count);
            Ok(Some(geometry.sector_count))
        } else {
            Ok(None)
        }
    }
}

impl Read for SourceImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for SourceImage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// An image that does not fit on the selected device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Oversize {
    pub image_sectors: u64,
    pub device_sectors: u64,
    /// Whether the part that would be cut off holds anything but zeros.
    pub trailing_data: bool,
}

/// Computes the SHA-256 digest of a file as lowercase hex.
pub fn sha256_file<F>(path: &Path, running: &AtomicBool, mut on_progress: F) -> Result<String>
where
    F: FnMut(u64),
{
    let handle_err = |source| Error::Handle {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(handle_err)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        let n = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(handle_err(e)),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
        on_progress(total);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
