#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Reads and writes 4 KiB blocks against a backing byte array. A base
//! offset, zero for raw images and nonzero for images embedded in a host
//! container, is added to every access. This layer never interprets
//! block contents.

use lolfs_error::{LolfsError, Result};
use lolfs_types::{BLOCK_SIZE, BlockNo};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

// ── Byte devices ────────────────────────────────────────────────────────────

/// A random-access byte array; the backing store for a filesystem image.
pub trait ByteDevice: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    fn len_bytes(&self) -> u64;
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using positioned reads and writes.
pub struct FileByteDevice {
    file: File,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Open an existing image read-only.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Create (or truncate) an image of exactly `size` bytes.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        Ok(Self { file, len: size })
    }
}

impl ByteDevice for FileByteDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory byte device, used by tests and by adapters that already hold
/// the whole container in memory.
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; size]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    /// Snapshot of the full backing array.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset)
            .map_err(|_| LolfsError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| LolfsError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(offset)
            .map_err(|_| LolfsError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| LolfsError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)))?;
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Container section contract ──────────────────────────────────────────────

/// Contract consumed from the host-container collaborator: given the
/// leading bytes of a backing array, return the byte offset where the
/// embedded image begins, or 0 for a raw image.
///
/// The engine never parses the container format itself.
pub trait SectionLocator {
    fn find_section(&self, container_head: &[u8]) -> u64;
}

/// Locator for raw images: the superblock is at byte 0.
pub struct RawImage;

impl SectionLocator for RawImage {
    fn find_section(&self, _container_head: &[u8]) -> u64 {
        0
    }
}

/// Bytes of the container head handed to a locator.
const LOCATOR_HEAD_LEN: u64 = 64 * 1024;

/// Resolve the base offset of a device by consulting `locator` with the
/// leading bytes of the backing array.
pub fn locate_base(dev: &dyn ByteDevice, locator: &dyn SectionLocator) -> Result<u64> {
    let head_len = dev.len_bytes().min(LOCATOR_HEAD_LEN);
    let mut head = vec![0_u8; head_len as usize];
    dev.read_at(0, &mut head)?;
    Ok(locator.find_section(&head))
}

// ── Block I/O ───────────────────────────────────────────────────────────────

/// Block-granular access to a byte device, biased by a base offset.
pub struct BlockIo {
    dev: Box<dyn ByteDevice>,
    base: u64,
}

impl BlockIo {
    /// Wrap a device with the given base offset.
    pub fn new(dev: Box<dyn ByteDevice>, base: u64) -> Result<Self> {
        if base >= dev.len_bytes() && dev.len_bytes() > 0 {
            return Err(LolfsError::Format(format!(
                "base offset {base} is beyond the backing array ({} bytes)",
                dev.len_bytes()
            )));
        }
        Ok(Self { dev, base })
    }

    /// Base offset added to every block access.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of whole blocks addressable past the base offset.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        let usable = self.dev.len_bytes().saturating_sub(self.base);
        u32::try_from(usable / u64::from(BLOCK_SIZE)).unwrap_or(u32::MAX)
    }

    /// Read one 4 KiB block.
    pub fn read_block(&self, block: BlockNo) -> Result<Vec<u8>> {
        trace!(target: "lolfs::block", block = block.0, "read");
        let mut buf = vec![0_u8; BLOCK_SIZE as usize];
        self.dev.read_at(self.base + block.byte_offset(), &mut buf)?;
        Ok(buf)
    }

    /// Write one 4 KiB block. The buffer must be exactly one block long.
    pub fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE as usize {
            return Err(LolfsError::Format(format!(
                "block write must be {BLOCK_SIZE} bytes, got {}",
                data.len()
            )));
        }
        trace!(target: "lolfs::block", block = block.0, "write");
        self.dev.write_at(self.base + block.byte_offset(), data)
    }

    /// Flush the backing device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
