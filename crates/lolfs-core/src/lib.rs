#![forbid(unsafe_code)]
//! The lolfs filesystem engine.
//!
//! A small fixed-layout disk filesystem: superblock-described regions,
//! bitmap allocation, per-file extent indexes, fixed-width directory
//! entries, a transparent compress-then-encrypt data pipeline and a
//! password-gated master key.
//!
//! One `Lolfs` handle owns one opened image. All metadata mutation is
//! serialized under a single allocator mutex; encryption-state
//! transitions are serialized under a second mutex, and every data path
//! that needs the master key re-reads the unlocked flag under that mutex.

mod check;
mod dir;
mod file;
mod format;
mod inode;
mod xattr;

pub use check::{check_device, check_path, CheckReport};
pub use dir::DirEntryInfo;
pub use format::FormatOptions;
pub use lolfs_block::{
    locate_base, ByteDevice, FileByteDevice, MemByteDevice, RawImage, SectionLocator,
};
pub use lolfs_keys::EncryptionStatus;
pub use xattr::XattrSetFlags;

use lolfs_alloc::Allocator;
use lolfs_block::BlockIo;
use lolfs_error::{LolfsError, Result};
use lolfs_keys::KeyManager;
use lolfs_ondisk::{ExtentIndex, Superblock};
use lolfs_types::{
    BLOCK_SIZE, BlockNo, CompAlgo, EncAlgo, InodeNo, KdfAlgo, LOLFS_VERSION, MIN_BLOCKS,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

// ── Handle ──────────────────────────────────────────────────────────────────

/// Mutable filesystem state guarded by the allocator mutex.
pub(crate) struct FsState {
    pub(crate) sb: Superblock,
    pub(crate) alloc: Allocator,
}

/// An opened lolfs image.
pub struct Lolfs {
    pub(crate) io: BlockIo,
    pub(crate) state: Mutex<FsState>,
    pub(crate) keys: Mutex<KeyManager>,
}

/// Filesystem totals, as reported by `statfs`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FsStats {
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub block_size: u32,
}

impl Lolfs {
    /// Open an image on an arbitrary byte device, with `base` naming the
    /// byte offset of the superblock (0 for raw images).
    pub fn open_device(dev: Box<dyn ByteDevice>, base: u64) -> Result<Self> {
        let io = BlockIo::new(dev, base)?;
        Self::open_io(io)
    }

    /// Open a raw image file.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_path_at(path, 0)
    }

    /// Open an image file whose superblock sits at byte offset `base`.
    pub fn open_path_at(path: impl AsRef<Path>, base: u64) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Self::open_device(Box::new(dev), base)
    }

    fn open_io(io: BlockIo) -> Result<Self> {
        let block0 = io.read_block(BlockNo(0))?;
        let sb = Superblock::parse(&block0).map_err(|e| LolfsError::Format(e.to_string()))?;

        if sb.version != LOLFS_VERSION {
            return Err(LolfsError::Format(format!(
                "unsupported version {} (expected {LOLFS_VERSION})",
                sb.version
            )));
        }
        if sb.nr_blocks < MIN_BLOCKS {
            return Err(LolfsError::Format(format!(
                "block count {} below the minimum of {MIN_BLOCKS}",
                sb.nr_blocks
            )));
        }
        if sb.nr_blocks > io.block_count() {
            return Err(LolfsError::Format(format!(
                "superblock claims {} blocks but the backing array holds {}",
                sb.nr_blocks,
                io.block_count()
            )));
        }
        if CompAlgo::from_raw(sb.comp_default_algo).is_none() {
            return Err(LolfsError::Format(format!(
                "unknown compression algorithm id {}",
                sb.comp_default_algo
            )));
        }
        if EncAlgo::from_raw(sb.enc_default_algo).is_none() {
            return Err(LolfsError::Format(format!(
                "unknown encryption algorithm id {}",
                sb.enc_default_algo
            )));
        }
        if KdfAlgo::from_raw(sb.enc_kdf_algo).is_none() {
            return Err(LolfsError::Format(format!(
                "unknown KDF algorithm id {}",
                sb.enc_kdf_algo
            )));
        }

        let alloc = Allocator::load(&io, &sb)?;
        let keys = KeyManager::from_superblock(&sb)?;
        info!(
            target: "lolfs::core",
            blocks = sb.nr_blocks,
            inodes = sb.nr_inodes,
            encrypted = sb.enc_enabled != 0,
            "opened filesystem"
        );

        Ok(Self {
            io,
            state: Mutex::new(FsState { sb, alloc }),
            keys: Mutex::new(keys),
        })
    }

    /// Persist the superblock free counters and sync the device.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        write_superblock(&self.io, &mut state)?;
        self.io.sync()
    }

    /// Flush and drop the handle; the in-memory master key is zeroed.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    /// Derive the user key from `password` and unwrap the master key.
    pub fn unlock(&self, password: &str) -> Result<()> {
        self.keys.lock().unlock(password)
    }

    /// Zero the in-memory master key and return to the locked state.
    pub fn lock(&self) {
        self.keys.lock().lock();
    }

    /// `{enabled, algorithm, unlocked}`.
    pub fn encryption_status(&self) -> EncryptionStatus {
        self.keys.lock().status()
    }

    /// Filesystem totals.
    pub fn statfs(&self) -> FsStats {
        let state = self.state.lock();
        FsStats {
            total_blocks: state.sb.nr_blocks,
            free_blocks: state.alloc.free_block_count(),
            total_inodes: state.sb.nr_inodes,
            free_inodes: state.alloc.free_inode_count(),
            block_size: BLOCK_SIZE,
        }
    }

    /// Snapshot of the master key for data paths, `None` when the
    /// filesystem is not encrypted, `PermissionDenied` while locked.
    pub(crate) fn data_key(&self, state: &FsState) -> Result<Option<[u8; 32]>> {
        if state.sb.enc_enabled == 0 {
            return Ok(None);
        }
        Ok(Some(*self.keys.lock().master_key()?))
    }
}

// ── Crate-internal helpers ──────────────────────────────────────────────────

/// Write the superblock with current free counters back to block 0.
pub(crate) fn write_superblock(io: &BlockIo, state: &mut FsState) -> Result<()> {
    let FsState { sb, alloc } = state;
    alloc.store_counts(sb);
    let mut block = vec![0_u8; BLOCK_SIZE as usize];
    sb.encode_into(&mut block);
    io.write_block(BlockNo(0), &block)
}

/// Load an inode's extent index block.
pub(crate) fn load_index(io: &BlockIo, ei_block: u32) -> Result<ExtentIndex> {
    if ei_block == 0 {
        return Err(LolfsError::Corruption {
            block: 0,
            detail: "inode has no extent index block".into(),
        });
    }
    let block = io.read_block(BlockNo(ei_block))?;
    ExtentIndex::parse(&block).map_err(|e| LolfsError::Corruption {
        block: ei_block,
        detail: e.to_string(),
    })
}

/// Persist an extent index block.
pub(crate) fn store_index(io: &BlockIo, ei_block: u32, index: &ExtentIndex) -> Result<()> {
    let mut block = vec![0_u8; BLOCK_SIZE as usize];
    index.encode_into(&mut block);
    io.write_block(BlockNo(ei_block), &block)
}

/// Wall-clock seconds for inode timestamps.
pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Reject empty names, path separators and names over the length limit.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(LolfsError::Format(format!("invalid file name {name:?}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(LolfsError::Format(format!("invalid file name {name:?}")));
    }
    if name.len() > lolfs_types::FILENAME_LEN {
        return Err(LolfsError::TooBig);
    }
    Ok(())
}

pub(crate) fn parse_comp_algo(raw: u16) -> Result<CompAlgo> {
    CompAlgo::from_raw(u32::from(raw)).ok_or_else(|| LolfsError::Format(format!(
        "unknown compression algorithm id {raw}"
    )))
}

pub(crate) fn parse_enc_algo(raw: u8) -> Result<EncAlgo> {
    EncAlgo::from_raw(u32::from(raw)).ok_or_else(|| LolfsError::Format(format!(
        "unknown encryption algorithm id {raw}"
    )))
}

/// Resolve an absolute path to an inode, component by component.
impl Lolfs {
    pub fn resolve_path(&self, path: &str) -> Result<InodeNo> {
        let mut current = InodeNo::ROOT;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if component == ".." {
                return Err(LolfsError::Format(
                    "parent traversal is not supported in paths".into(),
                ));
            }
            current = self.lookup(current, component)?;
        }
        Ok(current)
    }

    /// Split a path into its parent directory inode and leaf name.
    pub fn resolve_parent(&self, path: &str) -> Result<(InodeNo, String)> {
        let trimmed = path.trim_end_matches('/');
        let (dir, leaf) = match trimmed.rfind('/') {
            Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
            None => ("", trimmed),
        };
        if leaf.is_empty() {
            return Err(LolfsError::Format(format!("path {path:?} has no file name")));
        }
        let parent = self.resolve_path(dir)?;
        Ok((parent, leaf.to_owned()))
    }
}
