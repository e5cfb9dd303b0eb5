//! Filesystem checking (fsck).
//!
//! Read-only validation of an image: superblock invariants, root inode
//! shape, bitmap popcounts against the stored free counters, every
//! allocated inode's extent index, flag/algorithm consistency, and
//! block reachability.

use lolfs_alloc::{bitmap_count_set, bitmap_get};
use lolfs_block::{BlockIo, ByteDevice, FileByteDevice};
use lolfs_error::Result;
use lolfs_extent::Bounds;
use lolfs_ondisk::{CompMeta, ExtentIndex, Inode, Superblock, XattrIndex};
use lolfs_types::{
    BLOCK_SIZE, BlockNo, CompAlgo, EncAlgo, EXT_COMPRESSED, EXT_ENCRYPTED, EXT_HAS_META,
    FEATURE_LARGE_EXTENTS, FILES_PER_BLOCK, FileKind, INODES_PER_BLOCK, InodeNo, KdfAlgo,
    LOLFS_VERSION, MIN_BLOCKS,
};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Findings of a `check` run. The image is healthy when `errors` is
/// empty; warnings flag oddities that do not break reading.
#[derive(Debug, Default, Serialize)]
pub struct CheckReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Check the image in `path` (raw layout, superblock at byte 0).
pub fn check_path(path: impl AsRef<Path>) -> Result<CheckReport> {
    let dev = FileByteDevice::open_readonly(path)?;
    check_device(Box::new(dev), 0)
}

/// Check the image on `dev`, with the superblock at byte offset `base`.
pub fn check_device(dev: Box<dyn ByteDevice>, base: u64) -> Result<CheckReport> {
    let io = BlockIo::new(dev, base)?;
    let mut report = CheckReport::default();

    let block0 = io.read_block(BlockNo(0))?;
    let sb = match Superblock::parse(&block0) {
        Ok(sb) => sb,
        Err(err) => {
            report.error(format!("superblock: {err}"));
            return Ok(report);
        }
    };

    check_superblock(&sb, &io, &mut report);
    if !report.is_clean() {
        return Ok(report);
    }

    // Reachability map: 1 bit per block, seeded with the metadata region.
    let mut reachable = vec![false; sb.nr_blocks as usize];
    for block in 0..sb.data_block_start() {
        reachable[block as usize] = true;
    }

    let ifree = read_bitmap(&io, sb.ifree_bitmap_start(), sb.nr_ifree_blocks)?;
    let bfree = read_bitmap(&io, sb.bfree_bitmap_start(), sb.nr_bfree_blocks)?;
    check_bitmaps(&sb, &ifree, &bfree, &mut report);

    check_root_inode(&sb, &io, &mut report)?;

    for ino in 0..sb.nr_inodes {
        if bitmap_get(&ifree, ino) {
            continue;
        }
        check_inode(&sb, &io, InodeNo(ino), &mut report, &mut reachable)?;
    }

    check_reachability(&sb, &bfree, &reachable, &mut report);

    info!(
        target: "lolfs::check",
        errors = report.errors.len(),
        warnings = report.warnings.len(),
        "check finished"
    );
    Ok(report)
}

// ── Superblock ──────────────────────────────────────────────────────────────

fn check_superblock(sb: &Superblock, io: &BlockIo, report: &mut CheckReport) {
    if sb.version != LOLFS_VERSION {
        report.error(format!(
            "unsupported version {} (expected {LOLFS_VERSION})",
            sb.version
        ));
    }
    if sb.nr_blocks < MIN_BLOCKS {
        report.error(format!(
            "block count {} below the minimum of {MIN_BLOCKS}",
            sb.nr_blocks
        ));
    }
    if sb.nr_blocks > io.block_count() {
        report.error(format!(
            "superblock claims {} blocks but the backing array holds {}",
            sb.nr_blocks,
            io.block_count()
        ));
    }
    if sb.nr_inodes == 0 {
        report.error("inode count is zero");
        return;
    }
    if sb.nr_inodes % INODES_PER_BLOCK != 0 {
        report.warn(format!(
            "inode count {} is not a multiple of {INODES_PER_BLOCK}",
            sb.nr_inodes
        ));
    }
    let expected_istore = sb.nr_inodes / INODES_PER_BLOCK;
    if sb.nr_istore_blocks != expected_istore {
        report.error(format!(
            "inode store spans {} blocks, expected {expected_istore}",
            sb.nr_istore_blocks
        ));
    }

    if CompAlgo::from_raw(sb.comp_default_algo).is_none() {
        report.error(format!(
            "unknown compression algorithm id {}",
            sb.comp_default_algo
        ));
    }
    if EncAlgo::from_raw(sb.enc_default_algo).is_none() {
        report.error(format!(
            "unknown encryption algorithm id {}",
            sb.enc_default_algo
        ));
    }
    match KdfAlgo::from_raw(sb.enc_kdf_algo) {
        None => report.error(format!("unknown KDF algorithm id {}", sb.enc_kdf_algo)),
        Some(kdf) => {
            if sb.enc_enabled != 0 {
                if kdf == KdfAlgo::None {
                    report.error("encryption enabled without a KDF");
                } else if sb.enc_kdf_iterations == 0 {
                    report.warn("KDF iteration count is zero");
                }
            }
        }
    }

    if sb.nr_free_inodes > sb.nr_inodes {
        report.error(format!(
            "free inodes ({}) exceed total inodes ({})",
            sb.nr_free_inodes, sb.nr_inodes
        ));
    }
    if sb.nr_free_blocks > sb.nr_blocks {
        report.error(format!(
            "free blocks ({}) exceed total blocks ({})",
            sb.nr_free_blocks, sb.nr_blocks
        ));
    }

    let metadata = 1 + sb.nr_istore_blocks + sb.nr_ifree_blocks + sb.nr_bfree_blocks;
    if sb.nr_blocks.saturating_sub(sb.nr_free_blocks) < metadata {
        report.error(format!(
            "used block count is below the {metadata} metadata blocks"
        ));
    }
}

// ── Bitmaps ─────────────────────────────────────────────────────────────────

fn read_bitmap(io: &BlockIo, start: u32, blocks: u32) -> Result<Vec<u8>> {
    let mut bitmap = Vec::with_capacity((blocks * BLOCK_SIZE) as usize);
    for b in 0..blocks {
        bitmap.extend_from_slice(&io.read_block(BlockNo(start + b))?);
    }
    Ok(bitmap)
}

fn check_bitmaps(sb: &Superblock, ifree: &[u8], bfree: &[u8], report: &mut CheckReport) {
    let free_inodes = bitmap_count_set(ifree, sb.nr_inodes);
    if free_inodes != sb.nr_free_inodes {
        report.error(format!(
            "inode bitmap holds {free_inodes} free bits, superblock says {}",
            sb.nr_free_inodes
        ));
    }
    let free_blocks = bitmap_count_set(bfree, sb.nr_blocks);
    if free_blocks != sb.nr_free_blocks {
        report.error(format!(
            "block bitmap holds {free_blocks} free bits, superblock says {}",
            sb.nr_free_blocks
        ));
    }

    if bitmap_get(ifree, InodeNo::ROOT.0) {
        report.error("root inode is marked free in the inode bitmap");
    }
    if bitmap_get(bfree, 0) {
        report.error("superblock block is marked free in the block bitmap");
    }
}

// ── Inodes and extents ──────────────────────────────────────────────────────

fn check_root_inode(sb: &Superblock, io: &BlockIo, report: &mut CheckReport) -> Result<()> {
    let block = io.read_block(BlockNo(sb.inode_store_start()))?;
    let Ok(root) = Inode::parse(&block[..Inode::SIZE]) else {
        report.error("root inode record does not parse");
        return Ok(());
    };

    if !root.is_dir() {
        report.error(format!("root inode is not a directory (mode {:o})", root.i_mode));
        return Ok(());
    }
    if root.i_mode & 0o400 == 0 || root.i_mode & 0o100 == 0 {
        report.warn("root directory is not readable or searchable by its owner");
    }
    if root.i_nlink < 2 {
        report.error(format!("root link count {} is below 2", root.i_nlink));
    }
    if root.i_blocks == 0 {
        report.error("root inode has no blocks");
    }
    Ok(())
}

fn extent_bound(sb: &Superblock) -> u32 {
    if sb.comp_features & FEATURE_LARGE_EXTENTS != 0 {
        sb.max_extent_blocks_large.max(sb.max_extent_blocks)
    } else {
        sb.max_extent_blocks
    }
}

fn check_inode(
    sb: &Superblock,
    io: &BlockIo,
    ino: InodeNo,
    report: &mut CheckReport,
    reachable: &mut [bool],
) -> Result<()> {
    let store_block = sb.inode_store_start() + ino.0 / INODES_PER_BLOCK;
    let offset = (ino.0 % INODES_PER_BLOCK) as usize * Inode::SIZE;
    let block = io.read_block(BlockNo(store_block))?;
    let Ok(record) = Inode::parse(&block[offset..offset + Inode::SIZE]) else {
        report.error(format!("inode {ino}: record does not parse"));
        return Ok(());
    };

    let kind = record.kind();
    if kind.is_none() {
        report.warn(format!(
            "inode {ino}: unknown file type in mode {:o}",
            record.i_mode
        ));
        return Ok(());
    }
    if record.i_nlink == 0 {
        report.warn(format!("inode {ino}: allocated but link count is zero"));
    }

    match kind {
        Some(FileKind::Symlink) => {
            if record.ei_block != 0 {
                report.warn(format!("inode {ino}: symlink carries an extent index"));
            }
        }
        _ => {
            if record.ei_block == 0 {
                report.error(format!("inode {ino}: missing extent index block"));
                return Ok(());
            }
            if !block_in_data_region(sb, record.ei_block) {
                report.error(format!(
                    "inode {ino}: extent index block {} outside the data region",
                    record.ei_block
                ));
                return Ok(());
            }
            mark(reachable, record.ei_block, 1);
            check_extent_index(sb, io, ino, &record, report, reachable)?;
        }
    }

    if record.xattr_block != 0 {
        if !block_in_data_region(sb, record.xattr_block) {
            report.error(format!(
                "inode {ino}: xattr index block {} outside the data region",
                record.xattr_block
            ));
        } else {
            mark(reachable, record.xattr_block, 1);
            check_xattr_index(sb, io, ino, record.xattr_block, report, reachable)?;
        }
    }
    Ok(())
}

fn check_extent_index(
    sb: &Superblock,
    io: &BlockIo,
    ino: InodeNo,
    record: &Inode,
    report: &mut CheckReport,
    reachable: &mut [bool],
) -> Result<()> {
    let raw = io.read_block(BlockNo(record.ei_block))?;
    let Ok(index) = ExtentIndex::parse(&raw) else {
        report.error(format!("inode {ino}: extent index does not parse"));
        return Ok(());
    };

    let bounds = Bounds {
        max_len: extent_bound(sb),
        nr_blocks: sb.nr_blocks,
        data_start: sb.data_block_start(),
    };
    if let Err(err) = lolfs_extent::validate(&index, &bounds) {
        report.error(format!("inode {ino}: {err}"));
    }

    for (slot, extent) in index.extents.iter().enumerate() {
        if extent.is_unused() {
            break;
        }
        if block_in_data_region(sb, extent.ee_start)
            && u64::from(extent.ee_start) + u64::from(extent.ee_len) <= u64::from(sb.nr_blocks)
        {
            mark(reachable, extent.ee_start, extent.ee_len);
        }

        check_extent_codec_fields(sb, io, ino, slot, extent, report, reachable)?;
    }

    if record.is_dir() {
        let capacity = index.total_blocks().saturating_mul(FILES_PER_BLOCK);
        if index.nr_files > capacity {
            report.error(format!(
                "inode {ino}: directory claims {} entries but its blocks hold {capacity}",
                index.nr_files
            ));
        }
    }
    Ok(())
}

fn check_extent_codec_fields(
    sb: &Superblock,
    io: &BlockIo,
    ino: InodeNo,
    slot: usize,
    extent: &lolfs_ondisk::Extent,
    report: &mut CheckReport,
    reachable: &mut [bool],
) -> Result<()> {
    let comp = CompAlgo::from_raw(u32::from(extent.ee_comp_algo));
    let enc = EncAlgo::from_raw(u32::from(extent.ee_enc_algo));
    if comp.is_none() {
        report.error(format!(
            "inode {ino}: extent {slot} has unknown compression algorithm id {}",
            extent.ee_comp_algo
        ));
    }
    if enc.is_none() {
        report.error(format!(
            "inode {ino}: extent {slot} has unknown encryption algorithm id {}",
            extent.ee_enc_algo
        ));
    }

    if extent.ee_flags & EXT_COMPRESSED != 0 && comp == Some(CompAlgo::None) {
        report.warn(format!(
            "inode {ino}: extent {slot} is flagged compressed but its algorithm is none"
        ));
    }
    if extent.ee_flags & EXT_ENCRYPTED != 0 && enc == Some(EncAlgo::None) {
        report.warn(format!(
            "inode {ino}: extent {slot} is flagged encrypted but its algorithm is none"
        ));
    }

    if extent.ee_flags & EXT_COMPRESSED != 0 && extent.ee_flags & EXT_HAS_META == 0 {
        report.error(format!(
            "inode {ino}: extent {slot} is compressed but carries no metadata block"
        ));
    }
    if extent.ee_flags & EXT_HAS_META != 0 {
        if extent.ee_meta == 0 || !block_in_data_region(sb, extent.ee_meta) {
            report.error(format!(
                "inode {ino}: extent {slot} metadata pointer {} is invalid",
                extent.ee_meta
            ));
        } else {
            mark(reachable, extent.ee_meta, 1);
            let raw = io.read_block(BlockNo(extent.ee_meta))?;
            if CompMeta::parse(&raw).is_err() {
                report.error(format!(
                    "inode {ino}: extent {slot} metadata block {} has a bad magic",
                    extent.ee_meta
                ));
            }
        }
    } else if extent.ee_meta != 0 {
        report.warn(format!(
            "inode {ino}: extent {slot} has a metadata pointer but no has-meta flag"
        ));
    }
    Ok(())
}

fn check_xattr_index(
    sb: &Superblock,
    io: &BlockIo,
    ino: InodeNo,
    xattr_block: u32,
    report: &mut CheckReport,
    reachable: &mut [bool],
) -> Result<()> {
    let raw = io.read_block(BlockNo(xattr_block))?;
    let Ok(index) = XattrIndex::parse(&raw) else {
        report.error(format!("inode {ino}: xattr index does not parse"));
        return Ok(());
    };

    let mut held = 0_u64;
    for (slot, extent) in index.extents.iter().enumerate() {
        if extent.is_unused() {
            break;
        }
        if extent.ee_len == 0 || !block_in_data_region(sb, extent.ee_start) {
            report.error(format!("inode {ino}: xattr extent {slot} is invalid"));
            continue;
        }
        mark(reachable, extent.ee_start, extent.ee_len);
        held += u64::from(extent.ee_len) * u64::from(BLOCK_SIZE);
    }
    if u64::from(index.total_size) > held {
        report.error(format!(
            "inode {ino}: xattr header claims {} bytes but extents hold {held}",
            index.total_size
        ));
    }
    Ok(())
}

// ── Reachability ────────────────────────────────────────────────────────────

fn block_in_data_region(sb: &Superblock, block: u32) -> bool {
    block >= sb.data_block_start() && block < sb.nr_blocks
}

fn mark(reachable: &mut [bool], start: u32, len: u32) {
    for block in start..start.saturating_add(len) {
        if let Some(flag) = reachable.get_mut(block as usize) {
            *flag = true;
        }
    }
}

fn check_reachability(
    sb: &Superblock,
    bfree: &[u8],
    reachable: &[bool],
    report: &mut CheckReport,
) {
    let mut leaked = 0_u32;
    for block in sb.data_block_start()..sb.nr_blocks {
        let free = bitmap_get(bfree, block);
        let reached = reachable[block as usize];
        if reached && free {
            report.error(format!(
                "block {block} is referenced by metadata but marked free"
            ));
        } else if !reached && !free {
            leaked += 1;
        }
    }
    if leaked > 0 {
        report.warn(format!(
            "{leaked} blocks are marked used but unreachable from any inode"
        ));
    }
}
