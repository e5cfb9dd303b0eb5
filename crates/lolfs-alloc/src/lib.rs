#![forbid(unsafe_code)]
//! Inode and block allocation.
//!
//! Two on-disk bitmaps, one bit per inode and one bit per block, with
//! 1 = free and LSB-first bit order within each byte. The allocator keeps
//! both bitmaps in memory and writes every mutated bitmap block back to
//! the device immediately, so an allocation is visible on disk before any
//! structure referencing the new blocks is written.
//!
//! Single-bit allocations take a find-first-bit fast path; multi-bit runs
//! use a linear scan with a rolling counter. A hint-seeded variant resumes
//! from the last allocation for locality.

use lolfs_block::BlockIo;
use lolfs_error::{LolfsError, Result};
use lolfs_ondisk::Superblock;
use lolfs_types::{BITS_PER_BLOCK, BLOCK_SIZE, BlockNo, InodeNo};
use tracing::{debug, warn};

// ── Raw bitmap operations ───────────────────────────────────────────────────

/// Get bit `idx` (LSB-first within each byte).
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte = (idx / 8) as usize;
    byte < bitmap.len() && (bitmap[byte] >> (idx % 8)) & 1 == 1
}

/// Set bit `idx`.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] |= 1 << (idx % 8);
    }
}

/// Clear bit `idx`.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte = (idx / 8) as usize;
    if byte < bitmap.len() {
        bitmap[byte] &= !(1 << (idx % 8));
    }
}

/// Count set (free) bits among the first `limit` bits.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], limit: u32) -> u32 {
    let full_bytes = (limit / 8) as usize;
    let remainder = limit % 8;
    let mut count: u32 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| byte.count_ones())
        .sum();
    if remainder > 0 && full_bytes < bitmap.len() {
        let mask = (1_u8 << remainder) - 1;
        count += (bitmap[full_bytes] & mask).count_ones();
    }
    count
}

/// Find the first set bit in `[start, limit)`, byte-skipping over fully
/// cleared bytes.
#[must_use]
pub fn bitmap_find_set(bitmap: &[u8], limit: u32, start: u32) -> Option<u32> {
    let mut idx = start;
    while idx < limit {
        if idx % 8 == 0 {
            // Skip whole used bytes on the fast path.
            while idx + 8 <= limit && bitmap[(idx / 8) as usize] == 0 {
                idx += 8;
            }
            if idx >= limit {
                break;
            }
        }
        if bitmap_get(bitmap, idx) {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

/// Find `len` consecutive set bits in `[start, limit)` with a rolling
/// counter. Does not wrap.
#[must_use]
pub fn bitmap_find_run(bitmap: &[u8], limit: u32, len: u32, start: u32) -> Option<u32> {
    if len == 0 || start >= limit {
        return None;
    }
    let mut run = 0_u32;
    for idx in start..limit {
        if bitmap_get(bitmap, idx) {
            run += 1;
            if run == len {
                return Some(idx + 1 - len);
            }
        } else {
            run = 0;
        }
    }
    None
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// In-memory bitmaps plus free counters, backed by the on-disk bitmap
/// regions described by the superblock.
pub struct Allocator {
    ifree: Vec<u8>,
    bfree: Vec<u8>,
    nr_inodes: u32,
    nr_blocks: u32,
    ifree_start: u32,
    bfree_start: u32,
    nr_free_inodes: u32,
    nr_free_blocks: u32,
    block_hint: u32,
}

impl Allocator {
    /// Load both bitmaps from the device.
    pub fn load(io: &BlockIo, sb: &Superblock) -> Result<Self> {
        let mut ifree = Vec::with_capacity((sb.nr_ifree_blocks * BLOCK_SIZE) as usize);
        for b in 0..sb.nr_ifree_blocks {
            ifree.extend_from_slice(&io.read_block(BlockNo(sb.ifree_bitmap_start() + b))?);
        }
        let mut bfree = Vec::with_capacity((sb.nr_bfree_blocks * BLOCK_SIZE) as usize);
        for b in 0..sb.nr_bfree_blocks {
            bfree.extend_from_slice(&io.read_block(BlockNo(sb.bfree_bitmap_start() + b))?);
        }
        Ok(Self {
            ifree,
            bfree,
            nr_inodes: sb.nr_inodes,
            nr_blocks: sb.nr_blocks,
            ifree_start: sb.ifree_bitmap_start(),
            bfree_start: sb.bfree_bitmap_start(),
            nr_free_inodes: sb.nr_free_inodes,
            nr_free_blocks: sb.nr_free_blocks,
            block_hint: sb.data_block_start(),
        })
    }

    #[must_use]
    pub fn free_inode_count(&self) -> u32 {
        self.nr_free_inodes
    }

    #[must_use]
    pub fn free_block_count(&self) -> u32 {
        self.nr_free_blocks
    }

    /// Allocate the lowest free inode and clear its bit.
    pub fn alloc_inode(&mut self, io: &BlockIo) -> Result<InodeNo> {
        let Some(idx) = bitmap_find_set(&self.ifree, self.nr_inodes, 0) else {
            return Err(LolfsError::NoSpace);
        };
        bitmap_clear(&mut self.ifree, idx);
        self.nr_free_inodes -= 1;
        self.flush_inode_bits(io, idx, 1)?;
        debug!(target: "lolfs::alloc", ino = idx, "allocated inode");
        Ok(InodeNo(idx))
    }

    /// Release an inode. Out-of-range numbers are ignored without
    /// touching the counters.
    pub fn free_inode(&mut self, io: &BlockIo, ino: InodeNo) -> Result<()> {
        if ino.0 >= self.nr_inodes {
            warn!(target: "lolfs::alloc", ino = ino.0, "free of out-of-range inode ignored");
            return Ok(());
        }
        if !bitmap_get(&self.ifree, ino.0) {
            bitmap_set(&mut self.ifree, ino.0);
            self.nr_free_inodes += 1;
            self.flush_inode_bits(io, ino.0, 1)?;
        }
        Ok(())
    }

    /// Allocate the lowest run of `len` consecutive free blocks.
    pub fn alloc_blocks(&mut self, io: &BlockIo, len: u32) -> Result<BlockNo> {
        self.alloc_blocks_at(io, len, 0)
    }

    /// Allocate a run of `len` free blocks, resuming the scan from the
    /// last allocation and wrapping once.
    pub fn alloc_blocks_hint(&mut self, io: &BlockIo, len: u32) -> Result<BlockNo> {
        let hint = if self.block_hint < self.nr_blocks {
            self.block_hint
        } else {
            0
        };
        self.alloc_blocks_at(io, len, hint)
    }

    fn alloc_blocks_at(&mut self, io: &BlockIo, len: u32, start: u32) -> Result<BlockNo> {
        if len == 0 {
            return Err(LolfsError::Format("cannot allocate 0 blocks".into()));
        }
        let found = if len == 1 {
            bitmap_find_set(&self.bfree, self.nr_blocks, start)
                .or_else(|| bitmap_find_set(&self.bfree, start.min(self.nr_blocks), 0))
        } else {
            bitmap_find_run(&self.bfree, self.nr_blocks, len, start)
                .or_else(|| bitmap_find_run(&self.bfree, start.min(self.nr_blocks), len, 0))
        };
        let Some(first) = found else {
            return Err(LolfsError::NoSpace);
        };
        for idx in first..first + len {
            bitmap_clear(&mut self.bfree, idx);
        }
        self.nr_free_blocks -= len;
        self.block_hint = first + len;
        self.flush_block_bits(io, first, len)?;
        debug!(target: "lolfs::alloc", first, len, "allocated block run");
        Ok(BlockNo(first))
    }

    /// Release a run of blocks. Out-of-range runs are ignored without
    /// touching the counters.
    pub fn free_blocks(&mut self, io: &BlockIo, first: BlockNo, len: u32) -> Result<()> {
        let Some(end) = first.0.checked_add(len) else {
            warn!(target: "lolfs::alloc", first = first.0, len, "free of overflowing run ignored");
            return Ok(());
        };
        if end > self.nr_blocks {
            warn!(target: "lolfs::alloc", first = first.0, len, "free of out-of-range run ignored");
            return Ok(());
        }
        let mut freed = 0_u32;
        for idx in first.0..end {
            if !bitmap_get(&self.bfree, idx) {
                bitmap_set(&mut self.bfree, idx);
                freed += 1;
            }
        }
        self.nr_free_blocks += freed;
        if freed > 0 {
            self.flush_block_bits(io, first.0, len)?;
        }
        Ok(())
    }

    /// Adaptive extent run length for a file currently holding
    /// `file_blocks` data blocks, capped at `cap` and at the free-block
    /// count, never below 1.
    #[must_use]
    pub fn optimal_run(&self, file_blocks: u32, cap: u32) -> u32 {
        let run = if file_blocks < 8 {
            2
        } else if file_blocks < 32 {
            4
        } else {
            cap
        };
        run.min(self.nr_free_blocks).max(1)
    }

    /// Write the bitmap blocks covering `[first, first + len)` inode bits.
    fn flush_inode_bits(&self, io: &BlockIo, first: u32, len: u32) -> Result<()> {
        flush_bits(io, &self.ifree, self.ifree_start, first, len)
    }

    /// Write the bitmap blocks covering `[first, first + len)` block bits.
    fn flush_block_bits(&self, io: &BlockIo, first: u32, len: u32) -> Result<()> {
        flush_bits(io, &self.bfree, self.bfree_start, first, len)
    }

    /// Copy the current free counters into a superblock.
    pub fn store_counts(&self, sb: &mut Superblock) {
        sb.nr_free_inodes = self.nr_free_inodes;
        sb.nr_free_blocks = self.nr_free_blocks;
    }
}

fn flush_bits(io: &BlockIo, bitmap: &[u8], region_start: u32, first: u32, len: u32) -> Result<()> {
    let first_block = first / BITS_PER_BLOCK;
    let last_block = (first + len.max(1) - 1) / BITS_PER_BLOCK;
    for b in first_block..=last_block {
        // One bitmap block spans BLOCK_SIZE bytes of the in-memory map.
        let start = (b * BLOCK_SIZE) as usize;
        let end = start + BLOCK_SIZE as usize;
        io.write_block(BlockNo(region_start + b), &bitmap[start..end])?;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
