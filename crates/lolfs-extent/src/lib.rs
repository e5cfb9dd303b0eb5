#![forbid(unsafe_code)]
//! Extent index operations.
//!
//! An inode's extent index block maps logical blocks to physical runs.
//! Used slots form a leading prefix in ascending logical order with no
//! logical holes between them. Search is binary over that prefix; a hint
//! variant first probes the last-returned slot and its successor, which
//! makes sequential access O(1).

use lolfs_alloc::Allocator;
use lolfs_block::BlockIo;
use lolfs_error::{LolfsError, Result};
use lolfs_ondisk::{CompMeta, Extent, ExtentIndex};
use lolfs_types::{
    BLOCK_SIZE, BlockNo, CompAlgo, EncAlgo, EXT_HAS_META, MAX_EXTENTS, META_ENTRIES_PER_BLOCK,
};
use tracing::debug;

// ── Search ──────────────────────────────────────────────────────────────────

/// Outcome of an extent search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// `logical` falls inside the used extent at this index.
    Used(usize),
    /// Not covered; this is the smallest free slot, for allocation.
    Free(usize),
    /// Not covered and every slot is in use.
    Full,
}

/// Binary-search the used prefix for the extent containing `logical`.
#[must_use]
pub fn search(index: &ExtentIndex, logical: u32) -> Slot {
    let used = index.count_used();
    if used == 0 {
        return Slot::Free(0);
    }

    let (mut left, mut right) = (0_usize, used);
    while left < right {
        let mid = left + (right - left) / 2;
        let extent = &index.extents[mid];
        if logical < extent.ee_block {
            right = mid;
        } else if logical >= extent.ee_block + extent.ee_len {
            left = mid + 1;
        } else {
            return Slot::Used(mid);
        }
    }

    if used < MAX_EXTENTS {
        Slot::Free(used)
    } else {
        Slot::Full
    }
}

/// Search with a locality hint: probe `hint` and `hint + 1` before
/// falling back to binary search.
#[must_use]
pub fn search_with_hint(index: &ExtentIndex, logical: u32, hint: usize) -> Slot {
    let used = index.count_used();
    if hint < used {
        if index.extents[hint].contains(logical) {
            return Slot::Used(hint);
        }
        if hint + 1 < used && index.extents[hint + 1].contains(logical) {
            return Slot::Used(hint + 1);
        }
    }
    search(index, logical)
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Default codec identity stamped onto freshly allocated extents.
#[derive(Debug, Clone, Copy)]
pub struct AllocPolicy {
    pub comp_algo: CompAlgo,
    pub enc_algo: EncAlgo,
    /// Allocate a per-block compression metadata block per extent.
    pub with_meta: bool,
    /// Configured upper bound on run length (`max_extent_blocks`).
    pub cap: u32,
}

impl AllocPolicy {
    /// Policy for plain metadata storage: no codec, no metadata block.
    #[must_use]
    pub fn plain(cap: u32) -> Self {
        Self {
            comp_algo: CompAlgo::None,
            enc_algo: EncAlgo::None,
            with_meta: false,
            cap,
        }
    }

    fn run_cap(&self) -> u32 {
        if self.with_meta {
            self.cap.min(META_ENTRIES_PER_BLOCK)
        } else {
            self.cap
        }
    }
}

/// Ensure `logical` is covered, appending adaptive-size extents at the
/// logical end until it is. Returns the covering slot index.
///
/// Bitmap mutations are write-through and each new extent's metadata
/// block is initialized on disk before this returns; the caller persists
/// the index block itself.
pub fn allocate_for(
    index: &mut ExtentIndex,
    logical: u32,
    alloc: &mut Allocator,
    io: &BlockIo,
    policy: &AllocPolicy,
) -> Result<usize> {
    loop {
        match search(index, logical) {
            Slot::Used(slot) => return Ok(slot),
            Slot::Full => return Err(LolfsError::NoSpace),
            Slot::Free(slot) => {
                let logical_end = if slot == 0 {
                    0
                } else {
                    let prev = &index.extents[slot - 1];
                    prev.ee_block + prev.ee_len
                };
                let file_blocks = index.total_blocks();
                let run = alloc.optimal_run(file_blocks, policy.run_cap());
                let start = alloc.alloc_blocks(io, run)?;

                let meta_block = if policy.with_meta {
                    match alloc.alloc_blocks(io, 1) {
                        Ok(block) => {
                            let mut buf = vec![0_u8; BLOCK_SIZE as usize];
                            let mut meta = CompMeta::empty();
                            meta.nr_blocks = run;
                            meta.encode_into(&mut buf);
                            io.write_block(block, &buf)?;
                            block.0
                        }
                        Err(err) => {
                            alloc.free_blocks(io, start, run)?;
                            return Err(err);
                        }
                    }
                } else {
                    0
                };

                index.extents[slot] = Extent {
                    ee_block: logical_end,
                    ee_len: run,
                    ee_start: start.0,
                    ee_comp_algo: policy.comp_algo.as_raw() as u16,
                    ee_enc_algo: policy.enc_algo.as_raw() as u8,
                    ee_flags: if meta_block != 0 { EXT_HAS_META } else { 0 },
                    ee_meta: meta_block,
                };
                debug!(
                    target: "lolfs::extent",
                    slot,
                    logical_start = logical_end,
                    len = run,
                    phys = start.0,
                    "allocated extent"
                );
            }
        }
    }
}

// ── Truncation ──────────────────────────────────────────────────────────────

/// Free every extent that covers no block below `new_block_count`,
/// together with its metadata block, and clear the entries. Extents
/// straddling the boundary are kept whole. Returns the data blocks freed.
pub fn truncate(
    index: &mut ExtentIndex,
    new_block_count: u32,
    alloc: &mut Allocator,
    io: &BlockIo,
) -> Result<u32> {
    let used = index.count_used();
    let mut freed = 0_u32;

    for slot in (0..used).rev() {
        let extent = index.extents[slot];
        if new_block_count > 0 && extent.ee_block < new_block_count {
            break;
        }
        alloc.free_blocks(io, BlockNo(extent.ee_start), extent.ee_len)?;
        if extent.ee_meta != 0 {
            alloc.free_blocks(io, BlockNo(extent.ee_meta), 1)?;
        }
        freed += extent.ee_len;
        index.extents[slot] = Extent::default();
    }

    Ok(freed)
}

/// Free every extent and metadata block. Returns the data blocks freed.
pub fn free_all(index: &mut ExtentIndex, alloc: &mut Allocator, io: &BlockIo) -> Result<u32> {
    truncate(index, 0, alloc, io)
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Range limits for extent validation.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    /// Largest allowed `ee_len`.
    pub max_len: u32,
    /// Total blocks in the filesystem.
    pub nr_blocks: u32,
    /// First data block; physical pointers below this are invalid.
    pub data_start: u32,
}

/// Check ordering, logical contiguity, bounded lengths and in-range
/// physical pointers over the used prefix.
pub fn validate(index: &ExtentIndex, bounds: &Bounds) -> Result<()> {
    let mut expected_block = 0_u32;

    for (slot, extent) in index.extents.iter().enumerate() {
        if extent.is_unused() {
            break;
        }
        if extent.ee_len == 0 || extent.ee_len > bounds.max_len {
            return Err(LolfsError::Corruption {
                block: extent.ee_start,
                detail: format!("extent {slot} length {} out of bounds", extent.ee_len),
            });
        }
        if extent.ee_block != expected_block {
            return Err(LolfsError::Corruption {
                block: extent.ee_start,
                detail: format!(
                    "extent {slot} logical start {} is not contiguous (expected {expected_block})",
                    extent.ee_block
                ),
            });
        }
        if extent.ee_start < bounds.data_start
            || u64::from(extent.ee_start) + u64::from(extent.ee_len) > u64::from(bounds.nr_blocks)
        {
            return Err(LolfsError::Corruption {
                block: extent.ee_start,
                detail: format!("extent {slot} physical range outside the data region"),
            });
        }
        expected_block += extent.ee_len;
    }

    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lolfs_block::MemByteDevice;
    use lolfs_ondisk::Superblock;
    use proptest::prelude::*;

    fn test_sb() -> Superblock {
        Superblock {
            magic: lolfs_types::LOLFS_MAGIC,
            nr_blocks: 2048,
            nr_inodes: 2072,
            nr_istore_blocks: 37,
            nr_ifree_blocks: 1,
            nr_bfree_blocks: 1,
            nr_free_inodes: 2071,
            nr_free_blocks: 2007,
            version: 1,
            comp_default_algo: 1,
            comp_enabled: 0,
            comp_min_block_size: 128,
            comp_features: 0,
            max_extent_blocks: lolfs_types::MAX_BLOCKS_PER_EXTENT,
            max_extent_blocks_large: lolfs_types::MAX_BLOCKS_PER_EXTENT_LARGE,
            enc_enabled: 0,
            enc_default_algo: 0,
            enc_kdf_algo: 0,
            enc_kdf_iterations: 0,
            enc_kdf_memory: 0,
            enc_kdf_parallelism: 0,
            enc_salt: [0; 32],
            enc_master_key: [0; 32],
            enc_features: 0,
            reserved: [0; 3],
        }
    }

    fn test_env() -> (BlockIo, Allocator) {
        let sb = test_sb();
        let io = BlockIo::new(
            Box::new(MemByteDevice::new((sb.nr_blocks * BLOCK_SIZE) as usize)),
            0,
        )
        .unwrap();

        let mut ifree = vec![0xFF_u8; BLOCK_SIZE as usize];
        ifree[0] = 0xFE;
        io.write_block(BlockNo(sb.ifree_bitmap_start()), &ifree)
            .unwrap();

        let mut bfree = vec![0xFF_u8; BLOCK_SIZE as usize];
        for used in 0..=sb.data_block_start() {
            lolfs_alloc::bitmap_clear(&mut bfree, used);
        }
        for beyond in sb.nr_blocks..lolfs_types::BITS_PER_BLOCK {
            lolfs_alloc::bitmap_clear(&mut bfree, beyond);
        }
        io.write_block(BlockNo(sb.bfree_bitmap_start()), &bfree)
            .unwrap();

        let alloc = Allocator::load(&io, &sb).unwrap();
        (io, alloc)
    }

    fn index_with(extents: &[(u32, u32, u32)]) -> ExtentIndex {
        let mut index = ExtentIndex::empty();
        for (slot, &(ee_block, ee_len, ee_start)) in extents.iter().enumerate() {
            index.extents[slot] = Extent {
                ee_block,
                ee_len,
                ee_start,
                ..Extent::default()
            };
        }
        index
    }

    // ── Search ─────────────────────────────────────────────────────────

    #[test]
    fn search_empty_index_offers_slot_zero() {
        let index = ExtentIndex::empty();
        assert_eq!(search(&index, 0), Slot::Free(0));
        assert_eq!(search(&index, 99), Slot::Free(0));
    }

    #[test]
    fn search_finds_covering_extent() {
        let index = index_with(&[(0, 2, 100), (2, 4, 200), (6, 8, 300)]);
        assert_eq!(search(&index, 0), Slot::Used(0));
        assert_eq!(search(&index, 1), Slot::Used(0));
        assert_eq!(search(&index, 2), Slot::Used(1));
        assert_eq!(search(&index, 5), Slot::Used(1));
        assert_eq!(search(&index, 6), Slot::Used(2));
        assert_eq!(search(&index, 13), Slot::Used(2));
        assert_eq!(search(&index, 14), Slot::Free(3));
    }

    #[test]
    fn search_full_index_reports_full() {
        let mut index = ExtentIndex::empty();
        for slot in 0..MAX_EXTENTS {
            index.extents[slot] = Extent {
                ee_block: slot as u32,
                ee_len: 1,
                ee_start: 1000 + slot as u32,
                ..Extent::default()
            };
        }
        assert_eq!(search(&index, MAX_EXTENTS as u32), Slot::Full);
        assert_eq!(search(&index, 7), Slot::Used(7));
    }

    #[test]
    fn hinted_search_probes_hint_and_successor() {
        let index = index_with(&[(0, 2, 100), (2, 4, 200), (6, 8, 300)]);
        assert_eq!(search_with_hint(&index, 3, 1), Slot::Used(1));
        assert_eq!(search_with_hint(&index, 6, 1), Slot::Used(2));
        // Stale hint falls back to binary search.
        assert_eq!(search_with_hint(&index, 0, 2), Slot::Used(0));
        assert_eq!(search_with_hint(&index, 5, 99), Slot::Used(1));
    }

    // ── Allocation ─────────────────────────────────────────────────────

    #[test]
    fn allocation_grows_adaptively() {
        let (io, mut alloc) = test_env();
        let mut index = ExtentIndex::empty();
        let policy = AllocPolicy::plain(64);

        // Fresh file: first extent is 2 blocks.
        let slot = allocate_for(&mut index, 0, &mut alloc, &io, &policy).unwrap();
        assert_eq!(slot, 0);
        assert_eq!(index.extents[0].ee_len, 2);
        assert_eq!(index.extents[0].ee_block, 0);

        // Still below 8 blocks: 2-block runs.
        allocate_for(&mut index, 2, &mut alloc, &io, &policy).unwrap();
        assert_eq!(index.extents[1].ee_len, 2);
        assert_eq!(index.extents[1].ee_block, 2);

        // Fill to 8 blocks, then expect a 4-block run.
        allocate_for(&mut index, 6, &mut alloc, &io, &policy).unwrap();
        let slot = allocate_for(&mut index, 8, &mut alloc, &io, &policy).unwrap();
        assert_eq!(index.extents[slot].ee_len, 4);
        assert_eq!(index.total_blocks(), 12);
        let slot = allocate_for(&mut index, 31, &mut alloc, &io, &policy).unwrap();
        assert_eq!(index.extents[slot].ee_len, 4);

        // Past 32 blocks the configured cap takes over.
        let slot = allocate_for(&mut index, 40, &mut alloc, &io, &policy).unwrap();
        assert_eq!(index.extents[slot].ee_len, 64);
    }

    #[test]
    fn allocation_fills_logical_gaps() {
        let (io, mut alloc) = test_env();
        let mut index = ExtentIndex::empty();
        let policy = AllocPolicy::plain(64);

        let slot = allocate_for(&mut index, 9, &mut alloc, &io, &policy).unwrap();
        assert!(index.extents[slot].contains(9));
        // No logical holes were left behind.
        let bounds = Bounds {
            max_len: 64,
            nr_blocks: 2048,
            data_start: 40,
        };
        validate(&index, &bounds).unwrap();
    }

    #[test]
    fn allocation_with_meta_initializes_meta_block() {
        let (io, mut alloc) = test_env();
        let mut index = ExtentIndex::empty();
        let policy = AllocPolicy {
            comp_algo: CompAlgo::Lz4,
            enc_algo: EncAlgo::None,
            with_meta: true,
            cap: 64,
        };

        let slot = allocate_for(&mut index, 0, &mut alloc, &io, &policy).unwrap();
        let extent = &index.extents[slot];
        assert_ne!(extent.ee_meta, 0);
        assert_eq!(extent.ee_flags & EXT_HAS_META, EXT_HAS_META);
        assert_eq!(extent.ee_comp_algo, CompAlgo::Lz4.as_raw() as u16);

        let meta = CompMeta::parse(&io.read_block(BlockNo(extent.ee_meta)).unwrap()).unwrap();
        assert_eq!(meta.nr_blocks, extent.ee_len);
        assert!(meta.entries.iter().all(|e| e.comp_size == 0));
    }

    #[test]
    fn allocation_reports_no_space_when_bitmap_is_exhausted() {
        let (io, mut alloc) = test_env();
        let mut index = ExtentIndex::empty();
        let policy = AllocPolicy::plain(64);

        while alloc.free_block_count() > 0 {
            let chunk = alloc.free_block_count().min(32);
            alloc.alloc_blocks(&io, chunk).unwrap();
        }
        assert!(matches!(
            allocate_for(&mut index, 0, &mut alloc, &io, &policy),
            Err(LolfsError::NoSpace)
        ));
    }

    // ── Truncation ─────────────────────────────────────────────────────

    #[test]
    fn truncate_frees_trailing_extents() {
        let (io, mut alloc) = test_env();
        let mut index = ExtentIndex::empty();
        let policy = AllocPolicy::plain(64);

        for logical in [0_u32, 2, 4, 6] {
            allocate_for(&mut index, logical, &mut alloc, &io, &policy).unwrap();
        }
        let before = alloc.free_block_count();

        // Keep blocks 0..3; the extent covering block 3 stays whole.
        let freed = truncate(&mut index, 4, &mut alloc, &io).unwrap();
        assert_eq!(freed, 4);
        assert_eq!(index.count_used(), 2);
        assert_eq!(alloc.free_block_count(), before + 4);

        let freed = free_all(&mut index, &mut alloc, &io).unwrap();
        assert_eq!(freed, 4);
        assert_eq!(index.count_used(), 0);
    }

    #[test]
    fn truncate_boundary_extent_is_kept_whole() {
        let (io, mut alloc) = test_env();
        let mut index = ExtentIndex::empty();
        let policy = AllocPolicy::plain(64);
        allocate_for(&mut index, 0, &mut alloc, &io, &policy).unwrap();
        allocate_for(&mut index, 2, &mut alloc, &io, &policy).unwrap();

        // Boundary inside extent 1: nothing to free.
        let freed = truncate(&mut index, 3, &mut alloc, &io).unwrap();
        assert_eq!(freed, 0);
        assert_eq!(index.count_used(), 2);
    }

    #[test]
    fn truncate_frees_meta_blocks() {
        let (io, mut alloc) = test_env();
        let mut index = ExtentIndex::empty();
        let policy = AllocPolicy {
            comp_algo: CompAlgo::Lz4,
            enc_algo: EncAlgo::None,
            with_meta: true,
            cap: 64,
        };
        allocate_for(&mut index, 0, &mut alloc, &io, &policy).unwrap();
        let before = alloc.free_block_count();

        let freed = free_all(&mut index, &mut alloc, &io).unwrap();
        assert_eq!(freed, 2);
        // Two data blocks plus the metadata block came back.
        assert_eq!(alloc.free_block_count(), before + 3);
    }

    // ── Validation ─────────────────────────────────────────────────────

    #[test]
    fn validate_accepts_contiguous_index() {
        let bounds = Bounds {
            max_len: 2048,
            nr_blocks: 2048,
            data_start: 40,
        };
        let index = index_with(&[(0, 2, 100), (2, 4, 200)]);
        validate(&index, &bounds).unwrap();
    }

    #[test]
    fn validate_rejects_violations() {
        let bounds = Bounds {
            max_len: 2048,
            nr_blocks: 2048,
            data_start: 40,
        };
        // Logical hole.
        assert!(validate(&index_with(&[(0, 2, 100), (3, 4, 200)]), &bounds).is_err());
        // Zero length.
        assert!(validate(&index_with(&[(0, 0, 100)]), &bounds).is_err());
        // Length above the bound.
        assert!(validate(&index_with(&[(0, 4096, 100)]), &bounds).is_err());
        // Physical pointer in the metadata region.
        assert!(validate(&index_with(&[(0, 2, 10)]), &bounds).is_err());
        // Physical run past the end of the image.
        assert!(validate(&index_with(&[(0, 8, 2044)]), &bounds).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Every block inside a used extent searches back to that extent;
        /// blocks beyond the last extent get the first free slot.
        #[test]
        fn search_agrees_with_extent_coverage(lens in proptest::collection::vec(1_u32..6, 1..12)) {
            let mut index = ExtentIndex::empty();
            let mut logical = 0_u32;
            for (slot, len) in lens.iter().enumerate() {
                index.extents[slot] = Extent {
                    ee_block: logical,
                    ee_len: *len,
                    ee_start: 1000 + logical,
                    ..Extent::default()
                };
                logical += len;
            }

            for (slot, extent) in index.extents.iter().enumerate() {
                if extent.is_unused() {
                    break;
                }
                for block in extent.ee_block..extent.ee_block + extent.ee_len {
                    prop_assert_eq!(search(&index, block), Slot::Used(slot));
                    prop_assert_eq!(search_with_hint(&index, block, slot), Slot::Used(slot));
                }
            }
            prop_assert_eq!(search(&index, logical), Slot::Free(lens.len()));
        }
    }
}
