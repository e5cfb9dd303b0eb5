//! File I/O: the per-block compress-then-encrypt pipeline.
//!
//! A byte range maps to logical blocks; each block resolves through the
//! extent index to a physical block and the extent's codec identifiers.
//! Writes extend allocations with the adaptive run policy, merge partial
//! blocks with decoded prior contents, and record per-block compressed
//! sizes in the extent's metadata block.

use crate::{
    inode, load_index, now_secs, parse_comp_algo, parse_enc_algo, store_index, FsState, Lolfs,
};
use lolfs_block::BlockIo;
use lolfs_error::{LolfsError, Result};
use lolfs_extent::{search_with_hint, AllocPolicy, Slot};
use lolfs_ondisk::{CompBlockMeta, CompMeta, Extent, ExtentIndex};
use lolfs_types::{
    BLOCK_SIZE, BlockNo, CompAlgo, EncAlgo, EXT_COMPRESSED, EXT_ENCRYPTED, EXT_HAS_META,
    InodeNo, MAX_FILESIZE,
};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

// ── Metadata block cache ────────────────────────────────────────────────────

/// Per-call cache of compression metadata blocks, with dirty tracking.
struct MetaCache {
    blocks: HashMap<u32, (CompMeta, bool)>,
}

impl MetaCache {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    fn load(&mut self, io: &BlockIo, meta_block: u32) -> Result<&mut (CompMeta, bool)> {
        if !self.blocks.contains_key(&meta_block) {
            let raw = io.read_block(BlockNo(meta_block))?;
            let meta = CompMeta::parse(&raw).map_err(|e| LolfsError::Corruption {
                block: meta_block,
                detail: e.to_string(),
            })?;
            self.blocks.insert(meta_block, (meta, false));
        }
        Ok(self.blocks.get_mut(&meta_block).expect("just inserted"))
    }

    fn entry_at(&mut self, io: &BlockIo, meta_block: u32, idx: usize) -> Result<CompBlockMeta> {
        let (meta, _) = self.load(io, meta_block)?;
        Ok(meta.entries.get(idx).copied().unwrap_or_default())
    }

    fn set_entry(
        &mut self,
        io: &BlockIo,
        meta_block: u32,
        idx: usize,
        entry: CompBlockMeta,
    ) -> Result<()> {
        let (meta, dirty) = self.load(io, meta_block)?;
        if idx < meta.entries.len() {
            meta.entries[idx] = entry;
            *dirty = true;
        }
        Ok(())
    }

    /// Whether any of the first `len` records is compressed / raw.
    fn comp_profile(&mut self, io: &BlockIo, meta_block: u32, len: u32) -> Result<(bool, bool)> {
        let (meta, _) = self.load(io, meta_block)?;
        let records = &meta.entries[..(len as usize).min(meta.entries.len())];
        let any_comp = records.iter().any(|r| r.comp_size > 0);
        let any_raw = records.iter().any(|r| r.comp_size == 0);
        Ok((any_comp, any_raw))
    }

    fn flush(&mut self, io: &BlockIo) -> Result<()> {
        let mut buf = vec![0_u8; BLOCK_SIZE as usize];
        for (block, (meta, dirty)) in &mut self.blocks {
            if *dirty {
                meta.encode_into(&mut buf);
                io.write_block(BlockNo(*block), &buf)?;
                *dirty = false;
            }
        }
        Ok(())
    }
}

// ── Decode ──────────────────────────────────────────────────────────────────

/// Read one data block and invert the pipeline: decrypt, then decompress
/// according to the extent's metadata record.
fn decode_data_block(
    io: &BlockIo,
    extent: &Extent,
    lb: u32,
    key: Option<&[u8; 32]>,
    meta: &mut MetaCache,
) -> Result<Vec<u8>> {
    let phys = extent.physical_for(lb).ok_or_else(|| LolfsError::Corruption {
        block: extent.ee_start,
        detail: format!("logical block {lb} is outside its extent"),
    })?;
    let mut buf = io.read_block(BlockNo(phys))?;

    if extent.ee_flags & EXT_ENCRYPTED != 0 {
        let algo = parse_enc_algo(extent.ee_enc_algo)?;
        let Some(key) = key else {
            return Err(LolfsError::Corruption {
                block: phys,
                detail: "encrypted extent on an unencrypted filesystem".into(),
            });
        };
        buf = lolfs_codec::decrypt_block(algo, key, u64::from(lb), &buf)?;
    }

    if extent.ee_flags & EXT_HAS_META != 0 && extent.ee_meta != 0 {
        let record = meta.entry_at(io, extent.ee_meta, (lb - extent.ee_block) as usize)?;
        if record.comp_size > 0 {
            let algo = parse_comp_algo(extent.ee_comp_algo)?;
            buf = lolfs_codec::decompress(
                algo,
                &buf[..usize::from(record.comp_size)],
                BLOCK_SIZE as usize,
            )?;
        }
    } else if extent.ee_flags & EXT_COMPRESSED != 0 {
        return Err(LolfsError::Corruption {
            block: phys,
            detail: "compressed extent carries no metadata block".into(),
        });
    }

    Ok(buf)
}

// ── Public surface ──────────────────────────────────────────────────────────

impl Lolfs {
    /// Read up to `len` bytes at `offset`. Short reads happen only at
    /// end of file; holes read as zeros.
    pub fn read(&self, ino: InodeNo, offset: u64, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let record = inode::read_inode(&self.io, &state.sb, ino)?;
        if record.is_dir() {
            return Err(LolfsError::IsDirectory);
        }
        if record.is_symlink() {
            let target = record.symlink_target().into_bytes();
            let start = (offset as usize).min(target.len());
            let end = start.saturating_add(len).min(target.len());
            return Ok(target[start..end].to_vec());
        }

        let size = u64::from(record.i_size);
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let end = size.min(offset.saturating_add(len as u64));
        if record.ei_block == 0 {
            return Ok(vec![0; (end - offset) as usize]);
        }

        let key = if state.sb.enc_enabled != 0 {
            Some(self.data_key(&state)?.expect("enc_enabled implies a key"))
        } else {
            None
        };

        let index = load_index(&self.io, record.ei_block)?;
        let mut meta = MetaCache::new();
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut hint = 0_usize;

        let first = (offset / u64::from(BLOCK_SIZE)) as u32;
        let last = ((end - 1) / u64::from(BLOCK_SIZE)) as u32;
        for lb in first..=last {
            let block = match search_with_hint(&index, lb, hint) {
                Slot::Used(slot) => {
                    hint = slot;
                    decode_data_block(&self.io, &index.extents[slot], lb, key.as_ref(), &mut meta)?
                }
                _ => vec![0; BLOCK_SIZE as usize],
            };

            let block_start = u64::from(lb) * u64::from(BLOCK_SIZE);
            let from = offset.max(block_start) - block_start;
            let to = end.min(block_start + u64::from(BLOCK_SIZE)) - block_start;
            out.extend_from_slice(&block[from as usize..to as usize]);
        }
        Ok(out)
    }

    /// Read the whole file.
    pub fn read_file(&self, ino: InodeNo) -> Result<Vec<u8>> {
        let size = {
            let state = self.state.lock();
            let record = inode::read_inode(&self.io, &state.sb, ino)?;
            u64::from(record.i_size)
        };
        self.read(ino, 0, size as usize)
    }

    /// Write `data` at `offset`, extending allocations as needed.
    /// Returns the number of bytes written (always `data.len()`).
    pub fn write(&self, ino: InodeNo, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(LolfsError::TooBig)?;
        if end > MAX_FILESIZE {
            return Err(LolfsError::TooBig);
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let mut record = inode::read_inode(&self.io, &state.sb, ino)?;
        if record.is_dir() {
            return Err(LolfsError::IsDirectory);
        }
        if record.is_symlink() {
            return Err(LolfsError::Format("cannot write to a symlink".into()));
        }
        if record.ei_block == 0 {
            return Err(LolfsError::Corruption {
                block: 0,
                detail: format!("inode {ino} has no extent index block"),
            });
        }

        let comp_algo = CompAlgo::from_raw(state.sb.comp_default_algo).unwrap_or_default();
        let comp_enabled = state.sb.comp_enabled != 0 && comp_algo != CompAlgo::None;
        let enc_algo = EncAlgo::from_raw(state.sb.enc_default_algo).unwrap_or_default();
        let enc_enabled = state.sb.enc_enabled != 0 && enc_algo != EncAlgo::None;

        // Fail before any allocation when the key is unavailable; the
        // unlocked flag is re-read under the encryption mutex here.
        let key = if enc_enabled {
            Some(self.data_key(state)?.expect("enc_enabled implies a key"))
        } else {
            None
        };

        let mut index = load_index(&self.io, record.ei_block)?;
        let used_before = index.count_used();
        let old_size = u64::from(record.i_size);
        let old_covered = index.total_blocks();
        let policy = AllocPolicy {
            comp_algo: if comp_enabled { comp_algo } else { CompAlgo::None },
            enc_algo: if enc_enabled { enc_algo } else { EncAlgo::None },
            with_meta: comp_enabled,
            cap: state.sb.max_extent_blocks,
        };

        let comp_min = state.sb.comp_min_block_size;
        let mut meta = MetaCache::new();
        let mut touched = BTreeSet::new();
        let args = WriteArgs {
            offset,
            end,
            data,
            old_size,
            old_covered,
            comp_enabled,
            comp_algo,
            comp_min,
            enc_enabled,
            enc_algo,
            key: key.as_ref(),
        };
        let result = write_blocks(
            &self.io,
            state,
            &mut index,
            &policy,
            &mut meta,
            &mut touched,
            args,
        );

        if let Err(err) = result {
            // Reclaim extents this write allocated, then surface the error.
            for slot in used_before..index.count_used() {
                let extent = index.extents[slot];
                state
                    .alloc
                    .free_blocks(&self.io, BlockNo(extent.ee_start), extent.ee_len)?;
                if extent.ee_meta != 0 {
                    state.alloc.free_blocks(&self.io, BlockNo(extent.ee_meta), 1)?;
                }
                index.extents[slot] = Extent::default();
            }
            store_index(&self.io, record.ei_block, &index)?;
            return Err(err);
        }

        meta.flush(&self.io)?;
        refresh_extent_flags(&self.io, &mut index, &touched, enc_enabled, enc_algo, &mut meta)?;
        store_index(&self.io, record.ei_block, &index)?;

        record.i_size = old_size.max(end) as u32;
        record.i_blocks = index.total_blocks();
        let now = now_secs();
        record.i_mtime = now;
        record.i_ctime = now;
        inode::write_inode(&self.io, &state.sb, ino, &record)?;

        debug!(target: "lolfs::file", ino = ino.0, offset, len = data.len(), "wrote range");
        Ok(data.len())
    }

    /// Shrink or grow the file. Shrinking frees whole trailing extents;
    /// growing leaves a hole that reads as zeros.
    pub fn truncate(&self, ino: InodeNo, new_size: u64) -> Result<()> {
        if new_size > MAX_FILESIZE {
            return Err(LolfsError::TooBig);
        }
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut record = inode::read_inode(&self.io, &state.sb, ino)?;
        if record.is_dir() {
            return Err(LolfsError::IsDirectory);
        }
        if record.is_symlink() {
            return Err(LolfsError::Format("cannot truncate a symlink".into()));
        }

        if new_size < u64::from(record.i_size) && record.ei_block != 0 {
            let mut index = load_index(&self.io, record.ei_block)?;
            let keep_blocks = ((new_size + u64::from(BLOCK_SIZE) - 1) / u64::from(BLOCK_SIZE)) as u32;
            let freed =
                lolfs_extent::truncate(&mut index, keep_blocks, &mut state.alloc, &self.io)?;
            store_index(&self.io, record.ei_block, &index)?;
            record.i_blocks = index.total_blocks();
            debug!(target: "lolfs::file", ino = ino.0, new_size, freed, "truncated");
        }

        record.i_size = new_size as u32;
        let now = now_secs();
        record.i_mtime = now;
        record.i_ctime = now;
        inode::write_inode(&self.io, &state.sb, ino, &record)
    }
}

// ── Write internals ─────────────────────────────────────────────────────────

struct WriteArgs<'a> {
    offset: u64,
    end: u64,
    data: &'a [u8],
    old_size: u64,
    old_covered: u32,
    comp_enabled: bool,
    comp_algo: CompAlgo,
    comp_min: u32,
    enc_enabled: bool,
    enc_algo: EncAlgo,
    key: Option<&'a [u8; 32]>,
}

fn write_blocks(
    io: &BlockIo,
    state: &mut FsState,
    index: &mut ExtentIndex,
    policy: &AllocPolicy,
    meta: &mut MetaCache,
    touched: &mut BTreeSet<usize>,
    args: WriteArgs<'_>,
) -> Result<()> {
    let block_size = u64::from(BLOCK_SIZE);
    let first = (args.offset / block_size) as u32;
    let last = ((args.end - 1) / block_size) as u32;

    for lb in first..=last {
        let slot = lolfs_extent::allocate_for(index, lb, &mut state.alloc, io, policy)?;
        touched.insert(slot);
        let extent = index.extents[slot];
        let phys = extent.physical_for(lb).ok_or_else(|| LolfsError::Corruption {
            block: extent.ee_start,
            detail: format!("allocation left logical block {lb} uncovered"),
        })?;

        let block_start = u64::from(lb) * block_size;
        let from = args.offset.max(block_start);
        let to = args.end.min(block_start + block_size);
        let full_cover = from == block_start && to == block_start + block_size;

        // Compose the block's new plaintext, merging prior contents on
        // partial writes of blocks that already held data.
        let mut plain = if !full_cover && lb < args.old_covered && block_start < args.old_size {
            decode_data_block(io, &extent, lb, args.key, meta)?
        } else {
            vec![0_u8; BLOCK_SIZE as usize]
        };
        let data_from = (from - args.offset) as usize;
        let data_to = (to - args.offset) as usize;
        plain[(from - block_start) as usize..(to - block_start) as usize]
            .copy_from_slice(&args.data[data_from..data_to]);

        // Compress fully covered blocks when the saving clears the
        // threshold; partial blocks are stored raw.
        let mut comp_size = 0_u16;
        let mut out = plain;
        if args.comp_enabled
            && extent.ee_meta != 0
            && full_cover
            && BLOCK_SIZE >= args.comp_min
        {
            if let Some(compressed) = lolfs_codec::compress(args.comp_algo, &out)? {
                comp_size = compressed.len() as u16;
                let mut padded = vec![0_u8; BLOCK_SIZE as usize];
                padded[..compressed.len()].copy_from_slice(&compressed);
                out = padded;
            }
        }
        if extent.ee_meta != 0 {
            meta.set_entry(
                io,
                extent.ee_meta,
                (lb - extent.ee_block) as usize,
                CompBlockMeta {
                    comp_size,
                    comp_algo: 0,
                    flags: 0,
                },
            )?;
        }

        if args.enc_enabled {
            let key = args.key.expect("enc_enabled implies a key");
            out = lolfs_codec::encrypt_block(args.enc_algo, key, u64::from(lb), &out)?;
        }

        io.write_block(BlockNo(phys), &out)?;
    }

    Ok(())
}

/// Recompute codec flags for every extent touched by a write.
fn refresh_extent_flags(
    io: &BlockIo,
    index: &mut ExtentIndex,
    touched: &BTreeSet<usize>,
    enc_enabled: bool,
    enc_algo: EncAlgo,
    meta: &mut MetaCache,
) -> Result<()> {
    for &slot in touched {
        let extent = &mut index.extents[slot];
        let mut flags = 0_u16;
        if extent.ee_meta != 0 {
            flags |= EXT_HAS_META;
            let (any_comp, any_raw) = meta.comp_profile(io, extent.ee_meta, extent.ee_len)?;
            if any_comp {
                flags |= EXT_COMPRESSED;
                if any_raw {
                    flags |= lolfs_types::EXT_MIXED;
                }
            }
        }
        if enc_enabled {
            flags |= EXT_ENCRYPTED;
            extent.ee_enc_algo = enc_algo.as_raw() as u8;
        }
        extent.ee_flags = flags;
    }
    Ok(())
}
