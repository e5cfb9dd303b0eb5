//! Extended attributes.
//!
//! An inode's xattr block (when nonzero) holds an extent index backing a
//! packed, namespaced entry list. Mutation rewrites the whole packed
//! region: entries are small and bounded, and a rewrite keeps deletion
//! compaction trivial.

use crate::{inode, now_secs, FsState, Lolfs};
use lolfs_block::BlockIo;
use lolfs_error::{LolfsError, Result};
use lolfs_extent::AllocPolicy;
use lolfs_ondisk::{
    parse_xattr_entries, serialize_xattr_entries, Extent, Inode, XattrEntry, XattrIndex,
    XattrNamespace,
};
use lolfs_types::{
    div_ceil_u32, BLOCK_SIZE, BlockNo, InodeNo, XATTR_NAME_MAX, XATTR_VALUE_MAX,
};
use tracing::debug;

/// Create-only / replace-only behavior for `set_xattr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct XattrSetFlags {
    /// Fail with `Exists` if the attribute is already present.
    pub create: bool,
    /// Fail with `NotFound` if the attribute is absent.
    pub replace: bool,
}

fn split_name(name: &str) -> Result<(XattrNamespace, &str)> {
    let (ns, base) = XattrNamespace::split(name).ok_or_else(|| {
        LolfsError::Format(format!(
            "xattr name {name:?} must be prefixed with user., trusted., system. or security."
        ))
    })?;
    if base.is_empty() {
        return Err(LolfsError::Format(format!("xattr name {name:?} is empty")));
    }
    if base.len() > XATTR_NAME_MAX {
        return Err(LolfsError::TooBig);
    }
    Ok((ns, base))
}

// ── Packed-region I/O ───────────────────────────────────────────────────────

fn load_xattr_index(io: &BlockIo, xattr_block: u32) -> Result<XattrIndex> {
    let raw = io.read_block(BlockNo(xattr_block))?;
    XattrIndex::parse(&raw).map_err(|e| LolfsError::Corruption {
        block: xattr_block,
        detail: e.to_string(),
    })
}

fn store_xattr_index(io: &BlockIo, xattr_block: u32, index: &XattrIndex) -> Result<()> {
    let mut raw = vec![0_u8; BLOCK_SIZE as usize];
    index.encode_into(&mut raw);
    io.write_block(BlockNo(xattr_block), &raw)
}

/// Read every entry of an inode; empty when no xattr block exists.
fn load_entries(io: &BlockIo, record: &Inode) -> Result<Vec<XattrEntry>> {
    if record.xattr_block == 0 {
        return Ok(Vec::new());
    }
    let index = load_xattr_index(io, record.xattr_block)?;

    let mut data = Vec::with_capacity(index.total_size as usize);
    'read: for extent in index.extents.iter().take_while(|e| !e.is_unused()) {
        for bi in 0..extent.ee_len {
            if data.len() >= index.total_size as usize {
                break 'read;
            }
            data.extend_from_slice(&io.read_block(BlockNo(extent.ee_start + bi))?);
        }
    }
    if data.len() < index.total_size as usize {
        return Err(LolfsError::Corruption {
            block: record.xattr_block,
            detail: format!(
                "xattr extents hold {} bytes, header claims {}",
                data.len(),
                index.total_size
            ),
        });
    }
    data.truncate(index.total_size as usize);

    parse_xattr_entries(&data, index.count).map_err(|e| LolfsError::Corruption {
        block: record.xattr_block,
        detail: e.to_string(),
    })
}

/// Release the data extents of an xattr index, keeping the index block.
fn free_data_extents(io: &BlockIo, state: &mut FsState, index: &mut XattrIndex) -> Result<()> {
    for slot in 0..index.count_used_extents() {
        let extent = index.extents[slot];
        state
            .alloc
            .free_blocks(io, BlockNo(extent.ee_start), extent.ee_len)?;
        index.extents[slot] = Extent::default();
    }
    Ok(())
}

/// Serialize `entries` and rewrite the inode's xattr storage. An empty
/// list frees everything including the index block.
fn rewrite_entries(
    io: &BlockIo,
    state: &mut FsState,
    ino: InodeNo,
    record: &mut Inode,
    entries: &[XattrEntry],
) -> Result<()> {
    if entries.is_empty() {
        if record.xattr_block != 0 {
            let mut index = load_xattr_index(io, record.xattr_block)?;
            free_data_extents(io, state, &mut index)?;
            state.alloc.free_blocks(io, BlockNo(record.xattr_block), 1)?;
            record.xattr_block = 0;
        }
    } else {
        let data = serialize_xattr_entries(entries);
        let nr_blocks = div_ceil_u32(data.len() as u32, BLOCK_SIZE);

        let mut index = if record.xattr_block == 0 {
            record.xattr_block = state.alloc.alloc_blocks(io, 1)?.0;
            XattrIndex::empty()
        } else {
            let mut index = load_xattr_index(io, record.xattr_block)?;
            free_data_extents(io, state, &mut index)?;
            index
        };

        // Allocate data extents with the adaptive run policy; xattrs are
        // metadata and stay outside the codec pipeline.
        let policy = AllocPolicy::plain(state.sb.max_extent_blocks);
        let mut allocated = 0_u32;
        let mut slot = 0_usize;
        while allocated < nr_blocks {
            if slot >= lolfs_types::MAX_EXTENTS {
                free_data_extents(io, state, &mut index)?;
                return Err(LolfsError::NoSpace);
            }
            let run = state
                .alloc
                .optimal_run(allocated, policy.cap)
                .min(nr_blocks - allocated);
            let start = state.alloc.alloc_blocks_hint(io, run)?;
            index.extents[slot] = Extent {
                ee_block: allocated,
                ee_len: run,
                ee_start: start.0,
                ..Extent::default()
            };
            slot += 1;
            allocated += run;
        }

        // Write the packed region into the freshly allocated blocks.
        let mut chunk_iter = data.chunks(BLOCK_SIZE as usize);
        for extent in index.extents.iter().take(slot) {
            for bi in 0..extent.ee_len {
                let mut block = vec![0_u8; BLOCK_SIZE as usize];
                if let Some(chunk) = chunk_iter.next() {
                    block[..chunk.len()].copy_from_slice(chunk);
                }
                io.write_block(BlockNo(extent.ee_start + bi), &block)?;
            }
        }

        index.total_size = data.len() as u32;
        index.count = entries.len() as u32;
        store_xattr_index(io, record.xattr_block, &index)?;
    }

    record.i_ctime = now_secs();
    inode::write_inode(io, &state.sb, ino, record)
}

/// Free every block reachable from an inode's xattr index; used when the
/// inode itself is released.
pub(crate) fn free_xattr_blocks(io: &BlockIo, state: &mut FsState, record: &Inode) -> Result<()> {
    if record.xattr_block == 0 {
        return Ok(());
    }
    let mut index = load_xattr_index(io, record.xattr_block)?;
    free_data_extents(io, state, &mut index)?;
    state.alloc.free_blocks(io, BlockNo(record.xattr_block), 1)
}

// ── Public surface ──────────────────────────────────────────────────────────

impl Lolfs {
    /// The value of attribute `name` on `ino`.
    pub fn get_xattr(&self, ino: InodeNo, name: &str) -> Result<Vec<u8>> {
        let (ns, base) = split_name(name)?;
        let state = self.state.lock();
        let record = inode::read_inode(&self.io, &state.sb, ino)?;
        let entries = load_entries(&self.io, &record)?;
        entries
            .into_iter()
            .find(|e| e.namespace == ns && e.name == base)
            .map(|e| e.value)
            .ok_or_else(|| LolfsError::NotFound(name.to_owned()))
    }

    /// Set attribute `name` to `value`, honoring create-only and
    /// replace-only flags.
    pub fn set_xattr(
        &self,
        ino: InodeNo,
        name: &str,
        value: &[u8],
        flags: XattrSetFlags,
    ) -> Result<()> {
        let (ns, base) = split_name(name)?;
        if value.len() > XATTR_VALUE_MAX {
            return Err(LolfsError::TooBig);
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let mut record = inode::read_inode(&self.io, &state.sb, ino)?;
        let mut entries = load_entries(&self.io, &record)?;

        let existing = entries
            .iter()
            .position(|e| e.namespace == ns && e.name == base);
        match existing {
            Some(_) if flags.create => return Err(LolfsError::Exists),
            None if flags.replace => return Err(LolfsError::NotFound(name.to_owned())),
            Some(idx) => entries[idx].value = value.to_vec(),
            None => entries.push(XattrEntry {
                namespace: ns,
                name: base.to_owned(),
                value: value.to_vec(),
            }),
        }

        rewrite_entries(&self.io, state, ino, &mut record, &entries)?;
        debug!(target: "lolfs::xattr", ino = ino.0, name, len = value.len(), "set attribute");
        Ok(())
    }

    /// Fully qualified names of every attribute on `ino`.
    pub fn list_xattr(&self, ino: InodeNo) -> Result<Vec<String>> {
        let state = self.state.lock();
        let record = inode::read_inode(&self.io, &state.sb, ino)?;
        Ok(load_entries(&self.io, &record)?
            .iter()
            .map(XattrEntry::full_name)
            .collect())
    }

    /// Remove attribute `name`; later entries shift into the gap.
    pub fn remove_xattr(&self, ino: InodeNo, name: &str) -> Result<()> {
        let (ns, base) = split_name(name)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut record = inode::read_inode(&self.io, &state.sb, ino)?;
        let mut entries = load_entries(&self.io, &record)?;

        let before = entries.len();
        entries.retain(|e| !(e.namespace == ns && e.name == base));
        if entries.len() == before {
            return Err(LolfsError::NotFound(name.to_owned()));
        }

        rewrite_entries(&self.io, state, ino, &mut record, &entries)?;
        debug!(target: "lolfs::xattr", ino = ino.0, name, "removed attribute");
        Ok(())
    }
}
