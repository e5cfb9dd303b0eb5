//! Directory operations.
//!
//! A directory's extent index points at data blocks packed with
//! fixed-width name entries. Entries stay dense: removal moves the last
//! entry into the hole, so the insert position is always derived from
//! `nr_files` and a block whose first slot is empty terminates scans.

use crate::{inode, load_index, now_secs, store_index, validate_name, FsState, Lolfs};
use lolfs_block::BlockIo;
use lolfs_error::{LolfsError, Result};
use lolfs_extent::{search, AllocPolicy, Slot};
use lolfs_ondisk::{DirEntry, ExtentIndex, Inode};
use lolfs_types::{
    BLOCK_SIZE, BlockNo, DIR_ENTRY_SIZE, FILES_PER_BLOCK, FileKind, INLINE_TARGET_MAX, InodeNo,
    S_IFDIR, S_IFLNK, S_IFREG,
};
use serde::Serialize;
use tracing::debug;

/// One entry produced by directory iteration. `cursor` resumes the
/// iteration immediately after this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub ino: InodeNo,
    pub cursor: u64,
}

// ── Entry addressing ────────────────────────────────────────────────────────

/// Physical block and byte offset of the entry at `ordinal`.
fn dir_slot(index: &ExtentIndex, ordinal: u32) -> Result<(BlockNo, usize)> {
    let logical = ordinal / FILES_PER_BLOCK;
    match search(index, logical) {
        Slot::Used(slot) => {
            let phys = index.extents[slot]
                .physical_for(logical)
                .expect("search returned a covering extent");
            Ok((
                BlockNo(phys),
                (ordinal % FILES_PER_BLOCK) as usize * DIR_ENTRY_SIZE,
            ))
        }
        _ => Err(LolfsError::Corruption {
            block: 0,
            detail: format!("directory entry {ordinal} is beyond the allocated blocks"),
        }),
    }
}

/// Walk live entries in on-disk order, calling `f(position, entry)`.
/// Stops early when `f` returns `false`.
fn for_each_entry(
    io: &BlockIo,
    index: &ExtentIndex,
    mut f: impl FnMut(u32, DirEntry) -> Result<bool>,
) -> Result<()> {
    let total = index.nr_files;
    let mut pos = 0_u32;

    for extent in index.extents.iter().take_while(|e| !e.is_unused()) {
        for bi in 0..extent.ee_len {
            if pos >= total {
                return Ok(());
            }
            let block_no = BlockNo(extent.ee_start + bi);
            let block = io.read_block(block_no)?;
            for slot in 0..FILES_PER_BLOCK {
                if pos >= total {
                    return Ok(());
                }
                let offset = slot as usize * DIR_ENTRY_SIZE;
                match DirEntry::parse_at(&block, offset) {
                    Some(entry) if entry.inode != 0 => {
                        if !f(pos, entry)? {
                            return Ok(());
                        }
                        pos += 1;
                    }
                    _ => {
                        return Err(LolfsError::Corruption {
                            block: block_no.0,
                            detail: format!(
                                "directory claims {total} entries but position {pos} is empty"
                            ),
                        });
                    }
                }
            }
        }
    }

    if pos < total {
        return Err(LolfsError::Corruption {
            block: 0,
            detail: format!("directory claims {total} entries, found {pos}"),
        });
    }
    Ok(())
}

/// Find `name`, returning its child inode and position.
fn dir_find(io: &BlockIo, index: &ExtentIndex, name: &str) -> Result<Option<(InodeNo, u32)>> {
    let mut found = None;
    for_each_entry(io, index, |pos, entry| {
        if entry.name == name {
            found = Some((InodeNo(entry.inode), pos));
            Ok(false)
        } else {
            Ok(true)
        }
    })?;
    Ok(found)
}

// ── Insert / remove ─────────────────────────────────────────────────────────

/// Append an entry at position `nr_files`, allocating (and zero-filling)
/// directory blocks on demand, then update the parent inode.
fn dir_insert(
    io: &BlockIo,
    state: &mut FsState,
    parent_ino: InodeNo,
    parent: &mut Inode,
    name: &str,
    child: InodeNo,
) -> Result<()> {
    let mut index = load_index(io, parent.ei_block)?;
    let n = index.nr_files;
    let logical = n / FILES_PER_BLOCK;
    let used_before = index.count_used();

    let policy = AllocPolicy::plain(state.sb.max_extent_blocks);
    let result = (|| -> Result<()> {
        lolfs_extent::allocate_for(&mut index, logical, &mut state.alloc, io, &policy)?;

        // Fresh extents must read as empty directory blocks.
        if index.count_used() > used_before {
            let zero = vec![0_u8; BLOCK_SIZE as usize];
            for slot in used_before..index.count_used() {
                let extent = index.extents[slot];
                for bi in 0..extent.ee_len {
                    io.write_block(BlockNo(extent.ee_start + bi), &zero)?;
                }
            }
        }

        let (block_no, offset) = dir_slot(&index, n)?;
        let mut block = io.read_block(block_no)?;
        DirEntry {
            inode: child.0,
            name: name.to_owned(),
        }
        .encode_at(&mut block, offset);
        io.write_block(block_no, &block)?;

        index.nr_files = n + 1;
        store_index(io, parent.ei_block, &index)
    })();

    if let Err(err) = result {
        // Reclaim extents this insert allocated.
        for slot in used_before..index.count_used() {
            let extent = index.extents[slot];
            state
                .alloc
                .free_blocks(io, BlockNo(extent.ee_start), extent.ee_len)?;
            index.extents[slot] = Default::default();
        }
        return Err(err);
    }

    parent.i_size += DIR_ENTRY_SIZE as u32;
    parent.i_blocks = 1 + index.total_blocks();
    let now = now_secs();
    parent.i_mtime = now;
    parent.i_ctime = now;
    inode::write_inode(io, &state.sb, parent_ino, parent)?;
    debug!(target: "lolfs::dir", parent = parent_ino.0, name, child = child.0, "inserted entry");
    Ok(())
}

/// Remove `name` by moving the last entry into its slot, then update the
/// parent inode. Returns the removed child's inode.
fn dir_remove(
    io: &BlockIo,
    state: &mut FsState,
    parent_ino: InodeNo,
    parent: &mut Inode,
    name: &str,
) -> Result<InodeNo> {
    let mut index = load_index(io, parent.ei_block)?;
    let Some((child, pos)) = dir_find(io, &index, name)? else {
        return Err(LolfsError::NotFound(name.to_owned()));
    };

    let last = index.nr_files - 1;
    let (last_block_no, last_offset) = dir_slot(&index, last)?;

    if pos == last {
        let mut block = io.read_block(last_block_no)?;
        block[last_offset..last_offset + DIR_ENTRY_SIZE].fill(0);
        io.write_block(last_block_no, &block)?;
    } else {
        let (pos_block_no, pos_offset) = dir_slot(&index, pos)?;
        let mut last_block = io.read_block(last_block_no)?;
        if pos_block_no == last_block_no {
            last_block.copy_within(last_offset..last_offset + DIR_ENTRY_SIZE, pos_offset);
            last_block[last_offset..last_offset + DIR_ENTRY_SIZE].fill(0);
            io.write_block(last_block_no, &last_block)?;
        } else {
            let mut pos_block = io.read_block(pos_block_no)?;
            pos_block[pos_offset..pos_offset + DIR_ENTRY_SIZE]
                .copy_from_slice(&last_block[last_offset..last_offset + DIR_ENTRY_SIZE]);
            io.write_block(pos_block_no, &pos_block)?;
            last_block[last_offset..last_offset + DIR_ENTRY_SIZE].fill(0);
            io.write_block(last_block_no, &last_block)?;
        }
    }

    index.nr_files = last;
    store_index(io, parent.ei_block, &index)?;

    parent.i_size = parent.i_size.saturating_sub(DIR_ENTRY_SIZE as u32);
    let now = now_secs();
    parent.i_mtime = now;
    parent.i_ctime = now;
    inode::write_inode(io, &state.sb, parent_ino, parent)?;
    debug!(target: "lolfs::dir", parent = parent_ino.0, name, child = child.0, "removed entry");
    Ok(child)
}

fn read_dir_inode(io: &BlockIo, state: &FsState, ino: InodeNo) -> Result<Inode> {
    let record = inode::read_inode(io, &state.sb, ino)?;
    if !record.is_dir() {
        return Err(LolfsError::NotDirectory);
    }
    Ok(record)
}

// ── Public surface ──────────────────────────────────────────────────────────

impl Lolfs {
    /// Look up `name` in `parent`.
    pub fn lookup(&self, parent: InodeNo, name: &str) -> Result<InodeNo> {
        let state = self.state.lock();
        let parent_inode = read_dir_inode(&self.io, &state, parent)?;
        let index = load_index(&self.io, parent_inode.ei_block)?;
        dir_find(&self.io, &index, name)?
            .map(|(ino, _)| ino)
            .ok_or_else(|| LolfsError::NotFound(name.to_owned()))
    }

    /// Create a regular file.
    pub fn create_file(&self, parent: InodeNo, name: &str) -> Result<InodeNo> {
        self.create_node(parent, name, FileKind::Regular, None)
    }

    /// Create a directory.
    pub fn mkdir(&self, parent: InodeNo, name: &str) -> Result<InodeNo> {
        self.create_node(parent, name, FileKind::Directory, None)
    }

    /// Create a symbolic link with an inline target.
    pub fn symlink(&self, parent: InodeNo, name: &str, target: &str) -> Result<InodeNo> {
        self.create_node(parent, name, FileKind::Symlink, Some(target))
    }

    fn create_node(
        &self,
        parent: InodeNo,
        name: &str,
        kind: FileKind,
        target: Option<&str>,
    ) -> Result<InodeNo> {
        validate_name(name)?;
        let target = match (kind, target) {
            (FileKind::Symlink, Some(target)) => {
                if target.len() > INLINE_TARGET_MAX {
                    return Err(LolfsError::TooBig);
                }
                Some(target)
            }
            _ => None,
        };

        let mut state = self.state.lock();
        let state = &mut *state;
        let mut parent_inode = read_dir_inode(&self.io, state, parent)?;
        let index = load_index(&self.io, parent_inode.ei_block)?;
        if dir_find(&self.io, &index, name)?.is_some() {
            return Err(LolfsError::Exists);
        }

        let ino = state.alloc.alloc_inode(&self.io)?;

        // Files and directories own an extent index block; short symlink
        // targets live inline in the inode.
        let ei_block = if kind == FileKind::Symlink {
            0
        } else {
            match state.alloc.alloc_blocks(&self.io, 1) {
                Ok(block) => {
                    let mut buf = vec![0_u8; BLOCK_SIZE as usize];
                    ExtentIndex::empty().encode_into(&mut buf);
                    self.io.write_block(block, &buf)?;
                    block.0
                }
                Err(err) => {
                    state.alloc.free_inode(&self.io, ino)?;
                    return Err(err);
                }
            }
        };

        let now = now_secs();
        let mut i_data = [0_u8; 28];
        if let Some(target) = target {
            i_data[..target.len()].copy_from_slice(target.as_bytes());
        }
        let record = Inode {
            i_mode: match kind {
                FileKind::Regular => S_IFREG | 0o644,
                FileKind::Directory => S_IFDIR | 0o755,
                FileKind::Symlink => S_IFLNK | 0o777,
            },
            i_uid: 0,
            i_gid: 0,
            i_size: target.map_or(0, |t| t.len() as u32),
            i_ctime: now,
            i_atime: now,
            i_mtime: now,
            i_blocks: u32::from(kind == FileKind::Directory),
            i_nlink: if kind == FileKind::Directory { 2 } else { 1 },
            ei_block,
            xattr_block: 0,
            i_data,
        };
        inode::write_inode(&self.io, &state.sb, ino, &record)?;

        if kind == FileKind::Directory {
            parent_inode.i_nlink += 1;
        }
        if let Err(err) = dir_insert(&self.io, state, parent, &mut parent_inode, name, ino) {
            if ei_block != 0 {
                state.alloc.free_blocks(&self.io, BlockNo(ei_block), 1)?;
            }
            inode::release_inode(&self.io, state, ino)?;
            return Err(err);
        }
        Ok(ino)
    }

    /// Remove a file or symlink; data blocks come back to the free pool
    /// when the last link goes away.
    pub fn unlink(&self, parent: InodeNo, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut parent_inode = read_dir_inode(&self.io, state, parent)?;

        let index = load_index(&self.io, parent_inode.ei_block)?;
        let Some((child, _)) = dir_find(&self.io, &index, name)? else {
            return Err(LolfsError::NotFound(name.to_owned()));
        };
        let mut child_inode = inode::read_inode(&self.io, &state.sb, child)?;
        if child_inode.is_dir() {
            return Err(LolfsError::IsDirectory);
        }

        dir_remove(&self.io, state, parent, &mut parent_inode, name)?;

        child_inode.i_nlink = child_inode.i_nlink.saturating_sub(1);
        if child_inode.i_nlink == 0 {
            if child_inode.ei_block != 0 {
                let mut child_index = load_index(&self.io, child_inode.ei_block)?;
                lolfs_extent::free_all(&mut child_index, &mut state.alloc, &self.io)?;
                state
                    .alloc
                    .free_blocks(&self.io, BlockNo(child_inode.ei_block), 1)?;
            }
            crate::xattr::free_xattr_blocks(&self.io, state, &child_inode)?;
            inode::release_inode(&self.io, state, child)?;
        } else {
            child_inode.i_ctime = now_secs();
            inode::write_inode(&self.io, &state.sb, child, &child_inode)?;
        }
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, parent: InodeNo, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut parent_inode = read_dir_inode(&self.io, state, parent)?;

        let index = load_index(&self.io, parent_inode.ei_block)?;
        let Some((child, _)) = dir_find(&self.io, &index, name)? else {
            return Err(LolfsError::NotFound(name.to_owned()));
        };
        let child_inode = inode::read_inode(&self.io, &state.sb, child)?;
        if !child_inode.is_dir() {
            return Err(LolfsError::NotDirectory);
        }
        let mut child_index = load_index(&self.io, child_inode.ei_block)?;
        if child_index.nr_files != 0 {
            return Err(LolfsError::NotEmpty);
        }

        parent_inode.i_nlink = parent_inode.i_nlink.saturating_sub(1);
        dir_remove(&self.io, state, parent, &mut parent_inode, name)?;

        lolfs_extent::free_all(&mut child_index, &mut state.alloc, &self.io)?;
        state
            .alloc
            .free_blocks(&self.io, BlockNo(child_inode.ei_block), 1)?;
        crate::xattr::free_xattr_blocks(&self.io, state, &child_inode)?;
        inode::release_inode(&self.io, state, child)
    }

    /// Create a hard link to a regular file or symlink.
    pub fn link(&self, target: InodeNo, parent: InodeNo, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut state = self.state.lock();
        let state = &mut *state;
        let mut parent_inode = read_dir_inode(&self.io, state, parent)?;

        let index = load_index(&self.io, parent_inode.ei_block)?;
        if dir_find(&self.io, &index, name)?.is_some() {
            return Err(LolfsError::Exists);
        }
        let mut target_inode = inode::read_inode(&self.io, &state.sb, target)?;
        if target_inode.is_dir() {
            return Err(LolfsError::IsDirectory);
        }

        target_inode.i_nlink += 1;
        target_inode.i_ctime = now_secs();
        inode::write_inode(&self.io, &state.sb, target, &target_inode)?;

        if let Err(err) = dir_insert(&self.io, state, parent, &mut parent_inode, name, target) {
            target_inode.i_nlink -= 1;
            inode::write_inode(&self.io, &state.sb, target, &target_inode)?;
            return Err(err);
        }
        Ok(())
    }

    /// Move `old_name` in `old_parent` to `new_name` in `new_parent`.
    /// Fails with `Exists` if the destination name is taken.
    pub fn rename(
        &self,
        old_parent: InodeNo,
        old_name: &str,
        new_parent: InodeNo,
        new_name: &str,
    ) -> Result<()> {
        validate_name(new_name)?;
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut old_parent_inode = read_dir_inode(&self.io, state, old_parent)?;
        let old_index = load_index(&self.io, old_parent_inode.ei_block)?;
        let Some((child, _)) = dir_find(&self.io, &old_index, old_name)? else {
            return Err(LolfsError::NotFound(old_name.to_owned()));
        };

        let same_parent = old_parent == new_parent;
        let mut new_parent_inode = if same_parent {
            old_parent_inode.clone()
        } else {
            read_dir_inode(&self.io, state, new_parent)?
        };
        let new_index = load_index(&self.io, new_parent_inode.ei_block)?;
        if dir_find(&self.io, &new_index, new_name)?.is_some() {
            return Err(LolfsError::Exists);
        }

        let child_inode = inode::read_inode(&self.io, &state.sb, child)?;
        let moving_dir = child_inode.is_dir();
        if moving_dir && new_parent == child {
            return Err(LolfsError::Format(
                "cannot move a directory into itself".into(),
            ));
        }

        if moving_dir && !same_parent {
            new_parent_inode.i_nlink += 1;
        }
        dir_insert(
            &self.io,
            state,
            new_parent,
            &mut new_parent_inode,
            new_name,
            child,
        )?;

        let mut remove_parent_inode = if same_parent {
            new_parent_inode
        } else {
            if moving_dir {
                old_parent_inode.i_nlink = old_parent_inode.i_nlink.saturating_sub(1);
            }
            old_parent_inode
        };
        if let Err(err) = dir_remove(
            &self.io,
            state,
            old_parent,
            &mut remove_parent_inode,
            old_name,
        ) {
            // Best effort: take the new entry back out.
            let mut undo_parent = read_dir_inode(&self.io, state, new_parent)?;
            let _ = dir_remove(&self.io, state, new_parent, &mut undo_parent, new_name);
            return Err(err);
        }
        Ok(())
    }

    /// Live entries of a directory, in on-disk order.
    pub fn list_dir(&self, dir: InodeNo) -> Result<Vec<DirEntryInfo>> {
        let state = self.state.lock();
        let dir_inode = read_dir_inode(&self.io, &state, dir)?;
        let index = load_index(&self.io, dir_inode.ei_block)?;
        let mut out = Vec::with_capacity(index.nr_files as usize);
        for_each_entry(&self.io, &index, |pos, entry| {
            out.push(DirEntryInfo {
                name: entry.name,
                ino: InodeNo(entry.inode),
                cursor: u64::from(pos) + 3,
            });
            Ok(true)
        })?;
        Ok(out)
    }

    /// Iterate a directory from `cursor`, emitting the synthetic `.` and
    /// `..` first. Restartable from any cursor a previous call returned.
    pub fn iterate_dir(
        &self,
        dir: InodeNo,
        parent: InodeNo,
        cursor: u64,
    ) -> Result<Vec<DirEntryInfo>> {
        let state = self.state.lock();
        let dir_inode = read_dir_inode(&self.io, &state, dir)?;

        let mut out = Vec::new();
        if cursor == 0 {
            out.push(DirEntryInfo {
                name: ".".into(),
                ino: dir,
                cursor: 1,
            });
        }
        if cursor <= 1 {
            out.push(DirEntryInfo {
                name: "..".into(),
                ino: parent,
                cursor: 2,
            });
        }

        let index = load_index(&self.io, dir_inode.ei_block)?;
        for_each_entry(&self.io, &index, |pos, entry| {
            let position = u64::from(pos) + 2;
            if position >= cursor {
                out.push(DirEntryInfo {
                    name: entry.name,
                    ino: InodeNo(entry.inode),
                    cursor: position + 1,
                });
            }
            Ok(true)
        })?;
        Ok(out)
    }
}
