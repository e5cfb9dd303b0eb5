//! Inode store access: fixed-size records addressed by inode number.

use crate::{FsState, Lolfs};
use lolfs_block::BlockIo;
use lolfs_error::{LolfsError, Result};
use lolfs_ondisk::{Inode, Superblock};
use lolfs_types::{BlockNo, INODES_PER_BLOCK, InodeNo};

/// Block and byte offset of an inode record within the inode store.
fn locate(sb: &Superblock, ino: InodeNo) -> Result<(BlockNo, usize)> {
    if ino.0 >= sb.nr_inodes {
        return Err(LolfsError::Corruption {
            block: 0,
            detail: format!("inode {ino} out of range (max {})", sb.nr_inodes - 1),
        });
    }
    let block = sb.inode_store_start() + ino.0 / INODES_PER_BLOCK;
    let offset = (ino.0 % INODES_PER_BLOCK) as usize * Inode::SIZE;
    Ok((BlockNo(block), offset))
}

/// Read one inode record.
pub(crate) fn read_inode(io: &BlockIo, sb: &Superblock, ino: InodeNo) -> Result<Inode> {
    let (block, offset) = locate(sb, ino)?;
    let buf = io.read_block(block)?;
    Inode::parse(&buf[offset..offset + Inode::SIZE]).map_err(|e| LolfsError::Corruption {
        block: block.0,
        detail: e.to_string(),
    })
}

/// Write one inode record (read-modify-write of its store block).
pub(crate) fn write_inode(
    io: &BlockIo,
    sb: &Superblock,
    ino: InodeNo,
    inode: &Inode,
) -> Result<()> {
    let (block, offset) = locate(sb, ino)?;
    let mut buf = io.read_block(block)?;
    inode.encode_into(&mut buf[offset..offset + Inode::SIZE]);
    io.write_block(block, &buf)
}

/// Clear the record and release the inode bit. The caller has already
/// freed every block reachable from the inode.
pub(crate) fn release_inode(io: &BlockIo, state: &mut FsState, ino: InodeNo) -> Result<()> {
    write_inode(io, &state.sb, ino, &Inode::zeroed())?;
    state.alloc.free_inode(io, ino)
}

impl Lolfs {
    /// The full inode record for `ino`.
    pub fn stat(&self, ino: InodeNo) -> Result<Inode> {
        let state = self.state.lock();
        let inode = read_inode(&self.io, &state.sb, ino)?;
        if inode.i_nlink == 0 {
            return Err(LolfsError::NotFound(format!("inode {ino}")));
        }
        Ok(inode)
    }

    /// The target of a symbolic link.
    pub fn read_link(&self, ino: InodeNo) -> Result<String> {
        let inode = self.stat(ino)?;
        if !inode.is_symlink() {
            return Err(LolfsError::Format(format!("inode {ino} is not a symlink")));
        }
        Ok(inode.symlink_target())
    }
}
