#![forbid(unsafe_code)]
//! On-disk structures for lolfs.
//!
//! Byte-exact parse and encode for the superblock, the 72-byte inode
//! record, the 24-byte extent, extent index blocks, directory entries,
//! xattr index blocks and packed xattr entries, and the per-extent
//! compression metadata block.
//!
//! All integers are little-endian; every structure lives inside one
//! 4096-byte block.

use lolfs_types::{
    put_le_u16, put_le_u32, read_fixed, read_le_u16, read_le_u32, trim_nul_padded,
    COMP_META_MAGIC, DIR_ENTRY_SIZE, EXTENT_SIZE, FILENAME_LEN, FileKind, INODE_SIZE,
    LOLFS_MAGIC, MAX_EXTENTS, META_ENTRIES_PER_BLOCK, ParseError, S_IFMT,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// The formatted layout descriptor stored in block 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub magic: u32,
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
    pub version: u32,
    pub comp_default_algo: u32,
    pub comp_enabled: u32,
    pub comp_min_block_size: u32,
    pub comp_features: u32,
    pub max_extent_blocks: u32,
    pub max_extent_blocks_large: u32,
    pub enc_enabled: u32,
    pub enc_default_algo: u32,
    pub enc_kdf_algo: u32,
    pub enc_kdf_iterations: u32,
    pub enc_kdf_memory: u32,
    pub enc_kdf_parallelism: u32,
    pub enc_salt: [u8; 32],
    pub enc_master_key: [u8; 32],
    pub enc_features: u32,
    pub reserved: [u32; 3],
}

impl Superblock {
    /// Bytes of the superblock that carry data; the rest of block 0 is zero.
    pub const SIZE: usize = 164;

    /// Parse a superblock from the first block of an image.
    ///
    /// Only the magic is enforced here; semantic validation (version,
    /// algorithm ids, layout arithmetic) lives with the checker.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(region, 0)?;
        if magic != LOLFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: LOLFS_MAGIC,
                actual: magic,
            });
        }

        Ok(Self {
            magic,
            nr_blocks: read_le_u32(region, 4)?,
            nr_inodes: read_le_u32(region, 8)?,
            nr_istore_blocks: read_le_u32(region, 12)?,
            nr_ifree_blocks: read_le_u32(region, 16)?,
            nr_bfree_blocks: read_le_u32(region, 20)?,
            nr_free_inodes: read_le_u32(region, 24)?,
            nr_free_blocks: read_le_u32(region, 28)?,
            version: read_le_u32(region, 32)?,
            comp_default_algo: read_le_u32(region, 36)?,
            comp_enabled: read_le_u32(region, 40)?,
            comp_min_block_size: read_le_u32(region, 44)?,
            comp_features: read_le_u32(region, 48)?,
            max_extent_blocks: read_le_u32(region, 52)?,
            max_extent_blocks_large: read_le_u32(region, 56)?,
            enc_enabled: read_le_u32(region, 60)?,
            enc_default_algo: read_le_u32(region, 64)?,
            enc_kdf_algo: read_le_u32(region, 68)?,
            enc_kdf_iterations: read_le_u32(region, 72)?,
            enc_kdf_memory: read_le_u32(region, 76)?,
            enc_kdf_parallelism: read_le_u32(region, 80)?,
            enc_salt: read_fixed::<32>(region, 84)?,
            enc_master_key: read_fixed::<32>(region, 116)?,
            enc_features: read_le_u32(region, 148)?,
            reserved: [
                read_le_u32(region, 152)?,
                read_le_u32(region, 156)?,
                read_le_u32(region, 160)?,
            ],
        })
    }

    /// Serialize into a zeroed block buffer.
    pub fn encode_into(&self, block: &mut [u8]) {
        block.fill(0);
        put_le_u32(block, 0, self.magic);
        put_le_u32(block, 4, self.nr_blocks);
        put_le_u32(block, 8, self.nr_inodes);
        put_le_u32(block, 12, self.nr_istore_blocks);
        put_le_u32(block, 16, self.nr_ifree_blocks);
        put_le_u32(block, 20, self.nr_bfree_blocks);
        put_le_u32(block, 24, self.nr_free_inodes);
        put_le_u32(block, 28, self.nr_free_blocks);
        put_le_u32(block, 32, self.version);
        put_le_u32(block, 36, self.comp_default_algo);
        put_le_u32(block, 40, self.comp_enabled);
        put_le_u32(block, 44, self.comp_min_block_size);
        put_le_u32(block, 48, self.comp_features);
        put_le_u32(block, 52, self.max_extent_blocks);
        put_le_u32(block, 56, self.max_extent_blocks_large);
        put_le_u32(block, 60, self.enc_enabled);
        put_le_u32(block, 64, self.enc_default_algo);
        put_le_u32(block, 68, self.enc_kdf_algo);
        put_le_u32(block, 72, self.enc_kdf_iterations);
        put_le_u32(block, 76, self.enc_kdf_memory);
        put_le_u32(block, 80, self.enc_kdf_parallelism);
        block[84..116].copy_from_slice(&self.enc_salt);
        block[116..148].copy_from_slice(&self.enc_master_key);
        put_le_u32(block, 148, self.enc_features);
        put_le_u32(block, 152, self.reserved[0]);
        put_le_u32(block, 156, self.reserved[1]);
        put_le_u32(block, 160, self.reserved[2]);
    }

    /// First block of the inode store.
    #[must_use]
    pub fn inode_store_start(&self) -> u32 {
        1
    }

    /// First block of the inode bitmap.
    #[must_use]
    pub fn ifree_bitmap_start(&self) -> u32 {
        self.inode_store_start() + self.nr_istore_blocks
    }

    /// First block of the block bitmap.
    #[must_use]
    pub fn bfree_bitmap_start(&self) -> u32 {
        self.ifree_bitmap_start() + self.nr_ifree_blocks
    }

    /// First data block.
    #[must_use]
    pub fn data_block_start(&self) -> u32 {
        self.bfree_bitmap_start() + self.nr_bfree_blocks
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// A 72-byte inode record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub i_mode: u32,
    pub i_uid: u32,
    pub i_gid: u32,
    pub i_size: u32,
    pub i_ctime: u32,
    pub i_atime: u32,
    pub i_mtime: u32,
    pub i_blocks: u32,
    pub i_nlink: u32,
    /// Block holding this inode's extent index. 0 for inline symlinks.
    pub ei_block: u32,
    /// Block holding this inode's xattr index. 0 when no xattrs are set.
    pub xattr_block: u32,
    /// Inline data area; holds the NUL-terminated symlink target.
    pub i_data: [u8; 28],
}

impl Inode {
    pub const SIZE: usize = INODE_SIZE;

    /// An all-zero record, as stored for unallocated inodes.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            i_mode: 0,
            i_uid: 0,
            i_gid: 0,
            i_size: 0,
            i_ctime: 0,
            i_atime: 0,
            i_mtime: 0,
            i_blocks: 0,
            i_nlink: 0,
            ei_block: 0,
            xattr_block: 0,
            i_data: [0; 28],
        }
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            i_mode: read_le_u32(raw, 0)?,
            i_uid: read_le_u32(raw, 4)?,
            i_gid: read_le_u32(raw, 8)?,
            i_size: read_le_u32(raw, 12)?,
            i_ctime: read_le_u32(raw, 16)?,
            i_atime: read_le_u32(raw, 20)?,
            i_mtime: read_le_u32(raw, 24)?,
            i_blocks: read_le_u32(raw, 28)?,
            i_nlink: read_le_u32(raw, 32)?,
            ei_block: read_le_u32(raw, 36)?,
            xattr_block: read_le_u32(raw, 40)?,
            i_data: read_fixed::<28>(raw, 44)?,
        })
    }

    pub fn encode_into(&self, raw: &mut [u8]) {
        put_le_u32(raw, 0, self.i_mode);
        put_le_u32(raw, 4, self.i_uid);
        put_le_u32(raw, 8, self.i_gid);
        put_le_u32(raw, 12, self.i_size);
        put_le_u32(raw, 16, self.i_ctime);
        put_le_u32(raw, 20, self.i_atime);
        put_le_u32(raw, 24, self.i_mtime);
        put_le_u32(raw, 28, self.i_blocks);
        put_le_u32(raw, 32, self.i_nlink);
        put_le_u32(raw, 36, self.ei_block);
        put_le_u32(raw, 40, self.xattr_block);
        raw[44..72].copy_from_slice(&self.i_data);
    }

    /// File kind from the mode bits; `None` for unknown type bits.
    #[must_use]
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.i_mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == lolfs_types::S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.i_mode & S_IFMT == lolfs_types::S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.i_mode & S_IFMT == lolfs_types::S_IFLNK
    }

    /// Inline symlink target, up to the NUL terminator.
    #[must_use]
    pub fn symlink_target(&self) -> String {
        trim_nul_padded(&self.i_data)
    }
}

// ── Extent ──────────────────────────────────────────────────────────────────

/// One 24-byte extent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Extent {
    /// First logical block the extent covers.
    pub ee_block: u32,
    /// Number of blocks covered.
    pub ee_len: u32,
    /// First physical block. 0 marks an unused slot.
    pub ee_start: u32,
    pub ee_comp_algo: u16,
    pub ee_enc_algo: u8,
    pub ee_flags: u16,
    /// Per-block metadata block, 0 when absent.
    pub ee_meta: u32,
}

impl Extent {
    pub const SIZE: usize = EXTENT_SIZE;

    /// Unused slots have a zero physical start.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.ee_start == 0
    }

    #[must_use]
    pub fn contains(&self, logical: u32) -> bool {
        !self.is_unused() && logical >= self.ee_block && logical < self.ee_block + self.ee_len
    }

    /// Physical block backing `logical`, if covered.
    #[must_use]
    pub fn physical_for(&self, logical: u32) -> Option<u32> {
        self.contains(logical)
            .then(|| self.ee_start + (logical - self.ee_block))
    }

    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            ee_block: read_le_u32(raw, 0)?,
            ee_len: read_le_u32(raw, 4)?,
            ee_start: read_le_u32(raw, 8)?,
            ee_comp_algo: read_le_u16(raw, 12)?,
            ee_enc_algo: lolfs_types::ensure_slice(raw, 14, 1)?[0],
            ee_flags: read_le_u16(raw, 16)?,
            ee_meta: read_le_u32(raw, 20)?,
        })
    }

    pub fn encode_into(&self, raw: &mut [u8]) {
        put_le_u32(raw, 0, self.ee_block);
        put_le_u32(raw, 4, self.ee_len);
        put_le_u32(raw, 8, self.ee_start);
        put_le_u16(raw, 12, self.ee_comp_algo);
        raw[14] = self.ee_enc_algo;
        raw[15] = 0;
        put_le_u16(raw, 16, self.ee_flags);
        put_le_u16(raw, 18, 0);
        put_le_u32(raw, 20, self.ee_meta);
    }
}

// ── Extent index block ──────────────────────────────────────────────────────

/// A 4 KiB extent index block: directory entry count, then 170 extents in
/// ascending logical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentIndex {
    /// Live entry count for directories; unused (zero) for files.
    pub nr_files: u32,
    /// Always exactly `MAX_EXTENTS` entries.
    pub extents: Vec<Extent>,
}

impl ExtentIndex {
    /// A fresh, empty index block.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            nr_files: 0,
            extents: vec![Extent::default(); MAX_EXTENTS],
        }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let nr_files = read_le_u32(block, 0)?;
        let mut extents = Vec::with_capacity(MAX_EXTENTS);
        for i in 0..MAX_EXTENTS {
            let raw = lolfs_types::ensure_slice(block, 4 + i * EXTENT_SIZE, EXTENT_SIZE)?;
            extents.push(Extent::parse(raw)?);
        }
        Ok(Self { nr_files, extents })
    }

    /// Serialize into a zeroed block buffer.
    pub fn encode_into(&self, block: &mut [u8]) {
        block.fill(0);
        put_le_u32(block, 0, self.nr_files);
        for (i, extent) in self.extents.iter().take(MAX_EXTENTS).enumerate() {
            extent.encode_into(&mut block[4 + i * EXTENT_SIZE..4 + (i + 1) * EXTENT_SIZE]);
        }
    }

    /// Number of leading used slots.
    #[must_use]
    pub fn count_used(&self) -> usize {
        self.extents.iter().take_while(|e| !e.is_unused()).count()
    }

    /// Total data blocks covered by used extents.
    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.extents
            .iter()
            .take_while(|e| !e.is_unused())
            .map(|e| e.ee_len)
            .sum()
    }
}

// ── Directory entry ─────────────────────────────────────────────────────────

/// A fixed-width directory entry: child inode plus NUL-padded name.
/// Inode 0 in the first slot of a block terminates that block's scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
}

impl DirEntry {
    pub const SIZE: usize = DIR_ENTRY_SIZE;

    /// Parse the entry at `offset`; `None` when the slot is empty.
    #[must_use]
    pub fn parse_at(block: &[u8], offset: usize) -> Option<Self> {
        let raw = block.get(offset..offset + Self::SIZE)?;
        let inode = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let name = trim_nul_padded(&raw[4..]);
        if inode == 0 && name.is_empty() {
            return None;
        }
        Some(Self { inode, name })
    }

    /// Serialize into the 259-byte slot at `offset`.
    pub fn encode_at(&self, block: &mut [u8], offset: usize) {
        let raw = &mut block[offset..offset + Self::SIZE];
        raw.fill(0);
        raw[0..4].copy_from_slice(&self.inode.to_le_bytes());
        let name = self.name.as_bytes();
        let len = name.len().min(FILENAME_LEN);
        raw[4..4 + len].copy_from_slice(&name[..len]);
    }
}

// ── Xattr structures ────────────────────────────────────────────────────────

/// Xattr namespaces, stored as a one-byte tag in each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XattrNamespace {
    User = 0,
    Trusted = 1,
    System = 2,
    Security = 3,
}

impl XattrNamespace {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::User),
            1 => Some(Self::Trusted),
            2 => Some(Self::System),
            3 => Some(Self::Security),
            _ => None,
        }
    }

    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::User => "user.",
            Self::Trusted => "trusted.",
            Self::System => "system.",
            Self::Security => "security.",
        }
    }

    /// Split a fully-qualified name into `(namespace, base name)`.
    #[must_use]
    pub fn split(name: &str) -> Option<(Self, &str)> {
        for ns in [Self::User, Self::Trusted, Self::System, Self::Security] {
            if let Some(base) = name.strip_prefix(ns.prefix()) {
                return Some((ns, base));
            }
        }
        None
    }
}

/// The header of an inode's xattr index block, followed by an extent array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrIndex {
    /// Bytes of packed entry data stored in the data extents.
    pub total_size: u32,
    /// Number of entries.
    pub count: u32,
    /// Always exactly `MAX_EXTENTS` entries.
    pub extents: Vec<Extent>,
}

impl XattrIndex {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            total_size: 0,
            count: 0,
            extents: vec![Extent::default(); MAX_EXTENTS],
        }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let total_size = read_le_u32(block, 0)?;
        let count = read_le_u32(block, 4)?;
        let mut extents = Vec::with_capacity(MAX_EXTENTS);
        for i in 0..MAX_EXTENTS {
            let raw = lolfs_types::ensure_slice(block, 8 + i * EXTENT_SIZE, EXTENT_SIZE)?;
            extents.push(Extent::parse(raw)?);
        }
        Ok(Self {
            total_size,
            count,
            extents,
        })
    }

    pub fn encode_into(&self, block: &mut [u8]) {
        block.fill(0);
        put_le_u32(block, 0, self.total_size);
        put_le_u32(block, 4, self.count);
        for (i, extent) in self.extents.iter().take(MAX_EXTENTS).enumerate() {
            extent.encode_into(&mut block[8 + i * EXTENT_SIZE..8 + (i + 1) * EXTENT_SIZE]);
        }
    }

    #[must_use]
    pub fn count_used_extents(&self) -> usize {
        self.extents.iter().take_while(|e| !e.is_unused()).count()
    }
}

/// One decoded xattr entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrEntry {
    pub namespace: XattrNamespace,
    pub name: String,
    pub value: Vec<u8>,
}

impl XattrEntry {
    /// Fully-qualified name, e.g. `user.origin`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}{}", self.namespace.prefix(), self.name)
    }
}

const XATTR_HEADER_LEN: usize = 12;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Bytes one entry occupies in the packed region.
#[must_use]
pub fn xattr_entry_size(name_len: usize, value_len: usize) -> usize {
    align4(XATTR_HEADER_LEN + name_len) + align4(value_len)
}

/// Decode `count` packed entries from the xattr data region.
pub fn parse_xattr_entries(data: &[u8], count: u32) -> Result<Vec<XattrEntry>, ParseError> {
    let mut entries = Vec::with_capacity(count as usize);
    let mut offset = 0_usize;

    for _ in 0..count {
        let name_len = usize::from(lolfs_types::ensure_slice(data, offset, 1)?[0]);
        let ns_raw = lolfs_types::ensure_slice(data, offset + 1, 1)?[0];
        let value_len = usize::from(read_le_u16(data, offset + 2)?);
        let value_offset = read_le_u32(data, offset + 4)? as usize;

        let namespace = XattrNamespace::from_raw(ns_raw).ok_or(ParseError::InvalidField {
            field: "name_index",
            reason: "unknown namespace tag",
        })?;
        let name_bytes = lolfs_types::ensure_slice(data, offset + XATTR_HEADER_LEN, name_len)?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();
        let value = lolfs_types::ensure_slice(data, offset + value_offset, value_len)?.to_vec();

        entries.push(XattrEntry {
            namespace,
            name,
            value,
        });
        offset += xattr_entry_size(name_len, value_len);
    }

    Ok(entries)
}

/// Pack entries into a contiguous region (4-byte aligned records).
#[must_use]
pub fn serialize_xattr_entries(entries: &[XattrEntry]) -> Vec<u8> {
    let total: usize = entries
        .iter()
        .map(|e| xattr_entry_size(e.name.len(), e.value.len()))
        .sum();
    let mut data = vec![0_u8; total];
    let mut offset = 0_usize;

    for entry in entries {
        let name = entry.name.as_bytes();
        let value_offset = align4(XATTR_HEADER_LEN + name.len());
        data[offset] = name.len() as u8;
        data[offset + 1] = entry.namespace as u8;
        put_le_u16(&mut data, offset + 2, entry.value.len() as u16);
        put_le_u32(&mut data, offset + 4, value_offset as u32);
        data[offset + XATTR_HEADER_LEN..offset + XATTR_HEADER_LEN + name.len()]
            .copy_from_slice(name);
        data[offset + value_offset..offset + value_offset + entry.value.len()]
            .copy_from_slice(&entry.value);
        offset += xattr_entry_size(name.len(), entry.value.len());
    }

    data
}

// ── Compression metadata block ──────────────────────────────────────────────

/// Per-block compression record: stored size of the compressed payload
/// (0 = the block is raw) plus an optional algorithm override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompBlockMeta {
    pub comp_size: u16,
    pub comp_algo: u8,
    pub flags: u8,
}

/// The one-block metadata table an extent's `ee_meta` points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompMeta {
    pub nr_blocks: u32,
    /// Always exactly `META_ENTRIES_PER_BLOCK` records.
    pub entries: Vec<CompBlockMeta>,
}

impl CompMeta {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            nr_blocks: 0,
            entries: vec![CompBlockMeta::default(); META_ENTRIES_PER_BLOCK as usize],
        }
    }

    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(block, 0)?;
        if magic != COMP_META_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: COMP_META_MAGIC,
                actual: magic,
            });
        }
        let nr_blocks = read_le_u32(block, 4)?;
        let mut entries = Vec::with_capacity(META_ENTRIES_PER_BLOCK as usize);
        for i in 0..META_ENTRIES_PER_BLOCK as usize {
            let off = 8 + i * 4;
            entries.push(CompBlockMeta {
                comp_size: read_le_u16(block, off)?,
                comp_algo: lolfs_types::ensure_slice(block, off + 2, 1)?[0],
                flags: lolfs_types::ensure_slice(block, off + 3, 1)?[0],
            });
        }
        Ok(Self { nr_blocks, entries })
    }

    pub fn encode_into(&self, block: &mut [u8]) {
        block.fill(0);
        put_le_u32(block, 0, COMP_META_MAGIC);
        put_le_u32(block, 4, self.nr_blocks);
        for (i, entry) in self
            .entries
            .iter()
            .take(META_ENTRIES_PER_BLOCK as usize)
            .enumerate()
        {
            let off = 8 + i * 4;
            put_le_u16(block, off, entry.comp_size);
            block[off + 2] = entry.comp_algo;
            block[off + 3] = entry.flags;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lolfs_types::BLOCK_SIZE;
    use proptest::prelude::*;

    fn block_buf() -> Vec<u8> {
        vec![0_u8; BLOCK_SIZE as usize]
    }

    fn sample_superblock() -> Superblock {
        Superblock {
            magic: LOLFS_MAGIC,
            nr_blocks: 51_200,
            nr_inodes: 51_240,
            nr_istore_blocks: 915,
            nr_ifree_blocks: 2,
            nr_bfree_blocks: 2,
            nr_free_inodes: 51_239,
            nr_free_blocks: 50_279,
            version: 1,
            comp_default_algo: 1,
            comp_enabled: 1,
            comp_min_block_size: 128,
            comp_features: lolfs_types::FEATURE_LARGE_EXTENTS,
            max_extent_blocks: lolfs_types::MAX_BLOCKS_PER_EXTENT,
            max_extent_blocks_large: lolfs_types::MAX_BLOCKS_PER_EXTENT_LARGE,
            enc_enabled: 1,
            enc_default_algo: 1,
            enc_kdf_algo: 2,
            enc_kdf_iterations: 100_000,
            enc_kdf_memory: 65_536,
            enc_kdf_parallelism: 4,
            enc_salt: [0x5A; 32],
            enc_master_key: [0xA5; 32],
            enc_features: 0,
            reserved: [0; 3],
        }
    }

    #[test]
    fn superblock_round_trip() {
        let sb = sample_superblock();
        let mut block = block_buf();
        sb.encode_into(&mut block);
        assert_eq!(Superblock::parse(&block).unwrap(), sb);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut block = block_buf();
        sample_superblock().encode_into(&mut block);
        block[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&block),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_region_offsets() {
        let sb = sample_superblock();
        assert_eq!(sb.inode_store_start(), 1);
        assert_eq!(sb.ifree_bitmap_start(), 916);
        assert_eq!(sb.bfree_bitmap_start(), 918);
        assert_eq!(sb.data_block_start(), 920);
    }

    #[test]
    fn inode_round_trip() {
        let mut target = [0_u8; 28];
        target[..4].copy_from_slice(b"/tmp");
        let inode = Inode {
            i_mode: lolfs_types::S_IFLNK | 0o777,
            i_uid: 1000,
            i_gid: 1000,
            i_size: 4,
            i_ctime: 1,
            i_atime: 2,
            i_mtime: 3,
            i_blocks: 0,
            i_nlink: 1,
            ei_block: 0,
            xattr_block: 0,
            i_data: target,
        };
        let mut raw = [0_u8; INODE_SIZE];
        inode.encode_into(&mut raw);
        let parsed = Inode::parse(&raw).unwrap();
        assert_eq!(parsed, inode);
        assert!(parsed.is_symlink());
        assert_eq!(parsed.symlink_target(), "/tmp");
    }

    #[test]
    fn extent_round_trip_preserves_fields() {
        let extent = Extent {
            ee_block: 10,
            ee_len: 4,
            ee_start: 2048,
            ee_comp_algo: 1,
            ee_enc_algo: 1,
            ee_flags: lolfs_types::EXT_COMPRESSED | lolfs_types::EXT_ENCRYPTED,
            ee_meta: 2052,
        };
        let mut raw = [0_u8; EXTENT_SIZE];
        extent.encode_into(&mut raw);
        assert_eq!(Extent::parse(&raw).unwrap(), extent);
    }

    #[test]
    fn extent_physical_mapping() {
        let extent = Extent {
            ee_block: 8,
            ee_len: 4,
            ee_start: 100,
            ..Extent::default()
        };
        assert_eq!(extent.physical_for(8), Some(100));
        assert_eq!(extent.physical_for(11), Some(103));
        assert_eq!(extent.physical_for(12), None);
        assert_eq!(extent.physical_for(7), None);
    }

    #[test]
    fn extent_index_round_trip() {
        let mut index = ExtentIndex::empty();
        index.nr_files = 3;
        index.extents[0] = Extent {
            ee_block: 0,
            ee_len: 2,
            ee_start: 920,
            ..Extent::default()
        };
        index.extents[1] = Extent {
            ee_block: 2,
            ee_len: 4,
            ee_start: 930,
            ..Extent::default()
        };
        let mut block = block_buf();
        index.encode_into(&mut block);
        let parsed = ExtentIndex::parse(&block).unwrap();
        assert_eq!(parsed, index);
        assert_eq!(parsed.count_used(), 2);
        assert_eq!(parsed.total_blocks(), 6);
    }

    #[test]
    fn dir_entry_round_trip() {
        let mut block = block_buf();
        let entry = DirEntry {
            inode: 42,
            name: "hello.txt".into(),
        };
        entry.encode_at(&mut block, DIR_ENTRY_SIZE);
        assert_eq!(DirEntry::parse_at(&block, DIR_ENTRY_SIZE), Some(entry));
        assert_eq!(DirEntry::parse_at(&block, 0), None);
    }

    #[test]
    fn dir_entry_name_is_truncated_to_capacity() {
        let mut block = block_buf();
        let entry = DirEntry {
            inode: 7,
            name: "x".repeat(400),
        };
        entry.encode_at(&mut block, 0);
        let parsed = DirEntry::parse_at(&block, 0).unwrap();
        assert_eq!(parsed.name.len(), FILENAME_LEN);
    }

    #[test]
    fn xattr_namespace_split() {
        assert_eq!(
            XattrNamespace::split("user.origin"),
            Some((XattrNamespace::User, "origin"))
        );
        assert_eq!(
            XattrNamespace::split("security.selinux"),
            Some((XattrNamespace::Security, "selinux"))
        );
        assert_eq!(XattrNamespace::split("bogus.name"), None);
    }

    #[test]
    fn xattr_entries_round_trip() {
        let entries = vec![
            XattrEntry {
                namespace: XattrNamespace::User,
                name: "origin".into(),
                value: b"https://example.com".to_vec(),
            },
            XattrEntry {
                namespace: XattrNamespace::Trusted,
                name: "checksum".into(),
                value: vec![0xAB; 13],
            },
        ];
        let data = serialize_xattr_entries(&entries);
        assert_eq!(data.len() % 4, 0);
        let parsed = parse_xattr_entries(&data, 2).unwrap();
        assert_eq!(parsed, entries);
        assert_eq!(parsed[0].full_name(), "user.origin");
    }

    #[test]
    fn xattr_index_round_trip() {
        let mut index = XattrIndex::empty();
        index.total_size = 128;
        index.count = 2;
        index.extents[0] = Extent {
            ee_block: 0,
            ee_len: 1,
            ee_start: 999,
            ..Extent::default()
        };
        let mut block = block_buf();
        index.encode_into(&mut block);
        assert_eq!(XattrIndex::parse(&block).unwrap(), index);
    }

    #[test]
    fn comp_meta_round_trip() {
        let mut meta = CompMeta::empty();
        meta.nr_blocks = 2;
        meta.entries[0] = CompBlockMeta {
            comp_size: 812,
            comp_algo: 1,
            flags: 0,
        };
        let mut block = block_buf();
        meta.encode_into(&mut block);
        assert_eq!(CompMeta::parse(&block).unwrap(), meta);
    }

    #[test]
    fn comp_meta_rejects_bad_magic() {
        let block = block_buf();
        assert!(CompMeta::parse(&block).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn superblock_parse_never_panics(
            region in proptest::collection::vec(any::<u8>(), 0..=(BLOCK_SIZE as usize)),
        ) {
            let _ = Superblock::parse(&region);
        }

        #[test]
        fn inode_parse_never_panics(
            raw in proptest::collection::vec(any::<u8>(), 0..=INODE_SIZE * 2),
        ) {
            let _ = Inode::parse(&raw);
        }

        #[test]
        fn xattr_parse_never_panics(
            data in proptest::collection::vec(any::<u8>(), 0..256),
            count in 0_u32..8,
        ) {
            let _ = parse_xattr_entries(&data, count);
        }
    }
}
