#![forbid(unsafe_code)]
//! Shared constants and primitive types for the lolfs on-disk format.
//!
//! Everything here is dependency-light on purpose: the layout constants,
//! the tagged algorithm identifiers, little-endian field codecs and the
//! unit-carrying number wrappers used across the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ── Identity ────────────────────────────────────────────────────────────────

/// Filesystem magic, stored in the first 4 bytes of the superblock.
pub const LOLFS_MAGIC: u32 = 0x101E_1FF5;

/// Current on-disk format version.
pub const LOLFS_VERSION: u32 = 1;

/// Name of the host container section holding an embedded image.
pub const LOLFS_SECTION: &str = ".lolfs.super";

// ── Geometry ────────────────────────────────────────────────────────────────

/// Logical block size in bytes.
pub const BLOCK_SIZE: u32 = 4096;

/// Bits held by one bitmap block.
pub const BITS_PER_BLOCK: u32 = BLOCK_SIZE * 8;

/// On-disk inode record size in bytes.
pub const INODE_SIZE: usize = 72;

/// Inode records per block (4096 / 72).
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_SIZE as u32;

/// On-disk extent record size in bytes.
pub const EXTENT_SIZE: usize = 24;

/// Extents per index block: one u32 header, then the extent array.
pub const MAX_EXTENTS: usize = (BLOCK_SIZE as usize - 4) / EXTENT_SIZE;

/// Upper bound on `ee_len` for any extent.
pub const MAX_BLOCKS_PER_EXTENT: u32 = 2048;

/// Upper bound on `ee_len` for extents that carry no per-block metadata.
pub const MAX_BLOCKS_PER_EXTENT_LARGE: u32 = 524_288;

/// Longest file name, excluding the NUL terminator.
pub const FILENAME_LEN: usize = 255;

/// On-disk directory entry size: u32 inode + NUL-padded name.
pub const DIR_ENTRY_SIZE: usize = 4 + FILENAME_LEN;

/// Directory entries per block.
pub const FILES_PER_BLOCK: u32 = BLOCK_SIZE / DIR_ENTRY_SIZE as u32;

/// Largest representable file in bytes.
pub const MAX_FILESIZE: u64 =
    MAX_BLOCKS_PER_EXTENT as u64 * MAX_EXTENTS as u64 * BLOCK_SIZE as u64;

/// Inline symlink target capacity (one byte reserved for the NUL).
pub const INLINE_TARGET_MAX: usize = 27;

/// Smallest image we will format, in blocks.
pub const MIN_BLOCKS: u32 = 100;

/// The root directory inode number.
pub const ROOT_INO: u32 = 0;

// ── Xattr limits ────────────────────────────────────────────────────────────

pub const XATTR_NAME_MAX: usize = 255;
pub const XATTR_VALUE_MAX: usize = 65_535;

// ── Compression metadata block ──────────────────────────────────────────────

/// Magic of a per-extent compression metadata block.
pub const COMP_META_MAGIC: u32 = 0xC04F_FEE5;

/// Per-block records held by one metadata block (8-byte header, 4-byte
/// records). Extents carrying metadata are capped to this length.
pub const META_ENTRIES_PER_BLOCK: u32 = (BLOCK_SIZE - 8) / 4;

// ── Feature bits ────────────────────────────────────────────────────────────

/// `comp_features`: extents without metadata may use the large length bound.
pub const FEATURE_LARGE_EXTENTS: u32 = 0x0001;

// ── Extent flags ────────────────────────────────────────────────────────────

/// At least one block of the extent is stored compressed.
pub const EXT_COMPRESSED: u16 = 0x0001;
/// The extent's blocks are encrypted.
pub const EXT_ENCRYPTED: u16 = 0x0002;
/// `ee_meta` points at a per-block metadata block.
pub const EXT_HAS_META: u16 = 0x0004;
/// Compressed and raw blocks coexist within the extent.
pub const EXT_MIXED: u16 = 0x0008;

// ── POSIX mode bits ─────────────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;

/// File kind, lifted out of the raw mode bits at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    /// Classify a raw mode value; `None` for unknown type bits.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    /// The type bits for this kind.
    #[must_use]
    pub fn to_mode_bits(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
        }
    }
}

// ── Algorithm identifiers ───────────────────────────────────────────────────

/// Per-block compression algorithm ids as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompAlgo {
    #[default]
    None = 0,
    Lz4 = 1,
    Zlib = 2,
    Zstd = 3,
}

impl CompAlgo {
    /// Decode an on-disk id.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Lz4),
            2 => Some(Self::Zlib),
            3 => Some(Self::Zstd),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "lz4" => Ok(Self::Lz4),
            "zlib" => Ok(Self::Zlib),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!("unknown compression algorithm: {other}")),
        }
    }
}

/// Per-block encryption algorithm ids as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncAlgo {
    #[default]
    #[serde(rename = "none")]
    None = 0,
    #[serde(rename = "aes-256-xts")]
    Aes256Xts = 1,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305 = 2,
}

impl EncAlgo {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Aes256Xts),
            2 => Some(Self::ChaCha20Poly1305),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Aes256Xts => "aes-256-xts",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Authentication tag bytes appended by AEAD modes.
    #[must_use]
    pub fn tag_size(self) -> usize {
        match self {
            Self::ChaCha20Poly1305 => 16,
            _ => 0,
        }
    }
}

impl fmt::Display for EncAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncAlgo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "aes-256-xts" | "aes256-xts" => Ok(Self::Aes256Xts),
            "chacha20-poly1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(format!("unknown encryption algorithm: {other}")),
        }
    }
}

/// Key-derivation function ids as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfAlgo {
    #[default]
    None = 0,
    Argon2id = 1,
    Pbkdf2 = 2,
}

impl KdfAlgo {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Argon2id),
            2 => Some(Self::Pbkdf2),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Argon2id => "argon2id",
            Self::Pbkdf2 => "pbkdf2",
        }
    }
}

impl fmt::Display for KdfAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Unit-carrying numbers ───────────────────────────────────────────────────

/// A physical block number within the image, relative to the base offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockNo(pub u32);

impl BlockNo {
    /// Byte offset of this block within the image (before base bias).
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * u64::from(BLOCK_SIZE)
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inode number. Inode 0 is the root directory.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct InodeNo(pub u32);

impl InodeNo {
    pub const ROOT: Self = Self(ROOT_INO);
}

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Field codecs ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Write a little-endian u16. Panics if the destination is too short; the
/// serializers always work on full-size block buffers.
#[inline]
pub fn put_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a little-endian u32.
#[inline]
pub fn put_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Ceiling division for layout arithmetic.
#[must_use]
pub fn div_ceil_u32(a: u32, b: u32) -> u32 {
    a / b + u32::from(a % b != 0)
}

/// Bytes of a NUL-padded field up to the first NUL, lossily decoded.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn geometry_constants_are_consistent() {
        assert_eq!(INODES_PER_BLOCK, 56);
        assert_eq!(MAX_EXTENTS, 170);
        assert_eq!(FILES_PER_BLOCK, 15);
        assert_eq!(DIR_ENTRY_SIZE, 259);
        assert_eq!(META_ENTRIES_PER_BLOCK, 1022);
        assert_eq!(
            MAX_FILESIZE,
            2048_u64 * 170 * 4096,
        );
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(read_le_u32(&bytes, 6).is_err());
    }

    #[test]
    fn put_and_read_round_trip() {
        let mut buf = [0_u8; 8];
        put_le_u32(&mut buf, 0, 0xDEAD_BEEF);
        put_le_u16(&mut buf, 4, 0x0102);
        assert_eq!(read_le_u32(&buf, 0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u16(&buf, 4).unwrap(), 0x0102);
    }

    #[test]
    fn algo_ids_round_trip() {
        for raw in 0..4 {
            assert_eq!(CompAlgo::from_raw(raw).unwrap().as_raw(), raw);
        }
        for raw in 0..3 {
            assert_eq!(EncAlgo::from_raw(raw).unwrap().as_raw(), raw);
            assert_eq!(KdfAlgo::from_raw(raw).unwrap().as_raw(), raw);
        }
        assert_eq!(CompAlgo::from_raw(4), None);
        assert_eq!(EncAlgo::from_raw(3), None);
        assert_eq!(KdfAlgo::from_raw(3), None);
    }

    #[test]
    fn algo_names_parse_back() {
        assert_eq!("lz4".parse::<CompAlgo>().unwrap(), CompAlgo::Lz4);
        assert_eq!(
            "aes-256-xts".parse::<EncAlgo>().unwrap(),
            EncAlgo::Aes256Xts
        );
        assert_eq!(
            "aes256-xts".parse::<EncAlgo>().unwrap(),
            EncAlgo::Aes256Xts
        );
        assert!("snappy".parse::<CompAlgo>().is_err());
    }

    #[test]
    fn file_kind_from_mode() {
        assert_eq!(FileKind::from_mode(S_IFDIR | 0o755), Some(FileKind::Directory));
        assert_eq!(FileKind::from_mode(S_IFREG | 0o644), Some(FileKind::Regular));
        assert_eq!(FileKind::from_mode(S_IFLNK | 0o777), Some(FileKind::Symlink));
        assert_eq!(FileKind::from_mode(0o010_644), None);
    }

    #[test]
    fn div_ceil_edges() {
        assert_eq!(div_ceil_u32(0, 8), 0);
        assert_eq!(div_ceil_u32(1, 8), 1);
        assert_eq!(div_ceil_u32(8, 8), 1);
        assert_eq!(div_ceil_u32(9, 8), 2);
    }

    #[test]
    fn trim_nul_padded_stops_at_nul() {
        assert_eq!(trim_nul_padded(b"abc\0\0\0"), "abc");
        assert_eq!(trim_nul_padded(b"abc"), "abc");
        assert_eq!(trim_nul_padded(b"\0abc"), "");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn read_helpers_never_panic(
            data in proptest::collection::vec(any::<u8>(), 0..64),
            offset in 0_usize..128,
        ) {
            let _ = read_le_u16(&data, offset);
            let _ = read_le_u32(&data, offset);
            let _ = read_fixed::<32>(&data, offset);
        }
    }
}
