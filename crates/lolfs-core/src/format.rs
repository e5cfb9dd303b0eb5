//! Image formatting (mkfs).
//!
//! Computes the region layout by ceiling division, writes the superblock,
//! seeds the inode store with the root directory, initializes both
//! bitmaps, and optionally generates and wraps a master key.

use crate::{FsState, Lolfs};
use lolfs_alloc::Allocator;
use lolfs_block::{BlockIo, ByteDevice, FileByteDevice};
use lolfs_error::{LolfsError, Result};
use lolfs_keys::KeyManager;
use lolfs_ondisk::{ExtentIndex, Inode, Superblock};
use lolfs_types::{
    div_ceil_u32, BITS_PER_BLOCK, BLOCK_SIZE, BlockNo, CompAlgo, EncAlgo, FEATURE_LARGE_EXTENTS,
    InodeNo, KdfAlgo, LOLFS_MAGIC, LOLFS_VERSION, MAX_BLOCKS_PER_EXTENT,
    MAX_BLOCKS_PER_EXTENT_LARGE, MIN_BLOCKS, INODES_PER_BLOCK, S_IFDIR,
};
use parking_lot::Mutex;
use std::path::Path;
use tracing::info;

/// Options accepted by `format`.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub compression: CompAlgo,
    pub encryption: EncAlgo,
    pub kdf_iterations: u32,
    pub password: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            compression: CompAlgo::None,
            encryption: EncAlgo::None,
            kdf_iterations: 100_000,
            password: None,
        }
    }
}

impl Lolfs {
    /// Create a fresh image file of `size` bytes and format it.
    pub fn format_path(path: impl AsRef<Path>, size: u64, opts: &FormatOptions) -> Result<Self> {
        let dev = FileByteDevice::create(path, size)?;
        Self::format_device(Box::new(dev), 0, opts)
    }

    /// Format the image held by `dev`, with the superblock at byte
    /// offset `base`. Returns an open handle; an encrypted filesystem is
    /// implicitly unlocked for its creator.
    pub fn format_device(
        dev: Box<dyn ByteDevice>,
        base: u64,
        opts: &FormatOptions,
    ) -> Result<Self> {
        let io = BlockIo::new(dev, base)?;
        let nr_blocks = io.block_count();
        if nr_blocks < MIN_BLOCKS {
            return Err(LolfsError::Format(format!(
                "image too small: {nr_blocks} blocks (minimum {MIN_BLOCKS})"
            )));
        }
        if opts.encryption == EncAlgo::ChaCha20Poly1305 {
            return Err(LolfsError::Unsupported(
                "chacha20-poly1305 needs 16 tag bytes per block that the data-block layout \
                 does not reserve"
                    .into(),
            ));
        }
        if opts.encryption != EncAlgo::None && opts.password.is_none() {
            return Err(LolfsError::Format(
                "encryption requires a password".into(),
            ));
        }

        // Region layout by ceiling division.
        let mut nr_inodes = nr_blocks;
        let excess = nr_inodes % INODES_PER_BLOCK;
        if excess != 0 {
            nr_inodes += INODES_PER_BLOCK - excess;
        }
        let nr_istore_blocks = div_ceil_u32(nr_inodes, INODES_PER_BLOCK);
        let nr_ifree_blocks = div_ceil_u32(nr_inodes, BITS_PER_BLOCK);
        let nr_bfree_blocks = div_ceil_u32(nr_blocks, BITS_PER_BLOCK);
        let metadata = 1 + nr_istore_blocks + nr_ifree_blocks + nr_bfree_blocks;
        let Some(nr_data_blocks) = nr_blocks.checked_sub(metadata) else {
            return Err(LolfsError::Format(
                "image too small for its own metadata".into(),
            ));
        };
        if nr_data_blocks < 2 {
            return Err(LolfsError::Format(
                "image leaves no room for data blocks".into(),
            ));
        }

        // Encryption seeding: random salt and master key, key wrapped
        // under the PBKDF2-derived user key.
        let encrypted = opts.encryption != EncAlgo::None;
        let (salt, wrapped, master, kdf, iterations) = if encrypted {
            let salt = lolfs_keys::generate_salt();
            let master = lolfs_keys::generate_master_key();
            let iterations = opts.kdf_iterations.max(1);
            let password = opts.password.as_deref().unwrap_or_default();
            let user_key = lolfs_keys::derive_user_key(password.as_bytes(), &salt, iterations);
            let wrapped = lolfs_keys::wrap_master_key(&master, &user_key);
            (salt, wrapped, master, KdfAlgo::Pbkdf2, iterations)
        } else {
            ([0; 32], [0; 32], [0; 32], KdfAlgo::None, 0)
        };

        let sb = Superblock {
            magic: LOLFS_MAGIC,
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
            nr_free_inodes: nr_inodes - 1,
            nr_free_blocks: nr_data_blocks - 1,
            version: LOLFS_VERSION,
            comp_default_algo: opts.compression.as_raw(),
            comp_enabled: u32::from(opts.compression != CompAlgo::None),
            comp_min_block_size: 128,
            comp_features: FEATURE_LARGE_EXTENTS,
            max_extent_blocks: MAX_BLOCKS_PER_EXTENT,
            max_extent_blocks_large: MAX_BLOCKS_PER_EXTENT_LARGE,
            enc_enabled: u32::from(encrypted),
            enc_default_algo: opts.encryption.as_raw(),
            enc_kdf_algo: kdf.as_raw(),
            enc_kdf_iterations: iterations,
            enc_kdf_memory: 65_536,
            enc_kdf_parallelism: 4,
            enc_salt: salt,
            enc_master_key: wrapped,
            enc_features: 0,
            reserved: [0; 3],
        };

        write_layout(&io, &sb)?;
        info!(
            target: "lolfs::format",
            blocks = nr_blocks,
            inodes = nr_inodes,
            istore = nr_istore_blocks,
            compression = %opts.compression,
            encryption = %opts.encryption,
            "formatted filesystem"
        );

        let alloc = Allocator::load(&io, &sb)?;
        let keys = KeyManager::unlocked_creator(&sb, master);
        Ok(Self {
            io,
            state: Mutex::new(FsState { sb, alloc }),
            keys: Mutex::new(keys),
        })
    }
}

/// Write superblock, inode store, both bitmaps and the root directory's
/// extent index block.
fn write_layout(io: &BlockIo, sb: &Superblock) -> Result<()> {
    let mut block = vec![0_u8; BLOCK_SIZE as usize];

    // Superblock.
    sb.encode_into(&mut block);
    io.write_block(BlockNo(0), &block)?;

    // Inode store: the root inode in the first record, the rest zeroed.
    let data_start = sb.data_block_start();
    let root = Inode {
        i_mode: S_IFDIR | 0o755,
        i_uid: 0,
        i_gid: 0,
        i_size: BLOCK_SIZE,
        i_ctime: crate::now_secs(),
        i_atime: crate::now_secs(),
        i_mtime: crate::now_secs(),
        i_blocks: 1,
        i_nlink: 2,
        ei_block: data_start,
        xattr_block: 0,
        i_data: [0; 28],
    };
    block.fill(0);
    root.encode_into(&mut block[..Inode::SIZE]);
    io.write_block(BlockNo(sb.inode_store_start()), &block)?;
    block.fill(0);
    for b in 1..sb.nr_istore_blocks {
        io.write_block(BlockNo(sb.inode_store_start() + b), &block)?;
    }

    // Inode bitmap: everything free except the root inode.
    let mut bitmap = vec![0xFF_u8; BLOCK_SIZE as usize];
    lolfs_alloc::bitmap_clear(&mut bitmap, InodeNo::ROOT.0);
    io.write_block(BlockNo(sb.ifree_bitmap_start()), &bitmap)?;
    bitmap.fill(0xFF);
    for b in 1..sb.nr_ifree_blocks {
        io.write_block(BlockNo(sb.ifree_bitmap_start() + b), &bitmap)?;
    }

    // Block bitmap: the metadata region and the root's index block are
    // used; bits past the end of the image are pinned used as well.
    for b in 0..sb.nr_bfree_blocks {
        bitmap.fill(0xFF);
        let bit_base = b * BITS_PER_BLOCK;
        for bit in 0..BITS_PER_BLOCK {
            let block_num = bit_base + bit;
            if block_num <= data_start || block_num >= sb.nr_blocks {
                lolfs_alloc::bitmap_clear(&mut bitmap, bit);
            }
        }
        io.write_block(BlockNo(sb.bfree_bitmap_start() + b), &bitmap)?;
    }

    // Root directory: an empty extent index block.
    ExtentIndex::empty().encode_into(&mut block);
    io.write_block(BlockNo(data_start), &block)?;

    Ok(())
}
