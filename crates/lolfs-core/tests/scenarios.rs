//! End-to-end scenarios over file-backed images.

use lolfs_core::{check_path, FormatOptions, Lolfs};
use lolfs_error::LolfsError;
use lolfs_ondisk::{ExtentIndex, Superblock};
use lolfs_types::{
    BLOCK_SIZE, CompAlgo, EncAlgo, EXT_COMPRESSED, EXT_ENCRYPTED, InodeNo,
};
use std::path::PathBuf;
use tempfile::TempDir;

const MIB: u64 = 1024 * 1024;

fn image_path(dir: &TempDir) -> PathBuf {
    dir.path().join("image.lolfs")
}

fn format_image(size: u64, opts: &FormatOptions) -> (TempDir, PathBuf, Lolfs) {
    let dir = TempDir::new().expect("tempdir");
    let path = image_path(&dir);
    let fs = Lolfs::format_path(&path, size, opts).expect("format");
    (dir, path, fs)
}

fn encrypted_opts(password: &str) -> FormatOptions {
    FormatOptions {
        compression: CompAlgo::None,
        encryption: EncAlgo::Aes256Xts,
        kdf_iterations: 1000,
        password: Some(password.to_owned()),
    }
}

/// Repetitive, highly compressible payload.
fn compressible_bytes(len: usize) -> Vec<u8> {
    b"The quick brown fox jumps over the lazy dog. "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ── Formatting ──────────────────────────────────────────────────────────────

#[test]
fn format_200_mib_layout() {
    let (_dir, path, fs) = format_image(200 * MIB, &FormatOptions::default());
    let stats = fs.statfs();
    assert_eq!(stats.total_blocks, 51_200);
    assert_eq!(stats.total_inodes, 51_240);
    assert_eq!(stats.free_inodes, stats.total_inodes - 1);
    fs.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    let sb = Superblock::parse(&raw[..BLOCK_SIZE as usize]).unwrap();
    assert_eq!(sb.magic, 0x101E_1FF5);
    assert_eq!(sb.nr_blocks, 51_200);
    assert_eq!(sb.nr_istore_blocks, 915);
    assert_eq!(sb.nr_ifree_blocks, 2);
    assert_eq!(sb.nr_bfree_blocks, 2);
    assert_eq!(sb.nr_free_inodes, 51_239);

    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "errors: {:?}", report.errors);
}

#[test]
fn format_then_check_across_sizes_and_options() {
    let option_sets = [
        FormatOptions::default(),
        FormatOptions {
            compression: CompAlgo::Lz4,
            ..FormatOptions::default()
        },
        FormatOptions {
            compression: CompAlgo::Zlib,
            ..FormatOptions::default()
        },
        encrypted_opts("format-check"),
    ];
    for blocks in [100_u64, 257, 1000] {
        for opts in &option_sets {
            let (_dir, path, fs) = format_image(blocks * u64::from(BLOCK_SIZE), opts);
            fs.close().unwrap();
            let report = check_path(&path).unwrap();
            assert!(
                report.is_clean(),
                "blocks={blocks} opts={opts:?}: {:?}",
                report.errors
            );
        }
    }
}

#[test]
fn format_rejects_tiny_images_and_chacha() {
    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    assert!(Lolfs::format_path(&path, 50 * u64::from(BLOCK_SIZE), &FormatOptions::default())
        .is_err());

    let chacha = FormatOptions {
        encryption: EncAlgo::ChaCha20Poly1305,
        password: Some("p".into()),
        ..FormatOptions::default()
    };
    assert!(matches!(
        Lolfs::format_path(&path, 10 * MIB, &chacha),
        Err(LolfsError::Unsupported(_))
    ));

    let missing_password = FormatOptions {
        encryption: EncAlgo::Aes256Xts,
        ..FormatOptions::default()
    };
    assert!(Lolfs::format_path(&path, 10 * MIB, &missing_password).is_err());
}

// ── Plain round trips ───────────────────────────────────────────────────────

#[test]
fn small_file_round_trip() {
    let (_dir, path, fs) = format_image(MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;

    let ino = fs.create_file(root, "a").unwrap();
    assert_eq!(fs.write(ino, 0, b"hello").unwrap(), 5);
    assert_eq!(fs.read(ino, 0, 5).unwrap(), b"hello");
    assert_eq!(fs.stat(ino).unwrap().i_size, 5);
    assert_eq!(fs.lookup(root, "a").unwrap(), ino);

    // Reads past EOF are short, reads at EOF are empty.
    assert_eq!(fs.read(ino, 2, 100).unwrap(), b"llo");
    assert_eq!(fs.read(ino, 5, 10).unwrap(), b"");

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn unaligned_overwrites_merge_with_existing_content() {
    for (compression, encryption, password) in [
        (CompAlgo::None, EncAlgo::None, None),
        (CompAlgo::Lz4, EncAlgo::None, None),
        (CompAlgo::Zlib, EncAlgo::None, None),
        (CompAlgo::None, EncAlgo::Aes256Xts, Some("pw".to_owned())),
        (CompAlgo::Lz4, EncAlgo::Aes256Xts, Some("pw".to_owned())),
        (CompAlgo::Zlib, EncAlgo::Aes256Xts, Some("pw".to_owned())),
    ] {
        let opts = FormatOptions {
            compression,
            encryption,
            kdf_iterations: 1000,
            password,
        };
        let (_dir, path, fs) = format_image(16 * MIB, &opts);
        let ino = fs.create_file(InodeNo::ROOT, "model").unwrap();

        // Reference model in memory, mutated in lockstep.
        let mut model = compressible_bytes(40_000);
        fs.write(ino, 0, &model.clone()).unwrap();

        let patch = vec![0xEE_u8; 9000];
        model[3_100..12_100].copy_from_slice(&patch);
        fs.write(ino, 3_100, &patch).unwrap();

        let tail = b"unaligned tail write".to_vec();
        let at = model.len();
        model.extend_from_slice(&tail);
        fs.write(ino, at as u64, &tail).unwrap();

        assert_eq!(fs.read_file(ino).unwrap(), model, "opts {opts:?}");
        assert_eq!(
            fs.read(ino, 4_000, 9_000).unwrap(),
            &model[4_000..13_000],
            "opts {opts:?}"
        );

        fs.close().unwrap();
        let report = check_path(&path).unwrap();
        assert!(report.is_clean(), "opts {opts:?}: {:?}", report.errors);
    }
}

#[test]
fn holes_read_as_zeros() {
    let (_dir, _path, fs) = format_image(4 * MIB, &FormatOptions::default());
    let ino = fs.create_file(InodeNo::ROOT, "sparse").unwrap();

    fs.write(ino, 0, b"data").unwrap();
    fs.truncate(ino, 3 * u64::from(BLOCK_SIZE)).unwrap();

    let data = fs.read_file(ino).unwrap();
    assert_eq!(data.len(), 3 * BLOCK_SIZE as usize);
    assert_eq!(&data[..4], b"data");
    assert!(data[BLOCK_SIZE as usize * 2..].iter().all(|b| *b == 0));
}

// ── Encryption ──────────────────────────────────────────────────────────────

#[test]
fn aes_xts_ciphertext_reaches_the_disk() {
    let secret = b"This is sensitive data that should be encrypted!";
    let (_dir, path, fs) = format_image(10 * MIB, &encrypted_opts("MySecretPassword123"));

    let ino = fs.create_file(InodeNo::ROOT, "s").unwrap();
    fs.write(ino, 0, secret).unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), secret);
    fs.close().unwrap();

    let raw = std::fs::read(&path).unwrap();
    assert!(!contains_subsequence(&raw, b"sensitive data"));

    // Correct password round-trips.
    let fs = Lolfs::open_path(&path).unwrap();
    fs.unlock("MySecretPassword123").unwrap();
    let ino = fs.lookup(InodeNo::ROOT, "s").unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), secret);
    fs.close().unwrap();

    // A wrong password unlocks mechanically but yields garbled bytes.
    let fs = Lolfs::open_path(&path).unwrap();
    fs.unlock("WrongPassword").unwrap();
    let ino = fs.lookup(InodeNo::ROOT, "s").unwrap();
    assert_ne!(fs.read_file(ino).unwrap(), secret);
}

#[test]
fn locked_filesystems_refuse_data_access() {
    let payload = compressible_bytes(10_000);
    let (_dir, path, fs) = format_image(10 * MIB, &encrypted_opts("open sesame"));
    let ino = fs.create_file(InodeNo::ROOT, "any").unwrap();
    fs.write(ino, 0, &payload).unwrap();
    fs.close().unwrap();

    let fs = Lolfs::open_path(&path).unwrap();
    let status = fs.encryption_status();
    assert!(status.enabled);
    assert!(!status.unlocked);
    assert_eq!(status.algorithm, EncAlgo::Aes256Xts);

    let ino = fs.lookup(InodeNo::ROOT, "any").unwrap();
    assert!(matches!(
        fs.read(ino, 0, 100),
        Err(LolfsError::PermissionDenied)
    ));
    assert!(matches!(
        fs.write(ino, 0, b"x"),
        Err(LolfsError::PermissionDenied)
    ));

    // Unlock is idempotent; lock zeroes the key again.
    fs.unlock("open sesame").unwrap();
    fs.unlock("open sesame").unwrap();
    assert_eq!(fs.read(ino, 0, payload.len()).unwrap(), payload);
    fs.lock();
    assert!(matches!(
        fs.read(ino, 0, 100),
        Err(LolfsError::PermissionDenied)
    ));
}

#[test]
fn compression_and_encryption_compose() {
    let host_bytes = compressible_bytes(100 * 1024);
    let opts = FormatOptions {
        compression: CompAlgo::Lz4,
        encryption: EncAlgo::Aes256Xts,
        kdf_iterations: 1000,
        password: Some("p".to_owned()),
    };
    let (_dir, path, fs) = format_image(10 * MIB, &opts);

    let ino = fs.create_file(InodeNo::ROOT, "big").unwrap();
    fs.write(ino, 0, &host_bytes).unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), host_bytes);
    let ei_block = fs.stat(ino).unwrap().ei_block;
    fs.close().unwrap();

    // At least one extent carries both codec flags on disk.
    let raw = std::fs::read(&path).unwrap();
    let start = ei_block as usize * BLOCK_SIZE as usize;
    let index = ExtentIndex::parse(&raw[start..start + BLOCK_SIZE as usize]).unwrap();
    let both = index
        .extents
        .iter()
        .take_while(|e| !e.is_unused())
        .any(|e| {
            e.ee_flags & EXT_COMPRESSED != 0 && e.ee_flags & EXT_ENCRYPTED != 0
        });
    assert!(both, "no extent is both compressed and encrypted");

    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

// ── Allocation behavior ─────────────────────────────────────────────────────

#[test]
fn adaptive_extent_growth() {
    let (_dir, path, fs) = format_image(16 * MIB, &FormatOptions::default());

    // A fresh file's first extent covers 2 blocks.
    let small = fs.create_file(InodeNo::ROOT, "small").unwrap();
    assert_eq!(fs.stat(small).unwrap().i_blocks, 0);
    fs.write(small, 0, b"x").unwrap();
    assert_eq!(fs.stat(small).unwrap().i_blocks, 2);

    // Extending past 32 blocks brings in a cap-sized extent.
    let big = fs.create_file(InodeNo::ROOT, "big").unwrap();
    let payload = vec![0xAB_u8; 40 * BLOCK_SIZE as usize];
    fs.write(big, 0, &payload).unwrap();
    let blocks = fs.stat(big).unwrap().i_blocks;
    assert_eq!(blocks, 32 + 2048);

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn exhausted_image_rolls_back_partial_writes() {
    let (_dir, path, fs) = format_image(100 * u64::from(BLOCK_SIZE), &FormatOptions::default());
    let ino = fs.create_file(InodeNo::ROOT, "huge").unwrap();

    let too_much = vec![0x55_u8; 200 * BLOCK_SIZE as usize];
    assert!(matches!(
        fs.write(ino, 0, &too_much),
        Err(LolfsError::NoSpace)
    ));
    // The failed write released everything it had allocated.
    assert_eq!(fs.stat(ino).unwrap().i_size, 0);

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn truncate_returns_blocks_to_the_pool() {
    let (_dir, path, fs) = format_image(16 * MIB, &FormatOptions::default());
    let ino = fs.create_file(InodeNo::ROOT, "shrink").unwrap();

    let payload = vec![0x33_u8; 40 * BLOCK_SIZE as usize];
    fs.write(ino, 0, &payload).unwrap();
    let free_before = fs.statfs().free_blocks;

    fs.truncate(ino, u64::from(BLOCK_SIZE)).unwrap();
    assert!(fs.statfs().free_blocks > free_before);
    assert_eq!(fs.stat(ino).unwrap().i_size, BLOCK_SIZE);
    assert_eq!(fs.read_file(ino).unwrap(), &payload[..BLOCK_SIZE as usize]);

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

// ── Directories, links, names ───────────────────────────────────────────────

#[test]
fn directory_tree_operations() {
    let (_dir, path, fs) = format_image(8 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;

    let sub = fs.mkdir(root, "sub").unwrap();
    let file = fs.create_file(sub, "file.txt").unwrap();
    fs.write(file, 0, b"nested").unwrap();

    assert_eq!(fs.resolve_path("/sub/file.txt").unwrap(), file);
    assert_eq!(fs.stat(root).unwrap().i_nlink, 3);

    // A populated directory refuses rmdir; an emptied one does not.
    assert!(matches!(fs.rmdir(root, "sub"), Err(LolfsError::NotEmpty)));
    fs.unlink(sub, "file.txt").unwrap();
    fs.rmdir(root, "sub").unwrap();
    assert!(matches!(
        fs.resolve_path("/sub"),
        Err(LolfsError::NotFound(_))
    ));
    assert_eq!(fs.stat(root).unwrap().i_nlink, 2);

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn directory_grows_past_one_block() {
    let (_dir, path, fs) = format_image(16 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;

    // 40 entries span three 15-entry blocks.
    for i in 0..40 {
        fs.create_file(root, &format!("file-{i:02}")).unwrap();
    }
    let names: Vec<String> = fs
        .list_dir(root)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names.len(), 40);
    for i in 0..40 {
        assert!(names.contains(&format!("file-{i:02}")));
    }

    // Remove from the middle; lookups still answer correctly.
    fs.unlink(root, "file-17").unwrap();
    assert!(matches!(
        fs.lookup(root, "file-17"),
        Err(LolfsError::NotFound(_))
    ));
    assert!(fs.lookup(root, "file-39").is_ok());
    assert_eq!(fs.list_dir(root).unwrap().len(), 39);

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn directory_iteration_is_restartable() {
    let (_dir, _path, fs) = format_image(8 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;
    for i in 0..20 {
        fs.create_file(root, &format!("entry-{i:02}")).unwrap();
    }

    let full = fs.iterate_dir(root, root, 0).unwrap();
    assert_eq!(full.len(), 22);
    assert_eq!(full[0].name, ".");
    assert_eq!(full[1].name, "..");

    // Restarting from every cursor yields exactly the remaining tail.
    for (i, entry) in full.iter().enumerate() {
        let resumed = fs.iterate_dir(root, root, entry.cursor).unwrap();
        let expected: Vec<&str> = full[i + 1..].iter().map(|e| e.name.as_str()).collect();
        let got: Vec<&str> = resumed.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(got, expected, "cursor {}", entry.cursor);
    }
}

#[test]
fn name_limits_leave_directories_untouched() {
    let (_dir, _path, fs) = format_image(4 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;
    let long_name = "x".repeat(256);

    assert!(matches!(
        fs.create_file(root, &long_name),
        Err(LolfsError::TooBig)
    ));
    assert!(matches!(
        fs.mkdir(root, &long_name),
        Err(LolfsError::TooBig)
    ));
    assert!(fs.list_dir(root).unwrap().is_empty());

    // 255 bytes is still legal.
    let edge = "y".repeat(255);
    let ino = fs.create_file(root, &edge).unwrap();
    assert_eq!(fs.lookup(root, &edge).unwrap(), ino);
}

#[test]
fn hard_links_share_data_until_the_last_unlink() {
    let (_dir, path, fs) = format_image(8 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;

    let ino = fs.create_file(root, "original").unwrap();
    fs.write(ino, 0, b"shared payload").unwrap();
    fs.link(ino, root, "alias").unwrap();
    assert_eq!(fs.stat(ino).unwrap().i_nlink, 2);
    assert_eq!(fs.lookup(root, "alias").unwrap(), ino);

    fs.unlink(root, "original").unwrap();
    assert_eq!(fs.stat(ino).unwrap().i_nlink, 1);
    assert_eq!(fs.read_file(ino).unwrap(), b"shared payload");

    let free_before = fs.statfs().free_inodes;
    fs.unlink(root, "alias").unwrap();
    assert_eq!(fs.statfs().free_inodes, free_before + 1);

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn rename_moves_entries_between_directories() {
    let (_dir, path, fs) = format_image(8 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;

    let a = fs.mkdir(root, "a").unwrap();
    let b = fs.mkdir(root, "b").unwrap();
    let ino = fs.create_file(a, "doc").unwrap();
    fs.write(ino, 0, b"contents").unwrap();

    fs.rename(a, "doc", b, "doc-moved").unwrap();
    assert!(matches!(fs.lookup(a, "doc"), Err(LolfsError::NotFound(_))));
    assert_eq!(fs.lookup(b, "doc-moved").unwrap(), ino);
    assert_eq!(fs.read_file(ino).unwrap(), b"contents");

    // Same-directory rename, and collision refusal.
    fs.rename(b, "doc-moved", b, "doc-final").unwrap();
    assert_eq!(fs.lookup(b, "doc-final").unwrap(), ino);
    fs.create_file(b, "occupied").unwrap();
    assert!(matches!(
        fs.rename(b, "doc-final", b, "occupied"),
        Err(LolfsError::Exists)
    ));

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn symlinks_store_short_targets_inline() {
    let (_dir, _path, fs) = format_image(4 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;

    let link = fs.symlink(root, "link", "/sub/target").unwrap();
    assert_eq!(fs.read_link(link).unwrap(), "/sub/target");
    assert_eq!(fs.stat(link).unwrap().i_size, 11);

    // 27 bytes fits, 28 does not.
    fs.symlink(root, "edge", &"t".repeat(27)).unwrap();
    assert!(matches!(
        fs.symlink(root, "over", &"t".repeat(28)),
        Err(LolfsError::TooBig)
    ));

    fs.unlink(root, "link").unwrap();
    assert!(matches!(
        fs.lookup(root, "link"),
        Err(LolfsError::NotFound(_))
    ));
}

#[test]
fn duplicate_names_are_refused() {
    let (_dir, _path, fs) = format_image(4 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;
    fs.create_file(root, "once").unwrap();
    assert!(matches!(
        fs.create_file(root, "once"),
        Err(LolfsError::Exists)
    ));
    assert!(matches!(fs.mkdir(root, "once"), Err(LolfsError::Exists)));
}

// ── Xattrs ──────────────────────────────────────────────────────────────────

#[test]
fn xattr_lifecycle() {
    let (_dir, path, fs) = format_image(8 * MIB, &FormatOptions::default());
    let ino = fs.create_file(InodeNo::ROOT, "tagged").unwrap();
    let flags = lolfs_core::XattrSetFlags::default();

    fs.set_xattr(ino, "user.origin", b"https://example.com", flags)
        .unwrap();
    fs.set_xattr(ino, "security.label", b"s0", flags).unwrap();
    assert_eq!(
        fs.get_xattr(ino, "user.origin").unwrap(),
        b"https://example.com"
    );

    let mut names = fs.list_xattr(ino).unwrap();
    names.sort();
    assert_eq!(names, ["security.label", "user.origin"]);

    // Replace in place, then namespace-checked failure modes.
    fs.set_xattr(ino, "user.origin", b"elsewhere", flags).unwrap();
    assert_eq!(fs.get_xattr(ino, "user.origin").unwrap(), b"elsewhere");
    assert!(matches!(
        fs.set_xattr(
            ino,
            "user.origin",
            b"x",
            lolfs_core::XattrSetFlags {
                create: true,
                ..Default::default()
            }
        ),
        Err(LolfsError::Exists)
    ));
    assert!(matches!(
        fs.set_xattr(
            ino,
            "user.absent",
            b"x",
            lolfs_core::XattrSetFlags {
                replace: true,
                ..Default::default()
            }
        ),
        Err(LolfsError::NotFound(_))
    ));
    assert!(fs.set_xattr(ino, "bogus.name", b"x", flags).is_err());
    assert!(matches!(
        fs.set_xattr(ino, "user.huge", &vec![0; 70_000], flags),
        Err(LolfsError::TooBig)
    ));

    fs.remove_xattr(ino, "user.origin").unwrap();
    assert!(matches!(
        fs.get_xattr(ino, "user.origin"),
        Err(LolfsError::NotFound(_))
    ));
    fs.remove_xattr(ino, "security.label").unwrap();
    assert_eq!(fs.stat(ino).unwrap().xattr_block, 0);

    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

#[test]
fn xattr_blocks_are_freed_with_the_inode() {
    let (_dir, path, fs) = format_image(8 * MIB, &FormatOptions::default());
    let root = InodeNo::ROOT;
    let free_before = fs.statfs().free_blocks;

    let ino = fs.create_file(root, "tagged").unwrap();
    fs.set_xattr(
        ino,
        "user.blob",
        &vec![0x7A_u8; 9000],
        lolfs_core::XattrSetFlags::default(),
    )
    .unwrap();
    fs.unlink(root, "tagged").unwrap();

    assert_eq!(fs.statfs().free_blocks, free_before);
    fs.close().unwrap();
    let report = check_path(&path).unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
}

// ── Embedded images ─────────────────────────────────────────────────────────

#[test]
fn embedded_image_honors_the_base_offset() {
    use lolfs_core::FileByteDevice;

    let dir = TempDir::new().unwrap();
    let path = image_path(&dir);
    let base = 2 * u64::from(BLOCK_SIZE);

    // A host container with the filesystem section two blocks in.
    std::fs::write(&path, vec![0x7F_u8; (4 * MIB + base) as usize]).unwrap();
    let dev = FileByteDevice::open(&path).unwrap();
    let fs = Lolfs::format_device(Box::new(dev), base, &FormatOptions::default()).unwrap();
    let ino = fs.create_file(InodeNo::ROOT, "embedded").unwrap();
    fs.write(ino, 0, b"inside a container").unwrap();
    fs.close().unwrap();

    // The container prefix is untouched and the superblock sits at base.
    let raw = std::fs::read(&path).unwrap();
    assert!(raw[..base as usize].iter().all(|b| *b == 0x7F));
    assert_eq!(&raw[base as usize..base as usize + 4], &0x101E_1FF5_u32.to_le_bytes());

    let fs = Lolfs::open_path_at(&path, base).unwrap();
    let ino = fs.lookup(InodeNo::ROOT, "embedded").unwrap();
    assert_eq!(fs.read_file(ino).unwrap(), b"inside a container");
}
