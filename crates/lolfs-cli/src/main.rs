#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lolfs::{
    check_device, CompAlgo, EncAlgo, FileByteDevice, FormatOptions, Lolfs, XattrSetFlags,
};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "lolfs", about = "Tools for lolfs filesystem images", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a filesystem on an image file.
    Mkfs {
        /// Path to the image file.
        image: PathBuf,
        /// Image size (e.g. 200M); creates or truncates the file.
        /// Omit to format an existing file in place.
        #[arg(short, long)]
        size: Option<String>,
        /// Compression algorithm: none, lz4, zlib or zstd.
        #[arg(long, default_value = "none")]
        compression: CompAlgo,
        /// Encryption algorithm: none, aes-256-xts or chacha20-poly1305.
        #[arg(long, default_value = "none")]
        encryption: EncAlgo,
        /// PBKDF2 iteration count for the user key.
        #[arg(long, default_value_t = 100_000)]
        kdf_iterations: u32,
        /// Password for encrypted filesystems.
        #[arg(short = 'P', long)]
        password: Option<String>,
        /// Byte offset of the superblock inside the image.
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Check filesystem consistency.
    Fsck {
        image: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// List directory contents.
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        /// Long listing with inode, mode, link count and size.
        #[arg(short, long)]
        long: bool,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Write file contents to stdout.
    Cat {
        image: PathBuf,
        path: String,
        #[arg(short = 'P', long)]
        password: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Write data to a file, replacing its contents.
    Write {
        image: PathBuf,
        path: String,
        /// Read data from this file instead of stdin.
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(short = 'P', long)]
        password: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Create an empty file.
    Touch {
        image: PathBuf,
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Create a directory.
    Mkdir {
        image: PathBuf,
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Create a symbolic link.
    Symlink {
        image: PathBuf,
        /// Link target (at most 27 bytes).
        target: String,
        /// Path of the new link.
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Print a symlink's target.
    Readlink {
        image: PathBuf,
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Create a hard link.
    Ln {
        image: PathBuf,
        /// Existing file.
        target: String,
        /// Path of the new link.
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Remove a file or symlink.
    Rm {
        image: PathBuf,
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Remove an empty directory.
    Rmdir {
        image: PathBuf,
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Rename or move a file.
    Mv {
        image: PathBuf,
        from: String,
        to: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Set a file's size.
    Truncate {
        image: PathBuf,
        path: String,
        size: u64,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Show an inode record.
    Stat {
        image: PathBuf,
        path: String,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Show encryption status and filesystem totals.
    Status {
        image: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Extended attribute operations.
    Xattr {
        #[command(subcommand)]
        command: XattrCommand,
    },
}

#[derive(Subcommand)]
enum XattrCommand {
    /// Print an attribute value.
    Get {
        image: PathBuf,
        path: String,
        /// Fully qualified name, e.g. user.origin.
        name: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Set an attribute.
    Set {
        image: PathBuf,
        path: String,
        name: String,
        value: String,
        /// Fail if the attribute already exists.
        #[arg(long)]
        create: bool,
        /// Fail if the attribute does not exist.
        #[arg(long)]
        replace: bool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// List attribute names.
    List {
        image: PathBuf,
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Remove an attribute.
    Remove {
        image: PathBuf,
        path: String,
        name: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
}

// ── Entry point ─────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs {
            image,
            size,
            compression,
            encryption,
            kdf_iterations,
            password,
            offset,
        } => mkfs(
            &image,
            size.as_deref(),
            compression,
            encryption,
            kdf_iterations,
            password,
            offset,
        ),
        Command::Fsck {
            image,
            json,
            offset,
        } => fsck(&image, json, offset),
        Command::Ls {
            image,
            path,
            long,
            json,
            offset,
        } => ls(&image, &path, long, json, offset),
        Command::Cat {
            image,
            path,
            password,
            offset,
        } => cat(&image, &path, password.as_deref(), offset),
        Command::Write {
            image,
            path,
            input,
            password,
            offset,
        } => write_cmd(&image, &path, input.as_deref(), password.as_deref(), offset),
        Command::Touch {
            image,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let (parent, name) = fs.resolve_parent(&path)?;
            fs.create_file(parent, &name)?;
            fs.close()?;
            Ok(())
        }
        Command::Mkdir {
            image,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let (parent, name) = fs.resolve_parent(&path)?;
            fs.mkdir(parent, &name)?;
            fs.close()?;
            Ok(())
        }
        Command::Symlink {
            image,
            target,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let (parent, name) = fs.resolve_parent(&path)?;
            fs.symlink(parent, &name, &target)?;
            fs.close()?;
            Ok(())
        }
        Command::Readlink {
            image,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let ino = fs.resolve_path(&path)?;
            println!("{}", fs.read_link(ino)?);
            Ok(())
        }
        Command::Ln {
            image,
            target,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let target_ino = fs.resolve_path(&target)?;
            let (parent, name) = fs.resolve_parent(&path)?;
            fs.link(target_ino, parent, &name)?;
            fs.close()?;
            Ok(())
        }
        Command::Rm {
            image,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let (parent, name) = fs.resolve_parent(&path)?;
            fs.unlink(parent, &name)?;
            fs.close()?;
            Ok(())
        }
        Command::Rmdir {
            image,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let (parent, name) = fs.resolve_parent(&path)?;
            fs.rmdir(parent, &name)?;
            fs.close()?;
            Ok(())
        }
        Command::Mv {
            image,
            from,
            to,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let (old_parent, old_name) = fs.resolve_parent(&from)?;
            let (new_parent, new_name) = fs.resolve_parent(&to)?;
            fs.rename(old_parent, &old_name, new_parent, &new_name)?;
            fs.close()?;
            Ok(())
        }
        Command::Truncate {
            image,
            path,
            size,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let ino = fs.resolve_path(&path)?;
            fs.truncate(ino, size)?;
            fs.close()?;
            Ok(())
        }
        Command::Stat {
            image,
            path,
            json,
            offset,
        } => stat_cmd(&image, &path, json, offset),
        Command::Status {
            image,
            json,
            offset,
        } => status_cmd(&image, json, offset),
        Command::Xattr { command } => xattr_cmd(command),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn open_image(image: &Path, offset: u64, password: Option<&str>) -> Result<Lolfs> {
    let fs = Lolfs::open_path_at(image, offset)
        .with_context(|| format!("failed to open {}", image.display()))?;
    if let Some(password) = password {
        fs.unlock(password).context("unlock failed")?;
    }
    Ok(fs)
}

/// Parse sizes like `1048576`, `512K`, `200M` or `2G`.
fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, factor) = match text.chars().last() {
        Some('K' | 'k') => (&text[..text.len() - 1], 1_u64 << 10),
        Some('M' | 'm') => (&text[..text.len() - 1], 1_u64 << 20),
        Some('G' | 'g') => (&text[..text.len() - 1], 1_u64 << 30),
        _ => (text, 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size {text:?}"))?;
    Ok(value * factor)
}

fn mode_string(mode: u32) -> String {
    let kind = match mode & 0o170_000 {
        0o040_000 => 'd',
        0o120_000 => 'l',
        _ => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6_u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

// ── Commands ────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn mkfs(
    image: &Path,
    size: Option<&str>,
    compression: CompAlgo,
    encryption: EncAlgo,
    kdf_iterations: u32,
    password: Option<String>,
    offset: u64,
) -> Result<()> {
    let opts = FormatOptions {
        compression,
        encryption,
        kdf_iterations,
        password,
    };
    let fs = match size {
        Some(size) => {
            if offset != 0 {
                bail!("--size and --offset cannot be combined");
            }
            let bytes = parse_size(size)?;
            Lolfs::format_path(image, bytes, &opts)
                .with_context(|| format!("failed to format {}", image.display()))?
        }
        None => {
            let dev = FileByteDevice::open(image)
                .with_context(|| format!("failed to open {}", image.display()))?;
            Lolfs::format_device(Box::new(dev), offset, &opts)
                .with_context(|| format!("failed to format {}", image.display()))?
        }
    };

    let stats = fs.statfs();
    println!(
        "formatted {}: {} blocks, {} inodes, compression={compression}, encryption={encryption}",
        image.display(),
        stats.total_blocks,
        stats.total_inodes,
    );
    fs.close()?;
    Ok(())
}

fn fsck(image: &Path, json: bool, offset: u64) -> Result<()> {
    let dev = FileByteDevice::open_readonly(image)
        .with_context(|| format!("failed to open {}", image.display()))?;
    let report = check_device(Box::new(dev), offset)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for error in &report.errors {
            println!("ERROR: {error}");
        }
        for warning in &report.warnings {
            println!("WARNING: {warning}");
        }
        if report.is_clean() && report.warnings.is_empty() {
            println!("{}: clean", image.display());
        } else {
            println!(
                "{}: {} errors, {} warnings",
                image.display(),
                report.errors.len(),
                report.warnings.len()
            );
        }
    }

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn ls(image: &Path, path: &str, long: bool, json: bool, offset: u64) -> Result<()> {
    let fs = open_image(image, offset, None)?;
    let dir = fs.resolve_path(path)?;
    let entries = fs.list_dir(dir)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in entries {
        if long {
            let record = fs.stat(entry.ino)?;
            println!(
                "{} {:>4} {:>8} {:>4} {}",
                mode_string(record.i_mode),
                record.i_nlink,
                record.i_size,
                entry.ino,
                entry.name
            );
        } else {
            println!("{}", entry.name);
        }
    }
    Ok(())
}

fn cat(image: &Path, path: &str, password: Option<&str>, offset: u64) -> Result<()> {
    let fs = open_image(image, offset, password)?;
    let ino = fs.resolve_path(path)?;
    let data = fs.read_file(ino)?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

fn write_cmd(
    image: &Path,
    path: &str,
    input: Option<&Path>,
    password: Option<&str>,
    offset: u64,
) -> Result<()> {
    let data = match input {
        Some(input) => std::fs::read(input)
            .with_context(|| format!("failed to read {}", input.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let fs = open_image(image, offset, password)?;
    let (parent, name) = fs.resolve_parent(path)?;
    let ino = match fs.lookup(parent, &name) {
        Ok(ino) => {
            fs.truncate(ino, 0)?;
            ino
        }
        Err(lolfs::LolfsError::NotFound(_)) => fs.create_file(parent, &name)?,
        Err(err) => return Err(err.into()),
    };
    fs.write(ino, 0, &data)?;
    fs.close()?;
    Ok(())
}

fn stat_cmd(image: &Path, path: &str, json: bool, offset: u64) -> Result<()> {
    let fs = open_image(image, offset, None)?;
    let ino = fs.resolve_path(path)?;
    let record = fs.stat(ino)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("inode: {ino}");
        println!("mode: {} ({:o})", mode_string(record.i_mode), record.i_mode);
        println!("size: {}", record.i_size);
        println!("blocks: {}", record.i_blocks);
        println!("links: {}", record.i_nlink);
        println!("uid/gid: {}/{}", record.i_uid, record.i_gid);
    }
    Ok(())
}

fn status_cmd(image: &Path, json: bool, offset: u64) -> Result<()> {
    let fs = open_image(image, offset, None)?;
    let status = fs.encryption_status();
    let stats = fs.statfs();

    if json {
        let out = serde_json::json!({
            "encryption": status,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "encryption: enabled={} algorithm={} unlocked={}",
            status.enabled, status.algorithm, status.unlocked
        );
        println!(
            "blocks: {}/{} free, inodes: {}/{} free",
            stats.free_blocks, stats.total_blocks, stats.free_inodes, stats.total_inodes
        );
    }
    Ok(())
}

fn xattr_cmd(command: XattrCommand) -> Result<()> {
    match command {
        XattrCommand::Get {
            image,
            path,
            name,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let ino = fs.resolve_path(&path)?;
            let value = fs.get_xattr(ino, &name)?;
            std::io::stdout().write_all(&value)?;
            println!();
            Ok(())
        }
        XattrCommand::Set {
            image,
            path,
            name,
            value,
            create,
            replace,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let ino = fs.resolve_path(&path)?;
            fs.set_xattr(ino, &name, value.as_bytes(), XattrSetFlags { create, replace })?;
            fs.close()?;
            Ok(())
        }
        XattrCommand::List {
            image,
            path,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let ino = fs.resolve_path(&path)?;
            for name in fs.list_xattr(ino)? {
                println!("{name}");
            }
            Ok(())
        }
        XattrCommand::Remove {
            image,
            path,
            name,
            offset,
        } => {
            let fs = open_image(&image, offset, None)?;
            let ino = fs.resolve_path(&path)?;
            fs.remove_xattr(ino, &name)?;
            fs.close()?;
            Ok(())
        }
    }
}
