#![forbid(unsafe_code)]
//! Error types for lolfs.
//!
//! Defines `LolfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for adapters that speak POSIX.

use thiserror::Error;

/// Unified error type for all lolfs operations.
#[derive(Debug, Error)]
pub enum LolfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid image: {0}")]
    Format(String),

    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    #[error("no space left on device")]
    NoSpace,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("too big")]
    TooBig,

    #[error("permission denied")]
    PermissionDenied,

    #[error("authentication failure")]
    AuthFailure,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl LolfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Format(_) | Self::Corruption { .. } => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::TooBig => libc::EFBIG,
            Self::PermissionDenied => libc::EACCES,
            Self::AuthFailure => libc::EBADMSG,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
        }
    }
}

/// Result alias using `LolfsError`.
pub type Result<T> = std::result::Result<T, LolfsError>;
