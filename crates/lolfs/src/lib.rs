#![forbid(unsafe_code)]
//! lolfs public API facade.
//!
//! Re-exports the engine from `lolfs-core` through a stable external
//! interface. This is the crate downstream consumers (CLI, host
//! adapters) depend on.

pub use lolfs_core::*;
pub use lolfs_error::{LolfsError, Result};
pub use lolfs_types::{BlockNo, CompAlgo, EncAlgo, FileKind, InodeNo, KdfAlgo};
