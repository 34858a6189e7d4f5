//! Read/modify/rewrite engine for NCCH containers (3DS ROM images).
//!
//! An NCCH container embeds an executable code segment (ExeFS) and a
//! read-only hierarchical virtual filesystem (RomFS) protected by a
//! 4-level IVFC hash tree. This crate locates the primary NCCH inside
//! the three common outer wrappers (`.cxi`, `.3ds` disk image, `.cia`
//! installable package), exposes the RomFS as a flat path → byte-range
//! map plus the decompressed code blob, accepts content mutations, and
//! rebuilds either a complete new container file (re-packed data,
//! reconstructed hash tree, recomputed superblock hashes) or a loose
//! overlay directory tree for runtime layered-FS loaders.
//!
//! # Example
//!
//! ```no_run
//! use ctrpack::Container;
//!
//! let mut rom = Container::open("game.3ds")?;
//! let table = rom.read_file("a/0/0/0")?;
//! // ... mutate table bytes ...
//! rom.write_file("a/0/0/0", table)?;
//! rom.rebuild_to_file("game.rebuilt.3ds", Some("edited"), Some(42))?;
//! # Ok::<(), ctrpack::CtrError>(())
//! ```
//!
//! File *contents* are never interpreted here; callers get raw bytes.
//! The code-segment compression codec is likewise pluggable via
//! [`CodeCodec`].

#![warn(missing_docs)]

use thiserror::Error;

pub mod align;
pub mod container;
pub mod detect;
pub mod exefs;
pub mod format;
pub mod rebuild;
pub mod romfs;

#[cfg(test)]
pub(crate) mod testimg;

pub use container::{CodeCodec, Container};
pub use romfs::RomfsFile;

/// Result type alias using this crate's error type.
pub type Result<T> = std::result::Result<T, CtrError>;

/// Errors surfaced by container operations.
///
/// Nothing is retried internally; every failure propagates to the caller,
/// who owns user-facing messaging and any higher-level retry.
#[derive(Error, Debug)]
pub enum CtrError {
    /// No recognized container magic at any probed location.
    #[error("not a recognized container: {0}")]
    NotAContainer(String),

    /// Parsing failed and the decryption heuristic found no plaintext
    /// evidence. Surfaced distinctly so callers can show a specific
    /// message instead of a generic corruption error.
    #[error("container appears encrypted or uses an unsupported layout")]
    EncryptedOrUnsupported,

    /// A self-describing length field mismatched, or a tree walk hit an
    /// out-of-range or cyclic offset.
    #[error("corrupt container structure: {0}")]
    CorruptStructure(String),

    /// Underlying read/write/seek failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CtrError {
    /// Create a corrupt-structure error with a message.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptStructure(msg.into())
    }

    /// Create a not-a-container error with a message.
    pub fn not_a_container(msg: impl Into<String>) -> Self {
        Self::NotAContainer(msg.into())
    }
}
