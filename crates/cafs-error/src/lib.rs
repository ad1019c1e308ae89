#![forbid(unsafe_code)]
//! Error types for the cafs block core.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cafs-types` | Malformed pointer/info encodings |
//! | Runtime | `CafsError` | `cafs-error` (this crate) | Everything returned by caches, trees and data views |
//!
//! `cafs-types` converts its `ParseError` into [`CafsError::Parse`] at the
//! crate boundary; this crate depends on nothing else in the workspace.
//!
//! ## Classes
//!
//! | Class | Variants | Caller action |
//! |-------|----------|---------------|
//! | Not found | `NoSuchBlock`, `NoSuchName` | propagate; the core never retries |
//! | Capacity | `CachePutCacheFull` | shrink the working set or fail the write |
//! | Invariant violation | `BadData`, `BadSplit`, `NotDirectFileBlock`, `InvalidSyncState`, `ReadyTooLarge` | programmer error, not user-recoverable |
//! | Name conflict | `NameExists` | return to caller |
//! | Lifecycle | `ShutdownHappened`, `Cancelled`, `LeftoverDirtyBytes` | abort the operation |
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CafsError::to_errno`].
//! The mapping has no wildcard arm, so a new variant does not compile until
//! its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `NoSuchBlock` | `ENOENT` |
//! | `NoSuchName` | `ENOENT` |
//! | `NameExists` | `EEXIST` |
//! | `CachePutCacheFull` | `ENOSPC` |
//! | `BadData` / `BadSplit` / `NotDirectFileBlock` / `ReadyTooLarge` | `EIO` |
//! | `InvalidSyncState` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `ShutdownHappened` | `ESHUTDOWN` |
//! | `Cancelled` | `EINTR` |
//! | `LeftoverDirtyBytes` | `EBUSY` |

use thiserror::Error;

/// Unified error type for all cafs operations.
#[derive(Debug, Error)]
pub enum CafsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A requested block is absent from every cache tier and the fetcher.
    #[error("no such block: {id}")]
    NoSuchBlock { id: String },

    /// A transient insertion could not fit even after evicting every
    /// transient entry.
    #[error("block cache full: cannot fit {bytes} bytes for {id} (capacity {capacity})")]
    CachePutCacheFull { id: String, bytes: u64, capacity: u64 },

    /// Structurally invalid block contents or tree shape.
    #[error("bad block data: {0}")]
    BadData(String),

    /// The splitter returned a split point that makes no progress.
    #[error("bad split: splitter made no progress")]
    BadSplit,

    /// A file operation expected a direct (leaf) file block.
    #[error("expected a direct file block")]
    NotDirectFileBlock,

    /// A directory entry with this name already exists.
    #[error("name exists: {0}")]
    NameExists(String),

    /// No directory entry with this name exists.
    #[error("no such name: {0}")]
    NoSuchName(String),

    /// The owning cache was shut down.
    #[error("cache has been shut down")]
    ShutdownHappened,

    /// Operation cancelled via the `Cx` capability context.
    #[error("operation cancelled")]
    Cancelled,

    /// A dirty-file state transition was requested from the wrong state.
    #[error("invalid sync state: {0}")]
    InvalidSyncState(String),

    /// A readier reported more plaintext than it produced payload bytes.
    #[error("readied block too large: plaintext {plain} > payload {payload}")]
    ReadyTooLarge { plain: usize, payload: usize },

    /// Byte-level decode failure surfaced from `cafs-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// Shutdown found dirty-byte counters that never drained.
    #[error(
        "unexpected dirty bytes leftover on shutdown: sync_buf={sync_buf}, wait_buf={wait_buf}, ignore={ignore}"
    )]
    LeftoverDirtyBytes {
        sync_buf: i64,
        wait_buf: i64,
        ignore: i64,
    },
}

impl CafsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. Adding a variant without updating this
    /// function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoSuchBlock { .. } | Self::NoSuchName(_) => libc::ENOENT,
            Self::NameExists(_) => libc::EEXIST,
            Self::CachePutCacheFull { .. } => libc::ENOSPC,
            Self::BadData(_)
            | Self::BadSplit
            | Self::NotDirectFileBlock
            | Self::ReadyTooLarge { .. } => libc::EIO,
            Self::InvalidSyncState(_) | Self::Parse(_) => libc::EINVAL,
            Self::ShutdownHappened => libc::ESHUTDOWN,
            Self::Cancelled => libc::EINTR,
            Self::LeftoverDirtyBytes { .. } => libc::EBUSY,
        }
    }

    /// Whether this error is one of the assertion-class failures that
    /// indicate a broken precondition rather than an environmental fault.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::BadData(_)
                | Self::BadSplit
                | Self::NotDirectFileBlock
                | Self::InvalidSyncState(_)
                | Self::ReadyTooLarge { .. }
        )
    }
}

/// Result alias using `CafsError`.
pub type Result<T> = std::result::Result<T, CafsError>;
