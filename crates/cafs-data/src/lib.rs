#![forbid(unsafe_code)]
//! File and directory views over the block tree.
//!
//! - [`FileData`]: byte-range reads, writes, truncation and split repair for
//!   a file tree keyed by [`cafs_types::Int64Offset`].
//! - [`DirData`]: entry lookup, insertion, update and removal for a
//!   directory tree keyed by [`cafs_types::StringOffset`].
//! - [`CacheBackedStore`]: a getter/cacher pair over the clean and dirty
//!   caches, optionally reporting to a [`cafs_dirty::DirtyFile`].
//!
//! Both views run every public method as one tree operation: the tree's
//! arena is reset on entry and every block dirtied along the way is handed
//! to the cacher with its final contents on exit.

mod dir;
mod file;
mod store;

pub use dir::DirData;
pub use file::{FileData, FileWriteOutcome, TruncateOutcome};
pub use store::CacheBackedStore;

use cafs_types::DataVer;

/// Data version stamped on newly created file blocks.
#[must_use]
pub fn default_new_block_data_version(holes: bool) -> DataVer {
    if holes {
        DataVer::CHILD_HOLES
    } else {
        DataVer::FIRST_VALID
    }
}
