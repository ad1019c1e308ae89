#![forbid(unsafe_code)]
//! Block model, clean block cache and split policy.
//!
//! - [`block`]: the closed `Block` variant (file/dir, direct/indirect) and
//!   the [`TreeBlock`] capability trait the tree engine is generic over.
//! - [`cache`]: [`BlockCacheStandard`], the transient/permanent clean cache
//!   with content-hash deduplication.
//! - [`split`]: [`BlockSplitter`] and the fixed-size
//!   [`BlockSplitterSimple`] policy.

pub mod block;
pub mod cache;
pub mod split;

pub use block::{
    Block, DirBlock, DirEntry, EntryInfo, EntryType, FileBlock, IndirectDirPtr, IndirectFilePtr,
    TreeBlock,
};
pub use cache::{BlockCache, BlockCacheConfig, BlockCacheStandard};
pub use split::{BlockSplitter, BlockSplitterSimple, SplitterConfig};

use cafs_types::{BlockPointer, BlockRef, BranchName, TlfId};

/// Reports whether a block currently has a dirty copy.
///
/// Implemented by the dirty block cache; the tree engine uses it to skip
/// clean subtrees.
pub trait IsDirtyProvider: Send + Sync {
    fn is_dirty(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> bool;
}

/// Key under which a dirty block is stored: the same block may be forked
/// on different branches and under different references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirtyBlockId {
    pub tlf: TlfId,
    pub block_ref: BlockRef,
    pub branch: BranchName,
}

impl DirtyBlockId {
    #[must_use]
    pub fn new(tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> Self {
        Self {
            tlf,
            block_ref: ptr.ref_ptr(),
            branch: branch.clone(),
        }
    }
}
