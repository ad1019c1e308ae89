#![forbid(unsafe_code)]
//! Content-addressed, copy-on-write block core.
//!
//! Re-exports the workspace crates through one stable interface and adds
//! [`CafsConfig`], the single configuration document a host loads to build
//! the shared caches and the split policy.

pub use cafs_block::{
    Block, BlockCache, BlockCacheConfig, BlockCacheStandard, BlockSplitter, BlockSplitterSimple,
    DirBlock, DirEntry, EntryInfo, EntryType, FileBlock, IsDirtyProvider, SplitterConfig,
    TreeBlock,
};
pub use cafs_data::{
    CacheBackedStore, DirData, FileData, FileWriteOutcome, TruncateOutcome,
    default_new_block_data_version,
};
pub use cafs_dirty::{DirtyBlockCache, DirtyBlockCacheStandard, DirtyCacheConfig, DirtyFile};
pub use cafs_error::{CafsError, Result};
pub use cafs_tree::{
    BlockGetter, BlockPutState, BlockPutStateMemory, BlockTree, DirtyBlockCacher,
    ParentBlockAndChildIndex, ReadiedBlock, Readier, ReadyDeps, TreeOwner,
};
pub use cafs_types::{
    BlockContext, BlockId, BlockInfo, BlockPointer, BlockRef, BlockReqType, BlockType,
    BranchName, CacheLifetime, DataVer, DirectType, HashBehavior, Int64Offset, KeyGen, Offset,
    StringOffset, TlfId, UserId,
};

use serde::{Deserialize, Serialize};

/// Tuning for every shared component, loadable from any serde format.
///
/// Missing sections fall back to their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CafsConfig {
    pub block_cache: BlockCacheConfig,
    pub dirty_cache: DirtyCacheConfig,
    pub splitter: SplitterConfig,
}

impl CafsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_cache.transient_capacity == 0 {
            return Err(CafsError::BadData(
                "block_cache.transient_capacity must be > 0".to_owned(),
            ));
        }
        if self.block_cache.clean_bytes_capacity == 0 {
            return Err(CafsError::BadData(
                "block_cache.clean_bytes_capacity must be > 0".to_owned(),
            ));
        }
        self.dirty_cache.validate()?;
        BlockSplitterSimple::new(self.splitter)?;
        Ok(())
    }

    #[must_use]
    pub fn block_cache(&self) -> BlockCacheStandard {
        BlockCacheStandard::new(self.block_cache)
    }

    /// Starts the cache's permission worker; it stops when the cache is
    /// dropped or shut down.
    pub fn dirty_cache(&self) -> Result<DirtyBlockCacheStandard> {
        DirtyBlockCacheStandard::new(self.dirty_cache)
    }

    pub fn splitter(&self) -> Result<BlockSplitterSimple> {
        BlockSplitterSimple::new(self.splitter)
    }
}
