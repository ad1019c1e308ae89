//! Block source and sink backed by the dirty and clean caches.

use asupersync::Cx;
use cafs_block::{BlockCache, IsDirtyProvider, TreeBlock};
use cafs_dirty::{DirtyBlockCache, DirtyFile};
use cafs_error::{CafsError, Result};
use cafs_tree::{BlockGetter, DirtyBlockCacher};
use cafs_types::{BlockPointer, BlockReqType, BranchName, TlfId};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Reads blocks from the dirty cache first, then the clean cache, and
/// writes modified blocks to the dirty cache.
///
/// When a [`DirtyFile`] is attached, every block handed to the dirty cache
/// is also registered with it so per-block sync state stays in step.
pub struct CacheBackedStore {
    tlf: TlfId,
    branch: BranchName,
    clean: Arc<dyn BlockCache>,
    dirty: Arc<dyn DirtyBlockCache>,
    dirty_file: Option<Arc<DirtyFile>>,
}

impl fmt::Debug for CacheBackedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBackedStore")
            .field("tlf", &self.tlf)
            .field("branch", &self.branch)
            .field("dirty_file", &self.dirty_file.as_ref().map(|df| df.top_ptr()))
            .finish_non_exhaustive()
    }
}

impl CacheBackedStore {
    pub fn new(
        tlf: TlfId,
        branch: BranchName,
        clean: Arc<dyn BlockCache>,
        dirty: Arc<dyn DirtyBlockCache>,
    ) -> Self {
        Self {
            tlf,
            branch,
            clean,
            dirty,
            dirty_file: None,
        }
    }

    #[must_use]
    pub fn with_dirty_file(mut self, dirty_file: Arc<DirtyFile>) -> Self {
        self.dirty_file = Some(dirty_file);
        self
    }

    #[must_use]
    pub fn dirty_file(&self) -> Option<&Arc<DirtyFile>> {
        self.dirty_file.as_ref()
    }

    #[must_use]
    pub fn clean_cache(&self) -> &Arc<dyn BlockCache> {
        &self.clean
    }

    #[must_use]
    pub fn dirty_cache(&self) -> &Arc<dyn DirtyBlockCache> {
        &self.dirty
    }
}

impl<B: TreeBlock> BlockGetter<B> for CacheBackedStore {
    fn get_block(&self, cx: &Cx, ptr: &BlockPointer, req: BlockReqType) -> Result<(B, bool)> {
        cx.checkpoint().map_err(|_| CafsError::Cancelled)?;
        match self.dirty.get(self.tlf, ptr, &self.branch) {
            Ok(block) => return Ok((B::from_block(block)?, true)),
            Err(CafsError::NoSuchBlock { .. }) => {}
            Err(err) => return Err(err),
        }
        let block = self.clean.get(ptr)?;
        trace!(target: "cafs::store", ptr = %ptr, req = ?req, "clean_hit");
        Ok((B::from_block(block)?, false))
    }
}

impl<B: TreeBlock> DirtyBlockCacher<B> for CacheBackedStore {
    fn cache_dirty(&self, _cx: &Cx, ptr: &BlockPointer, block: &B) -> Result<()> {
        if let Some(df) = &self.dirty_file {
            let outcome = df.set_block_dirty(ptr);
            if outcome.is_syncing {
                trace!(target: "cafs::store", ptr = %ptr, "dirtied_while_syncing");
            }
        }
        self.dirty.put(self.tlf, ptr, &self.branch, block.to_block())
    }
}

impl IsDirtyProvider for CacheBackedStore {
    fn is_dirty(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> bool {
        self.dirty.is_dirty(tlf, ptr, branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cafs_block::{
        Block, BlockCacheConfig, BlockCacheStandard, FileBlock,
    };
    use cafs_dirty::{DirtyBlockCacheStandard, DirtyCacheConfig};
    use cafs_types::{
        BlockContext, BlockId, BlockType, CacheLifetime, DirectType, HashBehavior, KeyGen,
        DataVer, UserId,
    };

    fn ptr() -> BlockPointer {
        BlockPointer {
            id: BlockId::temporary(),
            key_gen: KeyGen::FIRST_VALID,
            data_ver: DataVer::FIRST_VALID,
            direct_type: DirectType::Direct,
            context: BlockContext::first(UserId([1; 16]), BlockType::Data),
        }
    }

    fn store() -> (CacheBackedStore, Arc<DirtyBlockCacheStandard>) {
        let clean = Arc::new(BlockCacheStandard::new(BlockCacheConfig::default()));
        let dirty = Arc::new(
            DirtyBlockCacheStandard::new(DirtyCacheConfig::default()).expect("dirty cache"),
        );
        let store = CacheBackedStore::new(
            TlfId([3; 16]),
            BranchName::master(),
            clean,
            Arc::clone(&dirty) as Arc<dyn DirtyBlockCache>,
        );
        (store, dirty)
    }

    #[test]
    fn dirty_copy_shadows_clean_copy() {
        let cx = Cx::for_testing();
        let (store, _dirty) = store();
        let p = ptr();
        store
            .clean_cache()
            .put(
                p,
                TlfId([3; 16]),
                Block::File(FileBlock::with_contents(b"old".to_vec())),
                CacheLifetime::Transient,
                HashBehavior::SkipCacheHash,
            )
            .expect("clean put");
        let (block, was_dirty): (FileBlock, bool) =
            store.get_block(&cx, &p, BlockReqType::Read).expect("get");
        assert_eq!(block.contents(), b"old");
        assert!(!was_dirty);

        store
            .cache_dirty(&cx, &p, &FileBlock::with_contents(b"new".to_vec()))
            .expect("cache");
        let (block, was_dirty): (FileBlock, bool) =
            store.get_block(&cx, &p, BlockReqType::Write).expect("get");
        assert_eq!(block.contents(), b"new");
        assert!(was_dirty);
        assert!(store.is_dirty(TlfId([3; 16]), &p, &BranchName::master()));
    }

    #[test]
    fn missing_block_is_not_found() {
        let cx = Cx::for_testing();
        let (store, _dirty) = store();
        let err = BlockGetter::<FileBlock>::get_block(&store, &cx, &ptr(), BlockReqType::Read)
            .expect_err("missing");
        assert!(matches!(err, CafsError::NoSuchBlock { .. }));
    }

    #[test]
    fn caching_registers_block_with_dirty_file() {
        let cx = Cx::for_testing();
        let (store, dirty) = store();
        let top = ptr();
        let df = Arc::new(DirtyFile::new(
            TlfId([3; 16]),
            BranchName::master(),
            top,
            dirty as Arc<dyn DirtyBlockCache>,
        ));
        let store = store.with_dirty_file(Arc::clone(&df));
        assert!(df.block_needs_copy(&top));
        store
            .cache_dirty(&cx, &top, &FileBlock::with_contents(b"x".to_vec()))
            .expect("cache");
        assert!(!df.block_needs_copy(&top));
    }
}
