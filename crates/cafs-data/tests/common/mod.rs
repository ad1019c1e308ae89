#![allow(dead_code)]

use asupersync::Cx;
use cafs_block::{
    Block, BlockCache, BlockCacheConfig, BlockCacheStandard, BlockSplitterSimple, DirBlock,
    DirEntry, EntryType, FileBlock, IsDirtyProvider, TreeBlock,
};
use cafs_data::{CacheBackedStore, DirData, FileData};
use cafs_dirty::{DirtyBlockCache, DirtyBlockCacheStandard, DirtyCacheConfig};
use cafs_error::{CafsError, Result};
use cafs_tree::{BlockGetter, DirtyBlockCacher, TreeOwner};
use cafs_types::{
    BlockContext, BlockId, BlockPointer, BlockRef, BlockReqType, BlockType, BranchName,
    CacheLifetime, DataVer, DirectType, HashBehavior, KeyGen, TlfId, UserId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Two-tier in-memory block store: dirty blocks shadow clean ones.
#[derive(Debug, Default)]
pub struct MemStore {
    clean: Mutex<HashMap<BlockRef, Block>>,
    dirty: Mutex<HashMap<BlockRef, Block>>,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_clean(&self, ptr: &BlockPointer, block: impl Into<Block>) {
        self.clean.lock().insert(ptr.ref_ptr(), block.into());
    }

    pub fn is_dirty_ptr(&self, ptr: &BlockPointer) -> bool {
        self.dirty.lock().contains_key(&ptr.ref_ptr())
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Current copy of `ptr`, dirty first.
    pub fn load<B: TreeBlock>(&self, ptr: &BlockPointer) -> B {
        let block = self
            .dirty
            .lock()
            .get(&ptr.ref_ptr())
            .cloned()
            .or_else(|| self.clean.lock().get(&ptr.ref_ptr()).cloned())
            .expect("block present");
        B::from_block(block).expect("block kind")
    }

    /// Move every dirty block into the clean tier.
    pub fn clean_up(&self) {
        let drained: Vec<_> = self.dirty.lock().drain().collect();
        self.clean.lock().extend(drained);
    }
}

impl<B: TreeBlock> BlockGetter<B> for MemStore {
    fn get_block(&self, _cx: &Cx, ptr: &BlockPointer, _req: BlockReqType) -> Result<(B, bool)> {
        if let Some(block) = self.dirty.lock().get(&ptr.ref_ptr()) {
            return Ok((B::from_block(block.clone())?, true));
        }
        let block = self
            .clean
            .lock()
            .get(&ptr.ref_ptr())
            .cloned()
            .ok_or_else(|| CafsError::NoSuchBlock {
                id: ptr.id.to_string(),
            })?;
        Ok((B::from_block(block)?, false))
    }
}

impl<B: TreeBlock> DirtyBlockCacher<B> for MemStore {
    fn cache_dirty(&self, _cx: &Cx, ptr: &BlockPointer, block: &B) -> Result<()> {
        self.dirty.lock().insert(ptr.ref_ptr(), block.to_block());
        Ok(())
    }
}

impl IsDirtyProvider for MemStore {
    fn is_dirty(&self, _tlf: TlfId, ptr: &BlockPointer, _branch: &BranchName) -> bool {
        self.is_dirty_ptr(ptr)
    }
}

pub fn owner() -> TreeOwner {
    TreeOwner {
        tlf: TlfId([5; 16]),
        branch: BranchName::master(),
        charged_to: UserId([6; 16]),
        key_gen: KeyGen::FIRST_VALID,
    }
}

pub fn ptr(direct_type: DirectType, block_type: BlockType) -> BlockPointer {
    BlockPointer {
        id: BlockId::temporary(),
        key_gen: KeyGen::FIRST_VALID,
        data_ver: DataVer::FIRST_VALID,
        direct_type,
        context: BlockContext::first(UserId([6; 16]), block_type),
    }
}

/// An empty file whose root is a clean direct block.
pub fn empty_file(
    store: &Arc<MemStore>,
    max_size: i64,
    max_ptrs: usize,
) -> (FileData, DirEntry) {
    let root = ptr(DirectType::Direct, BlockType::Data);
    store.put_clean(&root, FileBlock::new_empty(false));
    let fd = FileData::new(
        root,
        owner(),
        Arc::new(BlockSplitterSimple::with_limits(max_size, max_ptrs, 0, 0)),
        Arc::clone(store) as Arc<dyn BlockGetter<FileBlock>>,
        Arc::clone(store) as Arc<dyn DirtyBlockCacher<FileBlock>>,
    );
    (fd, DirEntry::new(root, EntryType::File, 0))
}

/// An empty directory whose root is a clean direct block.
pub fn empty_dir(store: &Arc<MemStore>, max_ptrs: usize, max_entries: usize) -> DirData {
    let root = ptr(DirectType::Direct, BlockType::Data);
    store.put_clean(&root, DirBlock::new_empty(false));
    DirData::new(
        root,
        owner(),
        Arc::new(BlockSplitterSimple::with_limits(10, max_ptrs, 10, max_entries)),
        Arc::clone(store) as Arc<dyn BlockGetter<DirBlock>>,
        Arc::clone(store) as Arc<dyn DirtyBlockCacher<DirBlock>>,
    )
}

/// Real clean and dirty caches behind a [`CacheBackedStore`].
pub struct Caches {
    pub clean: Arc<BlockCacheStandard>,
    pub dirty: Arc<DirtyBlockCacheStandard>,
    pub store: Arc<CacheBackedStore>,
}

pub fn caches() -> Caches {
    let clean = Arc::new(BlockCacheStandard::new(BlockCacheConfig::default()));
    let dirty =
        Arc::new(DirtyBlockCacheStandard::new(DirtyCacheConfig::default()).expect("dirty cache"));
    let store = Arc::new(CacheBackedStore::new(
        owner().tlf,
        owner().branch,
        Arc::clone(&clean) as Arc<dyn BlockCache>,
        Arc::clone(&dirty) as Arc<dyn DirtyBlockCache>,
    ));
    Caches {
        clean,
        dirty,
        store,
    }
}

/// An empty directory stored in `caches`.
pub fn cache_backed_dir(caches: &Caches, max_ptrs: usize, max_entries: usize) -> DirData {
    let root = ptr(DirectType::Direct, BlockType::Data);
    caches
        .clean
        .put(
            root,
            owner().tlf,
            Block::Dir(DirBlock::new_empty(false)),
            CacheLifetime::Transient,
            HashBehavior::SkipCacheHash,
        )
        .expect("clean put");
    DirData::new(
        root,
        owner(),
        Arc::new(BlockSplitterSimple::with_limits(10, max_ptrs, 10, max_entries)),
        Arc::clone(&caches.store) as Arc<dyn BlockGetter<DirBlock>>,
        Arc::clone(&caches.store) as Arc<dyn DirtyBlockCacher<DirBlock>>,
    )
}

/// Every `(offset, ptr)` leaf under `root`, left to right.
pub fn leaves<B: TreeBlock>(
    store: &MemStore,
    root: &BlockPointer,
    first: B::Offset,
) -> Vec<(B::Offset, BlockPointer)> {
    let mut out = Vec::new();
    collect_leaves::<B>(store, *root, first, &mut out);
    out
}

fn collect_leaves<B: TreeBlock>(
    store: &MemStore,
    ptr: BlockPointer,
    off: B::Offset,
    out: &mut Vec<(B::Offset, BlockPointer)>,
) {
    let block: B = store.load(&ptr);
    if !block.is_indirect() {
        out.push((off, ptr));
        return;
    }
    for i in 0..block.num_indirect_ptrs() {
        let (info, child_off) = block.indirect_ptr(i).expect("child");
        collect_leaves::<B>(store, info.ptr, child_off, out);
    }
}

/// Check fan-out and offset ordering of every indirect block under `root`:
/// children ascend, and every offset inside a child's subtree lies within
/// the range its parent pointer routes to it.
pub fn check_structure<B: TreeBlock>(store: &MemStore, root: &BlockPointer, max_ptrs: usize) {
    check_range::<B>(store, *root, None, None, max_ptrs);
}

fn check_range<B: TreeBlock>(
    store: &MemStore,
    ptr: BlockPointer,
    low: Option<&B::Offset>,
    high: Option<&B::Offset>,
    max_ptrs: usize,
) {
    let block: B = store.load(&ptr);
    if !block.is_indirect() {
        return;
    }
    let n = block.num_indirect_ptrs();
    assert!(n >= 1, "indirect block {ptr} has no children");
    assert!(n <= max_ptrs, "indirect block {ptr} has {n} children");
    let children: Vec<_> = (0..n)
        .map(|i| block.indirect_ptr(i).expect("child"))
        .collect();
    for (i, (info, off)) in children.iter().enumerate() {
        if let Some(low) = low {
            assert!(off >= low, "{off:?} below parent bound {low:?}");
        }
        if let Some(high) = high {
            assert!(off < high, "{off:?} not below next bound {high:?}");
        }
        let next = children.get(i + 1).map(|(_, next)| next);
        if let Some(next) = next {
            assert!(off < next, "child offsets out of order: {off:?} >= {next:?}");
        }
        check_range::<B>(store, info.ptr, Some(off), next.or(high), max_ptrs);
    }
}
