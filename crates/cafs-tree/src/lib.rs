#![forbid(unsafe_code)]
//! Copy-on-write indirect block tree.
//!
//! A file or directory larger than one block is stored as a tree: interior
//! ("indirect") blocks hold an ascending list of `(BlockInfo, Offset)`
//! pointers, leaves ("direct" blocks) hold the data. For every indirect
//! block, `child[i].offset <= x < child[i + 1].offset` for any offset `x`
//! routed to child `i`; the last child is open-ended.
//!
//! [`BlockTree`] is generic over the block kind through
//! [`cafs_block::TreeBlock`] and knows nothing about caches: blocks come in
//! through a [`BlockGetter`] and leave through a [`DirtyBlockCacher`].
//!
//! # Operation arena
//!
//! Each top-level operation works on a private arena of blocks keyed by
//! [`BlockRef`]. The first write-class fetch of a block takes a private
//! copy; every later visit in the same operation sees that copy, including
//! modifications. [`BlockTree::cache`] pushes a block to the cacher right
//! away and remembers it; [`BlockTree::finish_op`] pushes every remembered
//! block once more with its final contents, so later in-place edits (offset
//! fix-ups, cleared sizes, swapped pointers) always reach the dirty cache.
//!
//! ```text
//!   begin_op ── fetch/modify/cache ... ── finish_op
//!                     │                       │
//!                 arena (owned)      re-cache dirty set, clear arena
//! ```
//!
//! Partial progress already pushed to the cacher is kept when an operation
//! fails part-way.

mod mutate;
mod ready;
mod traverse;

pub use mutate::{DirtiedPtrs, NewRightBlock, ShiftOutcome};
pub use ready::{
    BlockPutState, BlockPutStateMemory, PutBlock, ReadiedBlock, Readier, ReadyDeps,
    SyncedCallback,
};
pub use traverse::{BlockAtOffset, OffsetRange, check_for_holes_and_truncate};

use asupersync::Cx;
use cafs_block::{BlockSplitter, TreeBlock};
use cafs_error::{CafsError, Result};
use cafs_types::{
    BlockContext, BlockId, BlockInfo, BlockPointer, BlockRef, BlockReqType, BranchName, DataVer,
    DirectType, KeyGen, TlfId, UserId,
};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| CafsError::Cancelled)
}

// ── Collaborators ───────────────────────────────────────────────────────────

/// Source of tree blocks.
pub trait BlockGetter<B: TreeBlock>: Send + Sync {
    /// Fetch `ptr`, returning the block and whether it currently has a
    /// dirty copy.
    fn get_block(&self, cx: &Cx, ptr: &BlockPointer, req: BlockReqType) -> Result<(B, bool)>;
}

/// Sink for blocks that were modified locally.
pub trait DirtyBlockCacher<B: TreeBlock>: Send + Sync {
    fn cache_dirty(&self, cx: &Cx, ptr: &BlockPointer, block: &B) -> Result<()>;
}

/// Identity shared by every block of one tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOwner {
    pub tlf: TlfId,
    pub branch: BranchName,
    /// User charged for newly created blocks.
    pub charged_to: UserId,
    /// Latest key generation of the TLF; stamped on new pointers.
    pub key_gen: KeyGen,
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// One step of a path from the root: an indirect block and the index of
/// the child the path continues through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParentBlockAndChildIndex {
    pub ptr: BlockPointer,
    pub child_index: usize,
}

impl ParentBlockAndChildIndex {
    #[must_use]
    pub fn new(ptr: BlockPointer, child_index: usize) -> Self {
        Self { ptr, child_index }
    }
}

// ── Tree ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot<B> {
    ptr: BlockPointer,
    block: B,
    writable: bool,
    was_dirty: bool,
}

/// Indirect-pointer tree rooted at one block pointer.
pub struct BlockTree<B: TreeBlock> {
    root: BlockPointer,
    owner: TreeOwner,
    bsplit: Arc<dyn BlockSplitter>,
    getter: Arc<dyn BlockGetter<B>>,
    cacher: Arc<dyn DirtyBlockCacher<B>>,
    arena: HashMap<BlockRef, Slot<B>>,
    dirty: HashSet<BlockRef>,
}

impl<B: TreeBlock> fmt::Debug for BlockTree<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockTree")
            .field("root", &self.root)
            .field("owner", &self.owner)
            .field("bsplit", &self.bsplit)
            .field("loaded", &self.arena.len())
            .field("dirty", &self.dirty.len())
            .finish_non_exhaustive()
    }
}

impl<B: TreeBlock> BlockTree<B> {
    pub fn new(
        root: BlockPointer,
        owner: TreeOwner,
        bsplit: Arc<dyn BlockSplitter>,
        getter: Arc<dyn BlockGetter<B>>,
        cacher: Arc<dyn DirtyBlockCacher<B>>,
    ) -> Self {
        Self {
            root,
            owner,
            bsplit,
            getter,
            cacher,
            arena: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    #[must_use]
    pub fn root_ptr(&self) -> BlockPointer {
        self.root
    }

    #[must_use]
    pub fn owner(&self) -> &TreeOwner {
        &self.owner
    }

    #[must_use]
    pub fn splitter(&self) -> Arc<dyn BlockSplitter> {
        Arc::clone(&self.bsplit)
    }

    /// Start a top-level operation with an empty arena.
    pub fn begin_op(&mut self) {
        self.arena.clear();
        self.dirty.clear();
    }

    /// Push the final contents of every block cached during this operation
    /// to the cacher, then drop the arena.
    pub fn finish_op(&mut self, cx: &Cx) -> Result<()> {
        let dirty = std::mem::take(&mut self.dirty);
        let mut result = Ok(());
        for key in &dirty {
            let Some(slot) = self.arena.get(key) else {
                continue;
            };
            if let Err(err) = self.cacher.cache_dirty(cx, &slot.ptr, &slot.block) {
                result = Err(err);
                break;
            }
        }
        trace!(
            target: "cafs::tree",
            root = %self.root,
            flushed = dirty.len(),
            "op_finished"
        );
        self.arena.clear();
        result
    }

    /// Load `ptr` into the arena and return whether it was dirty.
    ///
    /// A block already loaded is returned as is, unless it was loaded for
    /// reading and `req` asks for a writable copy.
    pub fn fetch(&mut self, cx: &Cx, ptr: &BlockPointer, req: BlockReqType) -> Result<bool> {
        cx_checkpoint(cx)?;
        let key = ptr.ref_ptr();
        if let Some(slot) = self.arena.get(&key) {
            if slot.writable || !req.is_write() {
                return Ok(slot.was_dirty);
            }
        }
        let (block, was_dirty) = self.getter.get_block(cx, ptr, req)?;
        self.arena.insert(
            key,
            Slot {
                ptr: *ptr,
                block,
                writable: req.is_write(),
                was_dirty,
            },
        );
        Ok(was_dirty)
    }

    /// Load the root block.
    pub fn fetch_root(&mut self, cx: &Cx, req: BlockReqType) -> Result<bool> {
        let root = self.root;
        self.fetch(cx, &root, req)
    }

    /// A block loaded earlier in this operation.
    pub fn block(&self, ptr: &BlockPointer) -> Result<&B> {
        self.arena
            .get(&ptr.ref_ptr())
            .map(|slot| &slot.block)
            .ok_or_else(|| not_loaded(ptr))
    }

    pub fn block_mut(&mut self, ptr: &BlockPointer) -> Result<&mut B> {
        self.arena
            .get_mut(&ptr.ref_ptr())
            .map(|slot| &mut slot.block)
            .ok_or_else(|| not_loaded(ptr))
    }

    /// The root block, which must already be loaded.
    pub fn root_block(&self) -> Result<&B> {
        self.block(&self.root)
    }

    /// Hand the current contents of `ptr` to the cacher and keep it in the
    /// operation's dirty set.
    pub fn cache(&mut self, cx: &Cx, ptr: &BlockPointer) -> Result<()> {
        let key = ptr.ref_ptr();
        let slot = self.arena.get_mut(&key).ok_or_else(|| not_loaded(ptr))?;
        slot.was_dirty = true;
        slot.writable = true;
        self.cacher.cache_dirty(cx, ptr, &slot.block)?;
        self.dirty.insert(key);
        trace!(target: "cafs::tree", ptr = %ptr, "block_cached");
        Ok(())
    }

    /// Child info and offset named by a path step.
    pub fn child(&self, step: &ParentBlockAndChildIndex) -> Result<(BlockInfo, B::Offset)> {
        self.block(&step.ptr)?
            .indirect_ptr(step.child_index)
            .ok_or_else(|| {
                CafsError::BadData(format!(
                    "child index {} out of range in {}",
                    step.child_index, step.ptr
                ))
            })
    }

    pub fn child_ptr(&self, step: &ParentBlockAndChildIndex) -> Result<BlockPointer> {
        self.child(step).map(|(info, _)| info.ptr)
    }

    /// Index of the deepest path step whose block still has room for
    /// another pointer.
    #[must_use]
    pub fn lowest_ancestor_with_room(&self, parents: &[ParentBlockAndChildIndex]) -> Option<usize> {
        let max = self.bsplit.max_ptrs_per_block();
        parents.iter().rposition(|step| {
            self.block(&step.ptr)
                .is_ok_and(|block| block.num_indirect_ptrs() < max)
        })
    }

    /// A fresh temporary pointer owned by this tree.
    fn new_ptr(&self, data_ver: DataVer, direct_type: DirectType) -> BlockPointer {
        BlockPointer {
            id: BlockId::temporary(),
            key_gen: self.owner.key_gen,
            data_ver,
            direct_type,
            context: BlockContext::first(self.owner.charged_to, self.root.context.block_type),
        }
    }

    fn insert_new(&mut self, ptr: BlockPointer, block: B) {
        self.arena.insert(
            ptr.ref_ptr(),
            Slot {
                ptr,
                block,
                writable: true,
                was_dirty: false,
            },
        );
    }

    /// Move the root block to `to`, leaving the root slot empty.
    fn move_root_block(&mut self, to: BlockPointer) -> Result<()> {
        let root = self.root;
        let mut slot = self
            .arena
            .remove(&root.ref_ptr())
            .ok_or_else(|| not_loaded(&root))?;
        self.dirty.remove(&root.ref_ptr());
        slot.ptr = to;
        slot.was_dirty = false;
        slot.writable = true;
        self.arena.insert(to.ref_ptr(), slot);
        Ok(())
    }

    /// Swap the pointer entries at `(a, ai)` and `(b, bi)`.
    fn swap_entries(
        &mut self,
        a: &BlockPointer,
        ai: usize,
        b: &BlockPointer,
        bi: usize,
    ) -> Result<()> {
        let missing = |ptr: &BlockPointer, i: usize| {
            CafsError::BadData(format!("no pointer {i} in {ptr}"))
        };
        let left = self.block(a)?.entry(ai).ok_or_else(|| missing(a, ai))?;
        let right = self.block(b)?.entry(bi).ok_or_else(|| missing(b, bi))?;
        self.block_mut(a)?.set_entry(ai, right);
        self.block_mut(b)?.set_entry(bi, left);
        Ok(())
    }
}

fn not_loaded(ptr: &BlockPointer) -> CafsError {
    CafsError::BadData(format!("block {ptr} is not loaded"))
}

// ── Test support ────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testing::{MemStore, clean_file, tree};
    use super::*;
    use cafs_block::FileBlock;
    use cafs_types::Int64Offset;

    #[test]
    fn write_fetch_takes_private_copy() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = clean_file(&store, &[(0, b"ab"), (2, b"cd")]);
        let mut t = tree(&store, root);
        t.begin_op();
        assert!(!t.fetch(&cx, &leaves[0], BlockReqType::Write).expect("fetch"));
        t.block_mut(&leaves[0])
            .expect("loaded")
            .contents_mut()
            .push(b'x');
        // A later read in the same operation sees the modified copy.
        t.fetch(&cx, &leaves[0], BlockReqType::Read).expect("refetch");
        assert_eq!(t.block(&leaves[0]).expect("loaded").contents(), b"abx");
        // Nothing reaches the store until the block is cached.
        assert!(store.dirty_block(&leaves[0]).is_none());
        t.finish_op(&cx).expect("finish");
        assert!(store.dirty_block(&leaves[0]).is_none());
    }

    #[test]
    fn finish_op_flushes_final_contents() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = clean_file(&store, &[(0, b"ab"), (2, b"cd")]);
        let mut t = tree(&store, root);
        t.begin_op();
        t.fetch(&cx, &leaves[1], BlockReqType::Write).expect("fetch");
        t.cache(&cx, &leaves[1]).expect("cache");
        t.block_mut(&leaves[1])
            .expect("loaded")
            .set_contents(b"zz".to_vec());
        assert_eq!(
            store.dirty_block(&leaves[1]).expect("cached").contents(),
            b"cd"
        );
        t.finish_op(&cx).expect("finish");
        assert_eq!(
            store.dirty_block(&leaves[1]).expect("cached").contents(),
            b"zz"
        );
        assert!(t.block(&leaves[1]).is_err());
    }

    #[test]
    fn lowest_ancestor_with_room_prefers_deepest() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, _) = clean_file(&store, &[(0, b"ab")]);
        let mut t = tree(&store, root);
        t.begin_op();
        t.fetch_root(&cx, BlockReqType::Write).expect("root");
        let parents = [ParentBlockAndChildIndex::new(root, 0)];
        assert_eq!(t.lowest_ancestor_with_room(&parents), Some(0));
        t.block_mut(&root)
            .expect("root")
            .append_new_indirect_ptr(testing::ptr(DirectType::Direct), Int64Offset(2));
        assert_eq!(t.lowest_ancestor_with_room(&parents), None);
    }

    #[test]
    fn unloaded_block_is_bad_data() {
        let store = Arc::new(MemStore::default());
        let t: BlockTree<FileBlock> = tree(&store, testing::ptr(DirectType::Direct));
        let err = t.root_block().expect_err("not loaded");
        assert!(matches!(err, CafsError::BadData(_)));
    }
}
