//! Readying: turning dirty blocks into content-addressed, storable ones.

use crate::{BlockTree, ParentBlockAndChildIndex, cx_checkpoint};
use asupersync::Cx;
use cafs_block::{Block, BlockCache, IsDirtyProvider, TreeBlock};
use cafs_error::{CafsError, Result};
use cafs_types::{
    BlockContext, BlockId, BlockInfo, BlockPointer, BlockReqType, CacheLifetime, DirectType,
    HashBehavior,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, trace};

/// Encoded form of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadiedBlock {
    /// Content ID derived from `payload`.
    pub id: BlockId,
    /// Size of the plaintext encoding before padding and encryption.
    pub plain_size: usize,
    /// Bytes to upload.
    pub payload: Vec<u8>,
}

/// Encodes, encrypts and content-addresses a block.
pub trait Readier: Send + Sync {
    fn ready_block(&self, cx: &Cx, block: &Block) -> Result<ReadiedBlock>;
}

/// Runs once the block it was registered with has been durably stored.
pub type SyncedCallback = Box<dyn FnOnce() -> Result<()> + Send>;

/// Collects the blocks readied for one sync.
pub trait BlockPutState: Send + Sync {
    fn add_new_block(
        &self,
        cx: &Cx,
        ptr: BlockPointer,
        block: Block,
        payload: Vec<u8>,
        synced: Option<SyncedCallback>,
    ) -> Result<()>;

    /// Record that `old` is superseded by a block added in this sync.
    fn save_old_ptr(&self, cx: &Cx, old: BlockPointer) -> Result<()>;
}

/// One block recorded by [`BlockPutStateMemory`].
pub struct PutBlock {
    pub ptr: BlockPointer,
    pub block: Block,
    pub payload: Vec<u8>,
    pub synced: Option<SyncedCallback>,
}

impl fmt::Debug for PutBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutBlock")
            .field("ptr", &self.ptr)
            .field("payload_len", &self.payload.len())
            .field("has_synced", &self.synced.is_some())
            .finish_non_exhaustive()
    }
}

/// In-memory [`BlockPutState`].
#[derive(Debug, Default)]
pub struct BlockPutStateMemory {
    blocks: Mutex<Vec<PutBlock>>,
    old_ptrs: Mutex<Vec<BlockPointer>>,
}

impl BlockPutStateMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ptrs(&self) -> Vec<BlockPointer> {
        self.blocks.lock().iter().map(|put| put.ptr).collect()
    }

    #[must_use]
    pub fn old_ptrs(&self) -> Vec<BlockPointer> {
        self.old_ptrs.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }

    /// Run and drop every pending synced callback, as a completed upload
    /// would.
    pub fn synced_all(&self) -> Result<()> {
        let callbacks: Vec<SyncedCallback> = self
            .blocks
            .lock()
            .iter_mut()
            .filter_map(|put| put.synced.take())
            .collect();
        for callback in callbacks {
            callback()?;
        }
        Ok(())
    }

    pub fn into_blocks(self) -> Vec<PutBlock> {
        self.blocks.into_inner()
    }
}

impl BlockPutState for BlockPutStateMemory {
    fn add_new_block(
        &self,
        _cx: &Cx,
        ptr: BlockPointer,
        block: Block,
        payload: Vec<u8>,
        synced: Option<SyncedCallback>,
    ) -> Result<()> {
        self.blocks.lock().push(PutBlock {
            ptr,
            block,
            payload,
            synced,
        });
        Ok(())
    }

    fn save_old_ptr(&self, _cx: &Cx, old: BlockPointer) -> Result<()> {
        self.old_ptrs.lock().push(old);
        Ok(())
    }
}

/// Collaborators of [`BlockTree::ready`].
#[derive(Clone, Copy)]
pub struct ReadyDeps<'a> {
    /// Receives every readied block as a permanent entry.
    pub bcache: &'a dyn BlockCache,
    pub dirty: &'a dyn IsDirtyProvider,
    pub readier: &'a dyn Readier,
    pub bps: &'a dyn BlockPutState,
}

#[derive(Debug)]
struct ReadyFrame {
    ptr: BlockPointer,
    next: usize,
}

impl<B: TreeBlock> BlockTree<B> {
    /// Ready every dirty block below the root, children before parents.
    ///
    /// The walk only enters children `deps.dirty` reports as dirty. Each
    /// readied block is stored in the clean cache under its new pointer,
    /// handed to `deps.bps`, and its parent pointer is rewritten with the
    /// new info. The root itself is left to the caller. Leaves get a synced
    /// callback from `make_synced` when one is given. Subtrees rooted at a
    /// pointer in `exclude` are left untouched.
    ///
    /// Returns `old pointer -> new info` for every readied block.
    pub fn ready(
        &mut self,
        cx: &Cx,
        deps: ReadyDeps<'_>,
        exclude: &HashSet<BlockPointer>,
        make_synced: Option<&dyn Fn(BlockPointer) -> SyncedCallback>,
    ) -> Result<HashMap<BlockPointer, BlockInfo>> {
        let mut readied = HashMap::new();
        let root = self.root;
        self.fetch(cx, &root, BlockReqType::Write)?;
        if !self.block(&root)?.is_indirect() {
            return Ok(readied);
        }
        let (tlf, branch) = (self.owner.tlf, self.owner.branch.clone());

        let mut leaves = 0_usize;
        let mut stack = vec![ReadyFrame { ptr: root, next: 0 }];
        while let Some(frame) = stack.last_mut() {
            cx_checkpoint(cx)?;
            if frame.next < self.block(&frame.ptr)?.num_indirect_ptrs() {
                let step = ParentBlockAndChildIndex::new(frame.ptr, frame.next);
                frame.next += 1;
                let child = self.child_ptr(&step)?;
                if exclude.contains(&child) || !deps.dirty.is_dirty(tlf, &child, &branch) {
                    continue;
                }
                self.fetch(cx, &child, BlockReqType::Write)?;
                if self.block(&child)?.is_indirect() {
                    stack.push(ReadyFrame {
                        ptr: child,
                        next: 0,
                    });
                    continue;
                }
                let synced = make_synced.map(|make| make(child));
                self.ready_child(cx, deps, step, synced, &mut readied)?;
                leaves += 1;
                continue;
            }
            stack.pop();
            if let Some(parent) = stack.last() {
                let step = ParentBlockAndChildIndex::new(parent.ptr, parent.next - 1);
                self.ready_child(cx, deps, step, None, &mut readied)?;
            }
        }
        debug!(
            target: "cafs::tree",
            root = %self.root,
            leaves,
            readied = readied.len(),
            "tree_readied"
        );
        Ok(readied)
    }

    /// Ready the child named by `step` and point its parent at the result.
    fn ready_child(
        &mut self,
        cx: &Cx,
        deps: ReadyDeps<'_>,
        step: ParentBlockAndChildIndex,
        synced: Option<SyncedCallback>,
        readied: &mut HashMap<BlockPointer, BlockInfo>,
    ) -> Result<()> {
        let old = self.child_ptr(&step)?;
        let info = self.ready_one(cx, deps, &old, synced)?;
        self.block_mut(&step.ptr)?
            .set_indirect_ptr_info(step.child_index, info);
        self.cache(cx, &step.ptr)?;
        readied.insert(old, info);
        Ok(())
    }

    fn ready_one(
        &mut self,
        cx: &Cx,
        deps: ReadyDeps<'_>,
        old: &BlockPointer,
        synced: Option<SyncedCallback>,
    ) -> Result<BlockInfo> {
        let block = self.block(old)?;
        let is_indirect = block.is_indirect();
        let data_ver = block.data_version();
        let encoded = deps.readier.ready_block(cx, &block.to_block())?;
        if encoded.plain_size > encoded.payload.len() {
            return Err(CafsError::ReadyTooLarge {
                plain: encoded.plain_size,
                payload: encoded.payload.len(),
            });
        }
        let encoded_size = u32::try_from(encoded.payload.len())
            .map_err(|_| CafsError::BadData(format!("payload of {old} exceeds u32")))?;
        let ptr = BlockPointer {
            id: encoded.id,
            key_gen: self.owner.key_gen,
            data_ver,
            direct_type: if is_indirect {
                DirectType::Indirect
            } else {
                DirectType::Direct
            },
            context: BlockContext::first(self.owner.charged_to, self.root.context.block_type),
        };

        let block = self.block_mut(old)?;
        block.set_encoded_size(encoded_size);
        let stored = block.to_block();
        deps.bcache.put(
            ptr,
            self.owner.tlf,
            stored.clone(),
            CacheLifetime::Permanent,
            HashBehavior::SkipCacheHash,
        )?;
        deps.bps
            .add_new_block(cx, ptr, stored, encoded.payload, synced)?;
        deps.bps.save_old_ptr(cx, *old)?;
        trace!(target: "cafs::tree", old = %old, new = %ptr, size = encoded_size, "block_readied");
        Ok(BlockInfo::new(ptr, encoded_size))
    }
}
