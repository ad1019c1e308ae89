//! Name-keyed view of a directory block tree.
//!
//! Leaves hold sorted entries; interior pointers are keyed by the first
//! name routed to each child. A leaf that grows past the splitter's entry
//! limit is cut in half and the right half is slotted in next to it.

use asupersync::Cx;
use cafs_block::{BlockSplitter, DirBlock, DirEntry, EntryInfo, IsDirtyProvider, TreeBlock};
use cafs_error::{CafsError, Result};
use cafs_tree::{
    BlockAtOffset, BlockGetter, BlockTree, DirtyBlockCacher, ParentBlockAndChildIndex, ReadyDeps,
    TreeOwner,
};
use cafs_types::{BlockInfo, BlockPointer, BlockReqType, DataVer, Offset, StringOffset};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// A directory's entries as a block tree.
#[derive(Debug)]
pub struct DirData {
    tree: BlockTree<DirBlock>,
}

impl DirData {
    pub fn new(
        root: BlockPointer,
        owner: TreeOwner,
        bsplit: Arc<dyn BlockSplitter>,
        getter: Arc<dyn BlockGetter<DirBlock>>,
        cacher: Arc<dyn DirtyBlockCacher<DirBlock>>,
    ) -> Self {
        Self {
            tree: BlockTree::new(root, owner, bsplit, getter, cacher),
        }
    }

    #[must_use]
    pub fn root_ptr(&self) -> BlockPointer {
        self.tree.root_ptr()
    }

    #[must_use]
    pub fn tree(&self) -> &BlockTree<DirBlock> {
        &self.tree
    }

    fn end_op<T>(&mut self, cx: &Cx, result: Result<T>) -> Result<T> {
        let flushed = self.tree.finish_op(cx);
        let value = result?;
        flushed.map(|()| value)
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Every entry in the directory, by name.
    pub fn get_entries(&mut self, cx: &Cx) -> Result<BTreeMap<String, DirEntry>> {
        self.tree.begin_op();
        let result = self.entries_in_op(cx);
        self.end_op(cx, result)
    }

    /// Metadata of every entry, by name.
    pub fn get_children(&mut self, cx: &Cx) -> Result<BTreeMap<String, EntryInfo>> {
        let entries = self.get_entries(cx)?;
        Ok(entries
            .into_iter()
            .map(|(name, de)| (name, de.entry_info))
            .collect())
    }

    fn entries_in_op(&mut self, cx: &Cx) -> Result<BTreeMap<String, DirEntry>> {
        let root = self.tree.root_ptr();
        self.tree.fetch_root(cx, BlockReqType::Read)?;
        if !self.tree.root_block()?.is_indirect() {
            return Ok(self.tree.root_block()?.children.clone());
        }

        let range =
            self.tree
                .get_blocks_for_offset_range(cx, &StringOffset::first(), None, false, true)?;
        let mut entries = BTreeMap::new();
        for path in &range.paths {
            let step = path
                .last()
                .ok_or_else(|| CafsError::BadData(format!("empty path to child of {root}")))?;
            let leaf = self.tree.child_ptr(step)?;
            entries.extend(
                self.tree
                    .block(&leaf)?
                    .children
                    .iter()
                    .map(|(name, de)| (name.clone(), de.clone())),
            );
        }
        trace!(
            target: "cafs::dir",
            root = %root,
            leaves = range.paths.len(),
            entries = entries.len(),
            "dir_entries"
        );
        Ok(entries)
    }

    /// The entry called `name`.
    pub fn lookup(&mut self, cx: &Cx, name: &str) -> Result<DirEntry> {
        self.tree.begin_op();
        let result = self
            .tree
            .get_block_at_offset(cx, &StringOffset::from(name), BlockReqType::Read)
            .and_then(|at| {
                self.tree
                    .block(&at.ptr)?
                    .children
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CafsError::NoSuchName(name.to_owned()))
            });
        self.end_op(cx, result)
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    /// Add a new entry, splitting its leaf if it grows too large. Returns
    /// the readied infos superseded by the change.
    pub fn add_entry(&mut self, cx: &Cx, name: &str, de: DirEntry) -> Result<Vec<BlockInfo>> {
        self.tree.begin_op();
        let result = self.add_entry_in_op(cx, name, de);
        self.end_op(cx, result)
    }

    fn add_entry_in_op(&mut self, cx: &Cx, name: &str, de: DirEntry) -> Result<Vec<BlockInfo>> {
        let at = self.leaf_for_write(cx, name)?;
        let children = &mut self.tree.block_mut(&at.ptr)?.children;
        if children.contains_key(name) {
            return Err(CafsError::NameExists(name.to_owned()));
        }
        children.insert(name.to_owned(), de);
        debug!(target: "cafs::dir", leaf = %at.ptr, name, "dir_entry_added");
        self.process_modified_block(cx, at)
    }

    /// Replace the entry called `name`, which must exist.
    pub fn update_entry(&mut self, cx: &Cx, name: &str, de: DirEntry) -> Result<Vec<BlockInfo>> {
        self.tree.begin_op();
        let result = self.update_entry_in_op(cx, name, de);
        self.end_op(cx, result)
    }

    fn update_entry_in_op(&mut self, cx: &Cx, name: &str, de: DirEntry) -> Result<Vec<BlockInfo>> {
        let at = self.leaf_for_write(cx, name)?;
        let Some(slot) = self.tree.block_mut(&at.ptr)?.children.get_mut(name) else {
            return Err(CafsError::NoSuchName(name.to_owned()));
        };
        *slot = de;
        trace!(target: "cafs::dir", leaf = %at.ptr, name, "dir_entry_updated");
        self.process_modified_block(cx, at)
    }

    /// Remove the entry called `name`. Removing a missing name only
    /// dirties the path to the leaf it would live in. Leaves are never
    /// merged, so a leaf may be left empty.
    pub fn remove_entry(&mut self, cx: &Cx, name: &str) -> Result<Vec<BlockInfo>> {
        self.tree.begin_op();
        let result = self.remove_entry_in_op(cx, name);
        self.end_op(cx, result)
    }

    fn remove_entry_in_op(&mut self, cx: &Cx, name: &str) -> Result<Vec<BlockInfo>> {
        let at = self.leaf_for_write(cx, name)?;
        if self
            .tree
            .block_mut(&at.ptr)?
            .children
            .remove(name)
            .is_none()
        {
            trace!(target: "cafs::dir", leaf = %at.ptr, name, "dir_remove_missing");
        }
        self.process_modified_block(cx, at)
    }

    fn leaf_for_write(&mut self, cx: &Cx, name: &str) -> Result<BlockAtOffset<StringOffset>> {
        self.tree
            .get_block_at_offset(cx, &StringOffset::from(name), BlockReqType::Write)
    }

    /// Split the modified leaf if needed, then dirty it and every block
    /// above it.
    fn process_modified_block(
        &mut self,
        cx: &Cx,
        at: BlockAtOffset<StringOffset>,
    ) -> Result<Vec<BlockInfo>> {
        let root = self.tree.root_ptr();
        let mut ptr = at.ptr;
        let mut parents = at.parents;
        let mut unrefs = Vec::new();

        let block = self.tree.block(&ptr)?.clone();
        let (mut halves, split_off) = self.tree.splitter().split_dir_if_needed(block)?;
        let right = if halves.len() > 1 { halves.pop() } else { None };
        let left = halves.pop().ok_or(CafsError::BadSplit)?;
        *self.tree.block_mut(&ptr)? = left;

        match (right, split_off) {
            (None, _) => {}
            (Some(right), Some(split_off)) => {
                debug!(
                    target: "cafs::dir",
                    root = %root,
                    leaf = %ptr,
                    split_off = %split_off,
                    "dir_leaf_split"
                );
                let was_direct_root = parents.is_empty();
                let nrb =
                    self.tree
                        .new_right_block(cx, &mut parents, split_off, DataVer::FIRST_VALID)?;
                if let Some(moved) = nrb.new_level {
                    if was_direct_root {
                        ptr = moved;
                    }
                }
                let new_leaf = self.new_leaf_ptr(&nrb.right_parents)?;
                *self.tree.block_mut(&new_leaf)? = right;
                self.tree.cache(cx, &new_leaf)?;
                // The new leaf was appended at the right edge; move it next
                // to the block it was split from.
                let shifted = self.tree.shift_blocks_to_fill_hole(cx, nrb.right_parents)?;
                unrefs.extend(shifted.unrefs);
            }
            (Some(_), None) => return Err(CafsError::BadSplit),
        }

        self.tree.cache(cx, &ptr)?;
        let marked = self.tree.mark_parents_dirty(cx, &parents)?;
        unrefs.extend(marked.unrefs);
        self.tree.fetch_root(cx, BlockReqType::Write)?;
        self.tree.cache(cx, &root)?;
        Ok(unrefs)
    }

    fn new_leaf_ptr(&self, right_parents: &[ParentBlockAndChildIndex]) -> Result<BlockPointer> {
        let last = right_parents.last().ok_or_else(|| {
            CafsError::BadData(format!(
                "new block in {} has no parent",
                self.tree.root_ptr()
            ))
        })?;
        self.tree.child_ptr(last)
    }

    // ── Sync preparation ────────────────────────────────────────────────────

    /// Ready every dirty block below the root.
    pub fn ready(
        &mut self,
        cx: &Cx,
        deps: ReadyDeps<'_>,
    ) -> Result<HashMap<BlockPointer, BlockInfo>> {
        self.tree.begin_op();
        let result = self.tree.ready(cx, deps, &HashSet::new(), None);
        self.end_op(cx, result)
    }

    /// Pointers to every dirty block below the root.
    pub fn get_dirty_child_ptrs(
        &mut self,
        cx: &Cx,
        dirty: &dyn IsDirtyProvider,
    ) -> Result<HashSet<BlockPointer>> {
        self.tree.begin_op();
        let result = self.dirty_child_ptrs_in_op(cx, dirty);
        self.end_op(cx, result)
    }

    fn dirty_child_ptrs_in_op(
        &mut self,
        cx: &Cx,
        dirty: &dyn IsDirtyProvider,
    ) -> Result<HashSet<BlockPointer>> {
        let mut ptrs = HashSet::new();
        self.tree.fetch_root(cx, BlockReqType::Read)?;
        if !self.tree.root_block()?.is_indirect() {
            return Ok(ptrs);
        }
        let mut off = Some(StringOffset::first());
        while let Some(cur) = off {
            let Some(at) =
                self.tree
                    .get_next_dirty_block_at_offset(cx, &cur, BlockReqType::Lookup, dirty)?
            else {
                break;
            };
            for step in &at.parents {
                ptrs.insert(self.tree.child_ptr(step)?);
            }
            off = at.next_block_start;
        }
        Ok(ptrs)
    }

    /// Infos of every block below the root.
    pub fn get_indirect_dir_block_infos(&mut self, cx: &Cx) -> Result<Vec<BlockInfo>> {
        self.tree.begin_op();
        let result = self.tree.get_indirect_block_infos(cx);
        self.end_op(cx, result)
    }
}
