//! Structural edits: growing to the right, shifting blocks into holes,
//! propagating offsets and dirtiness toward the root.

use crate::{BlockTree, ParentBlockAndChildIndex};
use asupersync::Cx;
use cafs_block::TreeBlock;
use cafs_error::{CafsError, Result};
use cafs_types::{BlockInfo, BlockPointer, BlockReqType, DataVer, DirectType, Offset};
use tracing::{debug, trace};

/// Pointers cached and infos unreferenced by one structural edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtiedPtrs {
    pub dirty_ptrs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockInfo>,
}

impl DirtiedPtrs {
    pub fn absorb(&mut self, other: Self) {
        self.dirty_ptrs.extend(other.dirty_ptrs);
        self.unrefs.extend(other.unrefs);
    }
}

/// Result of [`BlockTree::new_right_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRightBlock {
    /// Path from the root to the new, empty leaf.
    pub right_parents: Vec<ParentBlockAndChildIndex>,
    pub dirty_ptrs: Vec<BlockPointer>,
    /// Set when the tree grew a level: the pointer the old top block now
    /// lives under. The root pointer itself never changes.
    pub new_level: Option<BlockPointer>,
}

/// Result of [`BlockTree::shift_blocks_to_fill_hole`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShiftOutcome {
    pub dirty_ptrs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockInfo>,
    /// Bytes of previously synced leaves that became dirty again.
    pub newly_dirtied_child_bytes: i64,
}

impl<B: TreeBlock> BlockTree<B> {
    /// Append a new empty leaf starting at `off` to the right edge of the
    /// tree.
    ///
    /// `parents` is the path to the current rightmost leaf. The deepest
    /// ancestor with room receives the new pointer and any levels below it
    /// are created fresh. When every ancestor is full the tree grows a
    /// level: the old top block moves to a new pointer that becomes the
    /// first child of a new top block stored under the unchanged root
    /// pointer, and `parents` is rewritten to match.
    pub fn new_right_block(
        &mut self,
        cx: &Cx,
        parents: &mut Vec<ParentBlockAndChildIndex>,
        off: B::Offset,
        data_ver: DataVer,
    ) -> Result<NewRightBlock> {
        let mut dirty_ptrs = Vec::new();
        let mut new_level = None;
        let lowest = match self.lowest_ancestor_with_room(parents) {
            Some(lowest) => lowest,
            None => {
                let moved = self.grow_level(cx, data_ver)?;
                dirty_ptrs.push(moved);
                if let Some(first) = parents.first_mut() {
                    first.ptr = moved;
                }
                parents.insert(0, ParentBlockAndChildIndex::new(self.root, 0));
                new_level = Some(moved);
                0
            }
        };

        let depth = parents.len();
        let mut right_parents = parents.clone();
        let mut pblock = parents[lowest].ptr;
        for (i, right) in right_parents.iter_mut().enumerate().skip(lowest) {
            let is_leaf = i == depth - 1;
            let direct_type = if is_leaf {
                DirectType::Direct
            } else {
                DirectType::Indirect
            };
            let new_ptr = self.new_ptr(data_ver, direct_type);
            let parent = self.block_mut(&pblock)?;
            parent.append_new_indirect_ptr(new_ptr, off.clone());
            *right = ParentBlockAndChildIndex::new(pblock, parent.num_indirect_ptrs() - 1);
            self.insert_new(new_ptr, B::new_empty(!is_leaf));
            self.cache(cx, &new_ptr)?;
            dirty_ptrs.push(new_ptr);
            pblock = new_ptr;
        }

        for (i, step) in parents.iter().enumerate().take(lowest + 1) {
            self.cache(cx, &step.ptr)?;
            dirty_ptrs.push(step.ptr);
            let num = self.block(&step.ptr)?.num_indirect_ptrs();
            right_parents[i] = ParentBlockAndChildIndex::new(step.ptr, num - 1);
        }

        debug!(
            target: "cafs::tree",
            root = %self.root,
            depth,
            lowest,
            grew = new_level.is_some(),
            off = ?off,
            "new_right_block"
        );
        Ok(NewRightBlock {
            right_parents,
            dirty_ptrs,
            new_level,
        })
    }

    /// Move the current top block under a fresh pointer and install a new
    /// indirect top with that pointer as its only child.
    fn grow_level(&mut self, cx: &Cx, data_ver: DataVer) -> Result<BlockPointer> {
        let was_indirect = self.root_block()?.is_indirect();
        let direct_type = if was_indirect {
            DirectType::Indirect
        } else {
            DirectType::Direct
        };
        let moved = self.new_ptr(data_ver, direct_type);
        self.move_root_block(moved)?;
        let mut top = B::new_empty(true);
        top.append_new_indirect_ptr(moved, B::Offset::first());
        let root = self.root;
        self.insert_new(root, top);
        self.cache(cx, &root)?;
        self.cache(cx, &moved)?;
        debug!(target: "cafs::tree", root = %root, moved = %moved, "tree_grew_level");
        Ok(moved)
    }

    /// Rewrite the offset of every ancestor whose leftmost descendant is the
    /// block at `curr_index` under the last step of `parents`, and re-cache
    /// the blocks on the path.
    pub fn set_parent_offsets(
        &mut self,
        cx: &Cx,
        new_off: &B::Offset,
        parents: &[ParentBlockAndChildIndex],
        mut curr_index: usize,
    ) -> Result<DirtiedPtrs> {
        let mut out = DirtiedPtrs::default();
        for level in (0..parents.len().saturating_sub(1)).rev() {
            let step = parents[level];
            let (child_info, _) = self.child(&step)?;
            let child = parents[level + 1].ptr;
            if child_info.encoded_size != 0 {
                out.unrefs.push(child_info);
                self.block_mut(&step.ptr)?.clear_indirect_ptr_size(step.child_index);
            }
            self.cache(cx, &child)?;
            out.dirty_ptrs.push(child);
            if curr_index > 0 {
                break;
            }
            curr_index = step.child_index;
            self.block_mut(&step.ptr)?
                .set_indirect_ptr_off(curr_index, new_off.clone());
        }
        Ok(out)
    }

    /// Swap a newly appended leaf leftward until sibling offsets ascend
    /// again, crossing into the rightmost leaf of the left cousin subtree
    /// whenever the leaf reaches index 0 of its parent.
    pub fn shift_blocks_to_fill_hole(
        &mut self,
        cx: &Cx,
        mut parents: Vec<ParentBlockAndChildIndex>,
    ) -> Result<ShiftOutcome> {
        let mut out = ShiftOutcome::default();
        let Some(last) = parents.last().copied() else {
            return Ok(out);
        };
        let mut curr = last.child_index;
        let (_, new_start) = self.child(&last)?;
        let mut looped_once = false;
        loop {
            let immed = parents
                .last()
                .map(|step| step.ptr)
                .ok_or_else(|| CafsError::BadData("empty shift path".to_owned()))?;
            let mut cousin_path = None;
            let left_off = if curr > 0 {
                self.child(&ParentBlockAndChildIndex::new(immed, curr - 1))?.1
            } else {
                if looped_once {
                    let (_, off) = self.child(&ParentBlockAndChildIndex::new(immed, curr))?;
                    let fixed = self.set_parent_offsets(cx, &off, &parents, curr)?;
                    out.dirty_ptrs.extend(fixed.dirty_ptrs);
                    out.unrefs.extend(fixed.unrefs);
                }
                let Some((path, left_off)) = self.left_cousin_path(cx, &parents)? else {
                    return Ok(out);
                };
                cousin_path = Some(path);
                left_off
            };
            looped_once = true;

            if left_off < new_start {
                return Ok(out);
            }

            if curr > 0 {
                self.swap_entries(&immed, curr - 1, &immed, curr)?;
                curr -= 1;
                continue;
            }

            let Some(cousin_path) = cousin_path else {
                return Ok(out);
            };
            let new_immed = cousin_path[cousin_path.len() - 1];
            self.swap_entries(&new_immed.ptr, new_immed.child_index, &immed, curr)?;
            trace!(
                target: "cafs::tree",
                from = %immed,
                to = %new_immed.ptr,
                "shift_into_cousin"
            );

            if cousin_path.len() > 1 {
                let new_parent = new_immed.ptr;
                self.cache(cx, &new_parent)?;
                out.dirty_ptrs.push(new_parent);

                let last_index = self.block(&immed)?.num_indirect_ptrs() - 1;
                let last_step = ParentBlockAndChildIndex::new(immed, last_index);
                let (right_leaf, _) = self.child(&last_step)?;
                self.fetch(cx, &right_leaf.ptr, BlockReqType::Write)?;
                self.cache(cx, &right_leaf.ptr)?;
                out.dirty_ptrs.push(right_leaf.ptr);
                if right_leaf.encoded_size != 0 {
                    out.newly_dirtied_child_bytes +=
                        self.block(&right_leaf.ptr)?.bytes_can_be_dirtied();
                    out.unrefs.push(right_leaf);
                    self.block_mut(&immed)?.clear_indirect_ptr_size(last_index);
                }
            }

            let (_, right_off) = self.child(&ParentBlockAndChildIndex::new(immed, curr))?;
            let fixed = self.set_parent_offsets(cx, &right_off, &parents, curr)?;
            out.dirty_ptrs.extend(fixed.dirty_ptrs);
            out.unrefs.extend(fixed.unrefs);

            curr = new_immed.child_index;
            parents = cousin_path;
        }
    }

    /// Path to the rightmost leaf of the nearest subtree to the left of
    /// `parents`, plus that leaf's offset.
    fn left_cousin_path(
        &mut self,
        cx: &Cx,
        parents: &[ParentBlockAndChildIndex],
    ) -> Result<Option<(Vec<ParentBlockAndChildIndex>, B::Offset)>> {
        let depth = parents.len();
        let Some(mut level) = (0..depth.saturating_sub(1))
            .rev()
            .find(|&level| parents[level].child_index > 0)
        else {
            return Ok(None);
        };
        let mut path = parents.to_vec();
        path[level].child_index -= 1;
        let mut left_off = None;
        while level < depth - 1 {
            let next = self.child_ptr(&path[level])?;
            self.fetch(cx, &next, BlockReqType::Write)?;
            let block = self.block(&next)?;
            let last = block.num_indirect_ptrs().checked_sub(1).ok_or_else(|| {
                CafsError::BadData(format!("indirect block {next} has no children"))
            })?;
            left_off = block.indirect_ptr(last).map(|(_, off)| off);
            path[level + 1] = ParentBlockAndChildIndex::new(next, last);
            level += 1;
        }
        Ok(left_off.map(|off| (path, off)))
    }

    /// Cache every block on `parents` and clear the encoded size of each
    /// child pointer the path passes through, since those children are
    /// about to be re-readied.
    pub fn mark_parents_dirty(
        &mut self,
        cx: &Cx,
        parents: &[ParentBlockAndChildIndex],
    ) -> Result<DirtiedPtrs> {
        let mut out = DirtiedPtrs::default();
        for step in parents {
            let (child_info, _) = self.child(step)?;
            if child_info.encoded_size != 0 {
                out.unrefs.push(child_info);
                self.block_mut(&step.ptr)?
                    .clear_indirect_ptr_size(step.child_index);
            }
            self.cache(cx, &step.ptr)?;
            out.dirty_ptrs.push(step.ptr);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::{MemStore, clean_file, tree};
    use crate::ParentBlockAndChildIndex;
    use asupersync::Cx;
    use cafs_block::{BlockSplitterSimple, FileBlock, TreeBlock};
    use cafs_types::{BlockInfo, BlockPointer, BlockReqType, DataVer, DirectType, Int64Offset};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn offsets(t: &crate::BlockTree<FileBlock>, ptr: &BlockPointer) -> Vec<i64> {
        let block = t.block(ptr).expect("loaded");
        (0..block.num_indirect_ptrs())
            .map(|i| block.indirect_ptr(i).expect("ptr").1.0)
            .collect()
    }

    #[test]
    fn new_right_block_uses_room_in_parent() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, _) = clean_file(&store, &[(0, b"ab")]);
        let mut t = tree(&store, root);
        t.begin_op();
        let mut parents = t
            .get_block_at_offset(&cx, &Int64Offset(0), BlockReqType::Write)
            .expect("lookup")
            .parents;
        let nrb = t
            .new_right_block(&cx, &mut parents, Int64Offset(2), DataVer::FIRST_VALID)
            .expect("new block");
        assert!(nrb.new_level.is_none());
        assert_eq!(nrb.right_parents, vec![ParentBlockAndChildIndex::new(root, 1)]);
        assert_eq!(offsets(&t, &root), vec![0, 2]);
        let leaf = t.child_ptr(&nrb.right_parents[0]).expect("leaf");
        assert!(leaf.id.is_temporary());
        assert_eq!(leaf.direct_type, DirectType::Direct);
        assert!(store.dirty_block(&leaf).is_some());
        assert!(store.dirty_block(&root).is_some());
    }

    #[test]
    fn new_right_block_grows_a_level_when_full() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = clean_file(&store, &[(0, b"ab"), (2, b"cd")]);
        let mut t = tree(&store, root);
        t.begin_op();
        let mut parents = t
            .get_block_at_offset(&cx, &Int64Offset(3), BlockReqType::Write)
            .expect("lookup")
            .parents;
        let nrb = t
            .new_right_block(&cx, &mut parents, Int64Offset(4), DataVer::FIRST_VALID)
            .expect("new block");
        let moved = nrb.new_level.expect("grew");
        assert_eq!(
            parents,
            vec![
                ParentBlockAndChildIndex::new(root, 0),
                ParentBlockAndChildIndex::new(moved, 1),
            ]
        );
        assert_eq!(offsets(&t, &root), vec![0, 4]);
        assert_eq!(offsets(&t, &moved), vec![0, 2]);
        assert_eq!(t.child_ptr(&parents[1]).expect("leaf"), leaves[1]);
        assert_eq!(nrb.right_parents.len(), 2);
        assert_eq!(nrb.right_parents[0], ParentBlockAndChildIndex::new(root, 1));
        let mid = nrb.right_parents[1].ptr;
        assert!(t.block(&mid).expect("mid").is_indirect());
        assert_eq!(offsets(&t, &mid), vec![4]);
        t.finish_op(&cx).expect("finish");
        assert!(store.dirty_block(&moved).is_some());
        assert!(store.dirty_block(&mid).is_some());
    }

    #[test]
    fn new_right_block_over_direct_root() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let root = crate::testing::ptr(DirectType::Direct);
        store
            .clean
            .lock()
            .insert(root.ref_ptr(), FileBlock::with_contents(b"ab".to_vec()));
        let mut t = tree(&store, root);
        t.begin_op();
        t.fetch_root(&cx, BlockReqType::Write).expect("root");
        let mut parents = Vec::new();
        let nrb = t
            .new_right_block(&cx, &mut parents, Int64Offset(2), DataVer::FIRST_VALID)
            .expect("new block");
        let moved = nrb.new_level.expect("grew");
        assert_eq!(t.block(&moved).expect("moved").contents(), b"ab");
        assert_eq!(offsets(&t, &root), vec![0, 2]);
        assert_eq!(t.root_ptr(), root);
        assert_eq!(nrb.right_parents, vec![ParentBlockAndChildIndex::new(root, 1)]);
    }

    #[test]
    fn shift_crosses_into_left_cousin() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        // Leaves at 0 and 6 fill the root; a new block for 3 lands in a new
        // subtree on the right and is shifted back into the left one.
        let (root, leaves) = clean_file(&store, &[(0, b"ab"), (6, b"gh")]);
        let mut t = tree(&store, root);
        t.begin_op();
        t.fetch_root(&cx, BlockReqType::Write).expect("root");
        let mut parents = vec![ParentBlockAndChildIndex::new(root, 1)];
        assert_eq!(t.lowest_ancestor_with_room(&parents), None);
        let nrb = t
            .new_right_block(&cx, &mut parents, Int64Offset(3), DataVer::FIRST_VALID)
            .expect("new block");
        let shifted = t
            .shift_blocks_to_fill_hole(&cx, nrb.right_parents)
            .expect("shift");
        assert!(shifted.unrefs.is_empty());
        // root -> [moved(0..), mid(3)]; after the shift offsets ascend.
        let moved = nrb.new_level.expect("grew");
        let mid = t.child_ptr(&ParentBlockAndChildIndex::new(root, 1)).expect("mid");
        assert_eq!(offsets(&t, &moved), vec![0, 3]);
        assert_eq!(offsets(&t, &mid), vec![6]);
        assert_eq!(offsets(&t, &root), vec![0, 6]);
        assert_eq!(
            t.child_ptr(&ParentBlockAndChildIndex::new(mid, 0)).expect("leaf"),
            leaves[1]
        );
    }

    #[test]
    fn mark_parents_dirty_collects_unrefs() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = clean_file(&store, &[(0, b"ab"), (2, b"cd")]);
        let mut t = tree(&store, root);
        t.begin_op();
        t.fetch_root(&cx, BlockReqType::Write).expect("root");
        t.block_mut(&root)
            .expect("root")
            .set_indirect_ptr_info(1, BlockInfo::new(leaves[1], 40));
        let parents = [ParentBlockAndChildIndex::new(root, 1)];
        let marked = t.mark_parents_dirty(&cx, &parents).expect("mark");
        assert_eq!(marked.unrefs, vec![BlockInfo::new(leaves[1], 40)]);
        assert_eq!(marked.dirty_ptrs, vec![root]);
        assert_eq!(
            t.child(&parents[0]).expect("child").0.encoded_size,
            0
        );
    }

    #[test]
    fn set_parent_offsets_stops_at_first_non_leftmost_level() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, _) = clean_file(&store, &[(0, b"ab"), (2, b"cd")]);
        let mut t = tree(&store, root);
        t.begin_op();
        let mut parents = t
            .get_block_at_offset(&cx, &Int64Offset(3), BlockReqType::Write)
            .expect("lookup")
            .parents;
        let nrb = t
            .new_right_block(&cx, &mut parents, Int64Offset(4), DataVer::FIRST_VALID)
            .expect("new block");
        // The new leaf is child 0 of a new interior block, itself child 1
        // of the root: the root's offset for it follows the leaf.
        t.set_parent_offsets(&cx, &Int64Offset(5), &nrb.right_parents, 0)
            .expect("offsets");
        assert_eq!(offsets(&t, &root), vec![0, 5]);
        // A non-zero index touches nothing above the leaf's parent.
        t.set_parent_offsets(&cx, &Int64Offset(9), &parents, 1)
            .expect("offsets");
        assert_eq!(offsets(&t, &root), vec![0, 5]);
    }

    fn load(store: &MemStore, ptr: &BlockPointer) -> FileBlock {
        store
            .dirty_block(ptr)
            .or_else(|| store.clean.lock().get(&ptr.ref_ptr()).cloned())
            .expect("block present")
    }

    /// Leaf offsets under `ptr`, asserting fan-out and that every child
    /// offset ascends within `[low, high)`.
    fn check_subtree(
        store: &MemStore,
        ptr: BlockPointer,
        low: i64,
        high: Option<i64>,
        max_ptrs: usize,
        leaves: &mut Vec<i64>,
    ) {
        let block = load(store, &ptr);
        if !block.is_indirect() {
            leaves.push(low);
            return;
        }
        let n = block.num_indirect_ptrs();
        assert!((1..=max_ptrs).contains(&n), "{ptr} has {n} children");
        let children: Vec<(BlockInfo, Int64Offset)> = (0..n)
            .map(|i| block.indirect_ptr(i).expect("child"))
            .collect();
        assert!(children[0].1.0 >= low, "first child of {ptr} below its bound");
        for (i, (info, off)) in children.iter().enumerate() {
            let next = children.get(i + 1).map(|(_, next)| next.0).or(high);
            if let Some(next) = next {
                assert!(off.0 < next, "offsets of {ptr} out of order");
            }
            check_subtree(store, info.ptr, off.0, next, max_ptrs, leaves);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn inserted_blocks_keep_tree_ordered(
            offs in prop::collection::btree_set(1_i64..200, 1..32)
                .prop_map(|set| set.into_iter().collect::<Vec<_>>())
                .prop_shuffle(),
            max_ptrs in 2_usize..5,
        ) {
            let cx = Cx::for_testing();
            let store = Arc::new(MemStore::default());
            let (root, _) = clean_file(&store, &[(0, b"")]);
            let mut t = crate::BlockTree::new(
                root,
                crate::testing::owner(),
                Arc::new(BlockSplitterSimple::with_limits(1, max_ptrs, 0, 2)),
                Arc::clone(&store) as Arc<dyn crate::BlockGetter<FileBlock>>,
                Arc::clone(&store) as Arc<dyn crate::DirtyBlockCacher<FileBlock>>,
            );

            for off in &offs {
                t.begin_op();
                let at = t
                    .get_block_at_offset(&cx, &Int64Offset(*off), BlockReqType::Write)
                    .expect("lookup");
                let mut parents = at.parents;
                let nrb = t
                    .new_right_block(&cx, &mut parents, Int64Offset(*off), DataVer::FIRST_VALID)
                    .expect("new block");
                if at.next_block_start.is_some() {
                    t.shift_blocks_to_fill_hole(&cx, nrb.right_parents)
                        .expect("shift");
                }
                t.finish_op(&cx).expect("finish");
            }

            let mut leaves = Vec::new();
            check_subtree(&store, root, 0, None, max_ptrs, &mut leaves);
            let mut expected: Vec<i64> = offs.clone();
            expected.push(0);
            expected.sort_unstable();
            prop_assert_eq!(&leaves, &expected);

            t.begin_op();
            for off in &expected {
                let at = t
                    .get_block_at_offset(&cx, &Int64Offset(*off), BlockReqType::Read)
                    .expect("lookup");
                prop_assert_eq!(at.start_off.0, *off);
            }
            t.finish_op(&cx).expect("finish");
        }
    }
}

