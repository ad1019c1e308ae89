//! Read-side traversals: point lookup, dirty-only descent, range walks.

use crate::{BlockTree, ParentBlockAndChildIndex, cx_checkpoint};
use asupersync::Cx;
use cafs_block::{IsDirtyProvider, TreeBlock};
use cafs_error::{CafsError, Result};
use cafs_types::{BlockInfo, BlockPointer, BlockReqType, DirectType, Offset};
use std::collections::HashSet;
use tracing::{debug, trace};

/// A leaf located by offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAtOffset<O> {
    /// The leaf; its block is loaded in the tree's arena.
    pub ptr: BlockPointer,
    /// Steps from the root down to the leaf's parent. Empty when the root
    /// is itself the leaf.
    pub parents: Vec<ParentBlockAndChildIndex>,
    /// Offset at which the leaf starts.
    pub start_off: O,
    /// Start of the block after the leaf, if any.
    pub next_block_start: Option<O>,
    pub was_dirty: bool,
}

/// Leaves intersecting an offset range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetRange<O> {
    /// One path per leaf, ascending by offset. The last step of each path
    /// names the leaf.
    pub paths: Vec<Vec<ParentBlockAndChildIndex>>,
    /// Start of the first block past the end of the range, if any.
    pub next_block_offset: Option<O>,
}

#[derive(Debug)]
struct DirtyFrame {
    ptr: BlockPointer,
    next: usize,
    checked_prev: bool,
}

#[derive(Debug)]
struct RangeFrame {
    ptr: BlockPointer,
    next: usize,
}

impl<B: TreeBlock> BlockTree<B> {
    /// Descend to the leaf covering `off`, taking at each level the
    /// rightmost child whose offset is `<= off`.
    pub fn get_block_at_offset(
        &mut self,
        cx: &Cx,
        off: &B::Offset,
        req: BlockReqType,
    ) -> Result<BlockAtOffset<B::Offset>> {
        let mut ptr = self.root;
        let mut was_dirty = self.fetch(cx, &ptr, req)?;
        let mut parents = Vec::new();
        let mut start_off = B::Offset::first();
        let mut next_block_start = None;
        loop {
            let block = self.block(&ptr)?;
            if !block.is_indirect() {
                break;
            }
            let n = block.num_indirect_ptrs();
            if n == 0 {
                return Err(CafsError::BadData(format!(
                    "indirect block {ptr} has no children"
                )));
            }
            let mut index = n - 1;
            for i in 0..n {
                let Some((_, child_off)) = block.indirect_ptr(i) else {
                    break;
                };
                if child_off == *off {
                    index = i;
                    break;
                }
                if *off < child_off {
                    index = i.saturating_sub(1);
                    break;
                }
            }
            if let Some((_, next)) = block.indirect_ptr(index + 1) {
                next_block_start = Some(next);
            }
            let step = ParentBlockAndChildIndex::new(ptr, index);
            let (info, child_off) = self.child(&step)?;
            parents.push(step);
            start_off = child_off;
            ptr = info.ptr;
            was_dirty = self.fetch(cx, &ptr, req)?;
        }
        Ok(BlockAtOffset {
            ptr,
            parents,
            start_off,
            next_block_start,
            was_dirty,
        })
    }

    /// Find the first dirty leaf at or after `off`, entering only children
    /// that `dirty` reports as dirty.
    ///
    /// A dirty leaf immediately to the left of `off` is preferred when the
    /// child exactly at `off` was not matched, so a write that started
    /// mid-block is not skipped.
    pub fn get_next_dirty_block_at_offset(
        &mut self,
        cx: &Cx,
        off: &B::Offset,
        req: BlockReqType,
        dirty: &dyn IsDirtyProvider,
    ) -> Result<Option<BlockAtOffset<B::Offset>>> {
        let root = self.root;
        let (tlf, branch) = (self.owner.tlf, self.owner.branch.clone());
        let is_dirty = |ptr: &BlockPointer| dirty.is_dirty(tlf, ptr, &branch);
        if !is_dirty(&root) {
            return Ok(None);
        }
        self.fetch(cx, &root, req)?;
        if !self.block(&root)?.is_indirect() {
            return Ok(Some(BlockAtOffset {
                ptr: root,
                parents: Vec::new(),
                start_off: B::Offset::first(),
                next_block_start: None,
                was_dirty: true,
            }));
        }

        let mut stack = vec![DirtyFrame {
            ptr: root,
            next: 0,
            checked_prev: false,
        }];
        let mut parents: Vec<ParentBlockAndChildIndex> = Vec::new();
        while let Some(frame) = stack.last_mut() {
            let block = self.block(&frame.ptr)?;
            let n = block.num_indirect_ptrs();
            if frame.next >= n {
                stack.pop();
                parents.pop();
                continue;
            }
            let i = frame.next;
            let Some((info, iptr_off)) = block.indirect_ptr(i) else {
                return Err(CafsError::BadData(format!("no pointer {i} in {}", frame.ptr)));
            };
            let iptr_less = iptr_off < *off;
            if iptr_less && i != n - 1 {
                frame.next += 1;
                continue;
            }
            if iptr_less || iptr_off == *off {
                frame.checked_prev = true;
            }
            let prev_dirty = !frame.checked_prev
                && i > 0
                && block
                    .indirect_ptr(i - 1)
                    .is_some_and(|(prev, _)| prev.ptr.is_initialized() && is_dirty(&prev.ptr));
            let index = if prev_dirty {
                // Revisit `i` if the left sibling turns out to hold nothing.
                Some(i - 1)
            } else {
                frame.next += 1;
                is_dirty(&info.ptr).then_some(i)
            };
            frame.checked_prev = true;
            let Some(index) = index else {
                continue;
            };
            let parent = frame.ptr;
            let step = ParentBlockAndChildIndex::new(parent, index);
            let (child, child_off) = self.child(&step)?;
            self.fetch(cx, &child.ptr, req)?;
            parents.push(step);
            if self.block(&child.ptr)?.is_indirect() {
                stack.push(DirtyFrame {
                    ptr: child.ptr,
                    next: 0,
                    checked_prev: false,
                });
                continue;
            }

            if self.block(&child.ptr)?.offset_exceeds_data(&child_off, off) {
                return Ok(None);
            }
            let next_block_start = self.next_start_after(&parents)?;
            trace!(target: "cafs::tree", ptr = %child.ptr, "next_dirty_block");
            return Ok(Some(BlockAtOffset {
                ptr: child.ptr,
                parents,
                start_off: child_off,
                next_block_start,
                was_dirty: true,
            }));
        }
        Ok(None)
    }

    /// Offset of the block following the leaf at the end of `parents`.
    fn next_start_after(
        &self,
        parents: &[ParentBlockAndChildIndex],
    ) -> Result<Option<B::Offset>> {
        for step in parents.iter().rev() {
            if let Some((_, off)) = self.block(&step.ptr)?.indirect_ptr(step.child_index + 1) {
                return Ok(Some(off));
            }
        }
        Ok(None)
    }

    /// Walk every leaf intersecting `[start, end)` in offset order.
    ///
    /// `end == None` means "to the end". With `get_direct`, leaves are
    /// loaded into the arena; otherwise only indirect children are fetched
    /// and leaf paths are reported without loading the leaf. With
    /// `prefix_ok`, a cancellation after at least one leaf was found returns
    /// the contiguous prefix gathered so far instead of failing.
    ///
    /// A direct root yields no paths.
    pub fn get_blocks_for_offset_range(
        &mut self,
        cx: &Cx,
        start: &B::Offset,
        end: Option<&B::Offset>,
        prefix_ok: bool,
        get_direct: bool,
    ) -> Result<OffsetRange<B::Offset>> {
        let root = self.root;
        self.fetch(cx, &root, BlockReqType::ReadParallel)?;
        let mut range = OffsetRange {
            paths: Vec::new(),
            next_block_offset: None,
        };
        if !self.block(&root)?.is_indirect() {
            return Ok(range);
        }

        let mut stack = vec![RangeFrame { ptr: root, next: 0 }];
        let mut prefix: Vec<ParentBlockAndChildIndex> = Vec::new();
        let mut truncated = false;
        while let Some(frame) = stack.last_mut() {
            let block = self.block(&frame.ptr)?;
            let n = block.num_indirect_ptrs();
            if frame.next >= n {
                stack.pop();
                if !stack.is_empty() {
                    prefix.pop();
                }
                continue;
            }
            let i = frame.next;
            frame.next += 1;
            let Some((info, iptr_off)) = block.indirect_ptr(i) else {
                return Err(CafsError::BadData(format!("no pointer {i} in {}", frame.ptr)));
            };
            let in_range_left = block
                .indirect_ptr(i + 1)
                .is_none_or(|(_, next_off)| *start < next_off);
            if !in_range_left {
                continue;
            }
            let in_range_right = end.is_none_or(|end| iptr_off < *end);
            if !in_range_right {
                // Everything further right is out of range too.
                frame.next = n;
                if range
                    .next_block_offset
                    .as_ref()
                    .is_none_or(|known| iptr_off < *known)
                {
                    range.next_block_offset = Some(iptr_off);
                }
                continue;
            }

            let step = ParentBlockAndChildIndex::new(frame.ptr, i);
            let must_fetch = get_direct || info.ptr.direct_type == DirectType::Indirect;
            let fetched = if must_fetch {
                self.fetch(cx, &info.ptr, BlockReqType::ReadParallel)
            } else {
                cx_checkpoint(cx).map(|()| false)
            };
            match fetched {
                Ok(_) => {}
                Err(CafsError::Cancelled) if prefix_ok && !range.paths.is_empty() => {
                    truncated = true;
                    break;
                }
                Err(err) => return Err(err),
            }
            if must_fetch && self.block(&info.ptr)?.is_indirect() {
                prefix.push(step);
                stack.push(RangeFrame {
                    ptr: info.ptr,
                    next: 0,
                });
                continue;
            }
            let mut path = prefix.clone();
            path.push(step);
            range.paths.push(path);
        }

        if truncated {
            let keep = check_for_holes_and_truncate(&range.paths, |ptr| {
                self.block(ptr).ok().map(|block| block.num_indirect_ptrs())
            });
            debug!(
                target: "cafs::tree",
                found = range.paths.len(),
                kept = keep,
                "range_prefix_after_cancel"
            );
            range.paths.truncate(keep);
            range.next_block_offset = None;
        }
        Ok(range)
    }

    /// Every child info of every indirect block, deduplicated, in
    /// depth-first pre-order.
    pub fn get_indirect_block_infos(&mut self, cx: &Cx) -> Result<Vec<BlockInfo>> {
        let root = self.root;
        self.fetch(cx, &root, BlockReqType::Read)?;
        let mut infos = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(ptr) = stack.pop() {
            let block = self.block(&ptr)?;
            if !block.is_indirect() {
                continue;
            }
            let children: Vec<BlockInfo> = (0..block.num_indirect_ptrs())
                .filter_map(|i| block.indirect_ptr(i).map(|(info, _)| info))
                .collect();
            let mut descend = Vec::new();
            for info in children {
                if !seen.insert(info.ptr) {
                    continue;
                }
                infos.push(info);
                if info.ptr.direct_type == DirectType::Indirect {
                    self.fetch(cx, &info.ptr, BlockReqType::Read)?;
                    descend.push(info.ptr);
                }
            }
            stack.extend(descend.into_iter().rev());
        }
        Ok(infos)
    }
}

/// Length of the longest prefix of `paths` in which each leaf is the
/// immediate successor of the previous one.
///
/// Two leaf paths are consecutive when they have equal length and, at the
/// first level where they differ, the second path's index is exactly one
/// more than the first's, with every deeper level wrapping from the last
/// child of the first path's block to child 0. `num_children` reports how
/// many pointers a loaded indirect block holds.
pub fn check_for_holes_and_truncate<F>(paths: &[Vec<ParentBlockAndChildIndex>], num_children: F) -> usize
where
    F: Fn(&BlockPointer) -> Option<usize>,
{
    if paths.is_empty() {
        return 0;
    }
    for idx in 1..paths.len() {
        if !is_successor(&paths[idx - 1], &paths[idx], &num_children) {
            return idx;
        }
    }
    paths.len()
}

fn is_successor<F>(
    prev: &[ParentBlockAndChildIndex],
    curr: &[ParentBlockAndChildIndex],
    num_children: &F,
) -> bool
where
    F: Fn(&BlockPointer) -> Option<usize>,
{
    if prev.len() != curr.len() {
        return false;
    }
    let Some(level) = prev
        .iter()
        .zip(curr)
        .position(|(p, c)| p.child_index != c.child_index)
    else {
        return false;
    };
    if curr[level].child_index != prev[level].child_index + 1 {
        return false;
    }
    prev[level + 1..]
        .iter()
        .zip(&curr[level + 1..])
        .all(|(p, c)| {
            c.child_index == 0
                && num_children(&p.ptr).is_some_and(|n| n > 0 && p.child_index == n - 1)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemStore, clean_file, ptr, tree};
    use cafs_block::FileBlock;
    use cafs_types::Int64Offset;
    use std::sync::Arc;

    /// Three-level file with leaves at 0, 2, 4, 6 under two interior blocks.
    fn two_level(store: &MemStore) -> (BlockPointer, Vec<BlockPointer>) {
        let root = ptr(DirectType::Indirect);
        let mut top = FileBlock::new_empty(true);
        let mut leaves = Vec::new();
        for (mid_off, leaf_offs) in [(0, [0, 2]), (4, [4, 6])] {
            let mid = ptr(DirectType::Indirect);
            let mut mid_block = FileBlock::new_empty(true);
            for off in leaf_offs {
                let leaf = ptr(DirectType::Direct);
                mid_block.append_new_indirect_ptr(leaf, Int64Offset(off));
                let byte = u8::try_from(off).expect("small");
                store
                    .clean
                    .lock()
                    .insert(leaf.ref_ptr(), FileBlock::with_contents(vec![byte, byte]));
                leaves.push(leaf);
            }
            top.append_new_indirect_ptr(mid, Int64Offset(mid_off));
            store.clean.lock().insert(mid.ref_ptr(), mid_block);
        }
        store.clean.lock().insert(root.ref_ptr(), top);
        (root, leaves)
    }

    #[test]
    fn block_at_offset_picks_rightmost_covering_child() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = two_level(&store);
        let mut t = tree(&store, root);
        t.begin_op();

        let at = t
            .get_block_at_offset(&cx, &Int64Offset(5), BlockReqType::Read)
            .expect("lookup");
        assert_eq!(at.ptr, leaves[2]);
        assert_eq!(at.start_off, Int64Offset(4));
        assert_eq!(at.next_block_start, Some(Int64Offset(6)));
        assert_eq!(at.parents.len(), 2);
        assert!(!at.was_dirty);

        let at = t
            .get_block_at_offset(&cx, &Int64Offset(3), BlockReqType::Read)
            .expect("lookup");
        assert_eq!(at.ptr, leaves[1]);
        // The next block lives under the next interior block.
        assert_eq!(at.next_block_start, Some(Int64Offset(4)));

        let at = t
            .get_block_at_offset(&cx, &Int64Offset(100), BlockReqType::Read)
            .expect("lookup");
        assert_eq!(at.ptr, leaves[3]);
        assert_eq!(at.next_block_start, None);
    }

    #[test]
    fn direct_root_is_its_own_leaf() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let root = ptr(DirectType::Direct);
        store
            .clean
            .lock()
            .insert(root.ref_ptr(), FileBlock::with_contents(b"hi".to_vec()));
        let mut t = tree(&store, root);
        t.begin_op();
        let at = t
            .get_block_at_offset(&cx, &Int64Offset(1), BlockReqType::Read)
            .expect("lookup");
        assert_eq!(at.ptr, root);
        assert!(at.parents.is_empty());
        assert_eq!(at.start_off, Int64Offset(0));
    }

    #[test]
    fn range_walk_reports_leaves_in_order() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = two_level(&store);
        let mut t = tree(&store, root);
        t.begin_op();

        let range = t
            .get_blocks_for_offset_range(&cx, &Int64Offset(1), Some(&Int64Offset(5)), false, true)
            .expect("range");
        let got: Vec<BlockPointer> = range
            .paths
            .iter()
            .map(|p| t.child_ptr(p.last().expect("step")).expect("child"))
            .collect();
        assert_eq!(got, leaves[..3].to_vec());
        assert_eq!(range.next_block_offset, Some(Int64Offset(6)));
        for leaf in &leaves[..3] {
            assert!(t.block(leaf).is_ok());
        }
    }

    #[test]
    fn range_walk_without_direct_skips_leaf_fetches() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = two_level(&store);
        let mut t = tree(&store, root);
        t.begin_op();
        let range = t
            .get_blocks_for_offset_range(&cx, &Int64Offset(0), None, false, false)
            .expect("range");
        assert_eq!(range.paths.len(), 4);
        assert_eq!(range.next_block_offset, None);
        assert!(t.block(&leaves[0]).is_err());
    }

    #[test]
    fn next_dirty_block_skips_clean_subtrees() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = two_level(&store);
        let mut t = tree(&store, root);

        // Dirty the leaf at 4 and its ancestors.
        t.begin_op();
        let at = t
            .get_block_at_offset(&cx, &Int64Offset(4), BlockReqType::Write)
            .expect("lookup");
        t.cache(&cx, &at.ptr).expect("leaf");
        for step in &at.parents {
            t.cache(&cx, &step.ptr).expect("parent");
        }
        t.finish_op(&cx).expect("finish");

        t.begin_op();
        let found = t
            .get_next_dirty_block_at_offset(&cx, &Int64Offset(0), BlockReqType::Write, &*store)
            .expect("search")
            .expect("dirty leaf");
        assert_eq!(found.ptr, leaves[2]);
        assert_eq!(found.start_off, Int64Offset(4));
        assert_eq!(found.next_block_start, Some(Int64Offset(6)));

        let none = t
            .get_next_dirty_block_at_offset(&cx, &Int64Offset(6), BlockReqType::Write, &*store)
            .expect("search");
        assert!(none.is_none());
    }

    #[test]
    fn next_dirty_block_prefers_dirty_left_sibling() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = clean_file(&store, &[(0, b"ab"), (2, b"cd")]);
        let mut t = tree(&store, root);
        t.begin_op();
        t.fetch_root(&cx, BlockReqType::Write).expect("root");
        t.cache(&cx, &root).expect("root");
        t.fetch(&cx, &leaves[0], BlockReqType::Write).expect("leaf");
        t.cache(&cx, &leaves[0]).expect("leaf");
        // Offset 1 lies inside the first leaf, which is dirty.
        let found = t
            .get_next_dirty_block_at_offset(&cx, &Int64Offset(1), BlockReqType::Write, &*store)
            .expect("search")
            .expect("dirty leaf");
        assert_eq!(found.ptr, leaves[0]);
        assert_eq!(found.next_block_start, Some(Int64Offset(2)));
    }

    #[test]
    fn clean_root_has_no_dirty_blocks() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, _) = clean_file(&store, &[(0, b"ab")]);
        let mut t = tree(&store, root);
        t.begin_op();
        let found = t
            .get_next_dirty_block_at_offset(&cx, &Int64Offset(0), BlockReqType::Read, &*store)
            .expect("search");
        assert!(found.is_none());
    }

    #[test]
    fn indirect_infos_cover_all_interior_blocks() {
        let cx = Cx::for_testing();
        let store = Arc::new(MemStore::default());
        let (root, leaves) = two_level(&store);
        let mut t = tree(&store, root);
        t.begin_op();
        let infos = t.get_indirect_block_infos(&cx).expect("infos");
        assert_eq!(infos.len(), 6);
        // Pre-order: both interior blocks first, then each one's leaves.
        assert_eq!(infos[0].ptr.direct_type, DirectType::Indirect);
        assert_eq!(infos[2].ptr, leaves[0]);
        assert_eq!(infos[5].ptr, leaves[3]);
    }

    fn step(ptr: BlockPointer, child_index: usize) -> ParentBlockAndChildIndex {
        ParentBlockAndChildIndex::new(ptr, child_index)
    }

    #[test]
    fn holes_truncate_at_first_gap() {
        let top = ptr(DirectType::Indirect);
        let left = ptr(DirectType::Indirect);
        let right = ptr(DirectType::Indirect);
        let count = |p: &BlockPointer| Some(if *p == top { 2 } else { 3 });

        let contiguous = vec![
            vec![step(top, 0), step(left, 1)],
            vec![step(top, 0), step(left, 2)],
            vec![step(top, 1), step(right, 0)],
            vec![step(top, 1), step(right, 1)],
        ];
        assert_eq!(check_for_holes_and_truncate(&contiguous, count), 4);

        let skipped_sibling = vec![
            vec![step(top, 0), step(left, 0)],
            vec![step(top, 0), step(left, 2)],
        ];
        assert_eq!(check_for_holes_and_truncate(&skipped_sibling, count), 1);

        let skipped_cousin_start = vec![
            vec![step(top, 0), step(left, 2)],
            vec![step(top, 1), step(right, 1)],
        ];
        assert_eq!(check_for_holes_and_truncate(&skipped_cousin_start, count), 1);

        let not_last_on_left = vec![
            vec![step(top, 0), step(left, 1)],
            vec![step(top, 1), step(right, 0)],
        ];
        assert_eq!(check_for_holes_and_truncate(&not_last_on_left, count), 1);
        assert_eq!(check_for_holes_and_truncate(&[], count), 0);
    }
}
