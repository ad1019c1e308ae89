//! Byte-stream view of a file block tree.
//!
//! Leaves hold at most `max_block_size` bytes and are addressed by
//! [`Int64Offset`]. Gaps between a leaf's last byte and the next leaf's
//! offset are holes and read back as zeros.

use crate::default_new_block_data_version;
use asupersync::Cx;
use cafs_block::{BlockSplitter, DirEntry, FileBlock, IsDirtyProvider, TreeBlock};
use cafs_dirty::DirtyFile;
use cafs_error::{CafsError, Result};
use cafs_tree::{
    BlockAtOffset, BlockGetter, BlockTree, DirtyBlockCacher, ParentBlockAndChildIndex,
    ReadyDeps, SyncedCallback, TreeOwner,
};
use cafs_types::{BlockInfo, BlockPointer, BlockReqType, Int64Offset};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Extensions up to this many bytes are written as zeros instead of
/// leaving a hole.
const TRUNCATE_EXTEND_CUTOFF: i64 = 128 * 1024;

fn len_i64(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

fn to_usize(n: i64) -> Result<usize> {
    usize::try_from(n).map_err(|_| CafsError::BadData(format!("invalid length {n}")))
}

fn zero_fill(out: &mut Vec<u8>, n: i64) -> Result<()> {
    out.resize(out.len() + to_usize(n)?, 0);
    Ok(())
}

// ── Outcomes ────────────────────────────────────────────────────────────────

/// Result of [`FileData::write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWriteOutcome {
    /// Entry with the new size; its encoded size is cleared when the file
    /// grew.
    pub new_de: DirEntry,
    /// Every block cached during the write, including interior blocks that
    /// must be re-readied because a child changed.
    pub dirty_ptrs: Vec<BlockPointer>,
    /// Previously readied blocks superseded by this write.
    pub unrefs: Vec<BlockInfo>,
    /// Bytes of leaf data dirtied, counting whole blocks that had at least
    /// one byte dirtied.
    pub newly_dirtied_child_bytes: i64,
    /// Growth of the file's length, not counting pre-existing holes.
    pub bytes_extended: i64,
}

/// Result of the truncate operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateOutcome {
    pub new_de: DirEntry,
    pub dirty_ptrs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockInfo>,
    /// Negative when a dirty block shrank.
    pub newly_dirtied_child_bytes: i64,
}

/// Insertion-ordered set of dirtied pointers.
#[derive(Debug, Default)]
struct DirtySet {
    seen: HashSet<BlockPointer>,
    ptrs: Vec<BlockPointer>,
}

impl DirtySet {
    fn insert(&mut self, ptr: BlockPointer) {
        if self.seen.insert(ptr) {
            self.ptrs.push(ptr);
        }
    }

    fn extend(&mut self, ptrs: impl IntoIterator<Item = BlockPointer>) {
        for ptr in ptrs {
            self.insert(ptr);
        }
    }

    fn into_vec(self) -> Vec<BlockPointer> {
        self.ptrs
    }
}

// ── FileData ────────────────────────────────────────────────────────────────

/// A file's contents as a block tree.
///
/// Each public method is one tree operation: blocks it modifies are handed
/// to the cacher as it goes and once more with their final contents when
/// it returns, even when it fails part-way.
#[derive(Debug)]
pub struct FileData {
    tree: BlockTree<FileBlock>,
}

impl FileData {
    pub fn new(
        root: BlockPointer,
        owner: TreeOwner,
        bsplit: Arc<dyn BlockSplitter>,
        getter: Arc<dyn BlockGetter<FileBlock>>,
        cacher: Arc<dyn DirtyBlockCacher<FileBlock>>,
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
    pub fn tree(&self) -> &BlockTree<FileBlock> {
        &self.tree
    }

    fn end_op<T>(&mut self, cx: &Cx, result: Result<T>) -> Result<T> {
        let flushed = self.tree.finish_op(cx);
        let value = result?;
        flushed.map(|()| value)
    }

    /// Before a write-class operation may add a level above the root,
    /// forget the root's dirty state so the new top block counts as newly
    /// dirtied.
    fn prepare_new_level(&self, parents: &[ParentBlockAndChildIndex], df: Option<&DirtyFile>) {
        if self.tree.lowest_ancestor_with_room(parents).is_none() {
            if let Some(df) = df {
                df.set_block_not_dirty(&self.tree.root_ptr());
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Leaf holding `off`, together with a copy of its contents.
    pub fn get_file_block_at_offset(
        &mut self,
        cx: &Cx,
        off: Int64Offset,
        req: BlockReqType,
    ) -> Result<(BlockAtOffset<Int64Offset>, FileBlock)> {
        self.tree.begin_op();
        let result = self
            .tree
            .get_block_at_offset(cx, &off, req)
            .and_then(|at| {
                let block = self.tree.block(&at.ptr)?.clone();
                Ok((at, block))
            });
        self.end_op(cx, result)
    }

    /// Fill `dest` from `off`, returning the number of bytes copied. A
    /// cancellation part-way returns the longest contiguous prefix that was
    /// already fetched.
    pub fn read(&mut self, cx: &Cx, dest: &mut [u8], off: Int64Offset) -> Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        self.tree.begin_op();
        let end = off.0.saturating_add(len_i64(dest.len()));
        let result = self.bytes_in_range(cx, off.0, Some(end), true);
        let bytes = self.end_op(cx, result)?;
        let n = bytes.len().min(dest.len());
        dest[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    /// Bytes in `[start, end)`, or to the end of the file when `end` is
    /// `None`.
    pub fn get_bytes(
        &mut self,
        cx: &Cx,
        start: Int64Offset,
        end: Option<Int64Offset>,
    ) -> Result<Vec<u8>> {
        self.tree.begin_op();
        let result = self.bytes_in_range(cx, start.0, end.map(|e| e.0), false);
        self.end_op(cx, result)
    }

    fn bytes_in_range(
        &mut self,
        cx: &Cx,
        start: i64,
        end: Option<i64>,
        prefix_ok: bool,
    ) -> Result<Vec<u8>> {
        if start < 0 || end.is_some_and(|e| e < 0) {
            return Err(CafsError::BadData(format!(
                "bad offset range [{start}, {end:?})"
            )));
        }
        if end.is_some_and(|e| e <= start) {
            return Ok(Vec::new());
        }

        let root = self.tree.root_ptr();
        self.tree.fetch_root(cx, BlockReqType::Read)?;
        let (leaves, next_block_off) = if self.tree.root_block()?.is_indirect() {
            let end_off = end.map(Int64Offset);
            let range = self.tree.get_blocks_for_offset_range(
                cx,
                &Int64Offset(start),
                end_off.as_ref(),
                prefix_ok,
                true,
            )?;
            let mut leaves = Vec::with_capacity(range.paths.len());
            for path in &range.paths {
                let step = path.last().ok_or_else(|| {
                    CafsError::BadData(format!("empty path to child of {root}"))
                })?;
                let (info, off) = self.tree.child(step)?;
                leaves.push((off.0, info.ptr));
            }
            (leaves, range.next_block_offset.map(|o| o.0))
        } else {
            (vec![(0, root)], None)
        };

        let Some(&(last_off, last_ptr)) = leaves.last() else {
            return Ok(Vec::new());
        };
        let end_block_off = last_off + len_i64(self.tree.block(&last_ptr)?.contents().len());
        let n = end.map_or(end_block_off - start, |e| e - start);
        if n <= 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(to_usize(n)?);
        let mut n_read = 0_i64;
        for (i, &(block_off, ptr)) in leaves.iter().enumerate() {
            let contents = self.tree.block(&ptr)?.contents();
            let mut next_byte = start + n_read;
            let mut to_read = n - n_read;
            let last_byte_in_block = block_off + len_i64(contents.len());
            let next_iptr_off = leaves.get(i + 1).map(|&(off, _)| off).or(next_block_off);

            if next_byte >= last_byte_in_block {
                let Some(next) = next_iptr_off else {
                    return Ok(out);
                };
                let fill = (next - next_byte).min(to_read);
                trace!(target: "cafs::file", next_byte, last_byte_in_block, fill, "read_hole");
                if fill <= 0 {
                    warn!(target: "cafs::file", root = %root, next_byte, fill, "read_invalid_hole");
                    return Err(CafsError::BadSplit);
                }
                zero_fill(&mut out, fill)?;
                n_read += fill;
                continue;
            }
            to_read = to_read.min(last_byte_in_block - next_byte);

            if next_byte < block_off {
                let fill = (block_off - next_byte).min(to_read);
                zero_fill(&mut out, fill)?;
                n_read += fill;
                next_byte += fill;
                to_read -= fill;
            }

            let first = to_usize(next_byte - block_off)?;
            out.extend_from_slice(&contents[first..first + to_usize(to_read)?]);
            n_read += to_read;
        }

        if n_read < n {
            if let Some(next) = next_block_off {
                let next_byte = start + n_read;
                let fill = (next - next_byte).min(n - n_read);
                trace!(target: "cafs::file", next_byte, fill, "read_hole_at_end");
                if fill <= 0 {
                    warn!(target: "cafs::file", root = %root, next_byte, fill, "read_invalid_hole");
                    return Err(CafsError::BadSplit);
                }
                zero_fill(&mut out, fill)?;
            }
        }
        Ok(out)
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    /// Write `data` at `off`, creating blocks and levels of indirection as
    /// needed. The root is always cached, so even an empty write marks the
    /// file dirty.
    pub fn write(
        &mut self,
        cx: &Cx,
        data: &[u8],
        off: Int64Offset,
        old_de: &DirEntry,
        df: Option<&DirtyFile>,
    ) -> Result<FileWriteOutcome> {
        self.tree.begin_op();
        let result = self.write_in_op(cx, data, off.0, old_de, df);
        self.end_op(cx, result)
    }

    #[allow(clippy::too_many_lines)]
    fn write_in_op(
        &mut self,
        cx: &Cx,
        data: &[u8],
        off: i64,
        old_de: &DirEntry,
        df: Option<&DirtyFile>,
    ) -> Result<FileWriteOutcome> {
        if off < 0 {
            return Err(CafsError::BadData(format!("negative write offset {off}")));
        }
        let n = len_i64(data.len());
        let last_byte_written = off.checked_add(n).ok_or_else(|| {
            CafsError::BadData(format!("write of {n} bytes at {off} overflows the file size"))
        })?;
        let root = self.tree.root_ptr();
        let bsplit = self.tree.splitter();
        let mut n_copied = 0_i64;
        let mut old_size_without_holes = old_de.entry_info.size;
        let mut new_de = old_de.clone();
        let mut dirty = DirtySet::default();
        let mut unrefs = Vec::new();
        let mut newly_dirtied_child_bytes = 0_i64;
        debug!(target: "cafs::file", root = %root, len = n, off, "write_start");

        while n_copied < n {
            let at = self
                .tree
                .get_block_at_offset(cx, &Int64Offset(off + n_copied), BlockReqType::Write)?;
            let mut ptr = at.ptr;
            let mut parents = at.parents;
            let start_off = at.start_off.0;
            let next_off = at.next_block_start.map(|o| o.0);

            // Never write past the start of the next block.
            let max = next_off.map_or(n, |next| n.min(next - off));
            let old_n_copied = n_copied;
            let (old_len, new_len) = {
                let block = self.tree.block_mut(&ptr)?;
                let old_len = block.contents().len();
                let src = &data[to_usize(n_copied)?..to_usize(max)?];
                n_copied += bsplit.copy_until_split(
                    block,
                    next_off.is_none(),
                    src,
                    off + n_copied - start_off,
                );
                (old_len, block.contents().len())
            };

            let mut switch_to_indirect = false;
            if n_copied < n {
                let need_extend_file = next_off.is_none();
                let need_fill_hole = next_off.is_some_and(|next| off + n_copied < next);
                let end_of_block = start_off + len_i64(new_len);
                let mut new_block_off = end_of_block;
                if n_copied == 0 {
                    // Writing past the end or inside a hole: the new block
                    // starts exactly where the write does.
                    if new_block_off < off {
                        new_block_off = off;
                    }
                } else if new_block_off != off + n_copied {
                    return Err(CafsError::BadData(format!(
                        "copied {n_copied} bytes, but new block offset {new_block_off} \
                         does not match {off} plus the copied bytes"
                    )));
                }

                let mut right_parents = Vec::new();
                if need_extend_file || need_fill_hole {
                    debug!(
                        target: "cafs::file",
                        root = %root,
                        n_copied,
                        new_block_off,
                        "write_new_right_block"
                    );
                    self.prepare_new_level(&parents, df);
                    let was_direct_root = parents.is_empty();
                    let nrb = self.tree.new_right_block(
                        cx,
                        &mut parents,
                        Int64Offset(new_block_off),
                        default_new_block_data_version(false),
                    )?;
                    dirty.extend(nrb.dirty_ptrs);
                    if let Some(moved) = nrb.new_level {
                        if was_direct_root {
                            // The old direct root now lives under a new
                            // pointer and must be uploaded as a child.
                            switch_to_indirect = true;
                            ptr = moved;
                        }
                    }
                    if new_block_off > end_of_block {
                        self.mark_holes(&nrb.right_parents)?;
                    }
                    right_parents = nrb.right_parents;
                }
                if need_fill_hole {
                    let shifted = self.tree.shift_blocks_to_fill_hole(cx, right_parents)?;
                    dirty.extend(shifted.dirty_ptrs);
                    unrefs.extend(shifted.unrefs);
                    newly_dirtied_child_bytes += shifted.newly_dirtied_child_bytes;
                    if old_size_without_holes == old_de.entry_info.size {
                        // Disregard the hole being filled when computing how
                        // far the write extends the file.
                        old_size_without_holes = u64::try_from(new_block_off).unwrap_or(0);
                    }
                }
            }

            // The last block was already full: nothing to dirty yet.
            if n_copied == old_n_copied && old_len == new_len && !switch_to_indirect {
                continue;
            }

            // Only the last block grows the file.
            if old_len != new_len && next_off.is_none() {
                new_de.info.encoded_size = 0;
                new_de.entry_info.size =
                    u64::try_from(start_off + len_i64(new_len)).unwrap_or(0);
            }

            newly_dirtied_child_bytes += len_i64(new_len);
            if at.was_dirty {
                newly_dirtied_child_bytes -= len_i64(old_len);
            }

            let marked = self.tree.mark_parents_dirty(cx, &parents)?;
            dirty.extend(marked.dirty_ptrs);
            unrefs.extend(marked.unrefs);

            // Keep the old block ID while it's dirty.
            self.tree.cache(cx, &ptr)?;
            dirty.insert(ptr);
        }

        self.tree.fetch_root(cx, BlockReqType::Write)?;
        self.tree.cache(cx, &root)?;
        dirty.insert(root);

        let old_size = i64::try_from(old_size_without_holes).unwrap_or(i64::MAX);
        let bytes_extended = (last_byte_written - old_size).max(0);
        debug!(
            target: "cafs::file",
            root = %root,
            size = new_de.entry_info.size,
            newly_dirtied_child_bytes,
            bytes_extended,
            "write_done"
        );
        Ok(FileWriteOutcome {
            new_de,
            dirty_ptrs: dirty.into_vec(),
            unrefs,
            newly_dirtied_child_bytes,
            bytes_extended,
        })
    }

    /// Flag every pointer on the path to a new block as covering a hole.
    fn mark_holes(&mut self, path: &[ParentBlockAndChildIndex]) -> Result<()> {
        for step in path {
            if let Some(iptr) = self.tree.block_mut(&step.ptr)?.iptrs.get_mut(step.child_index) {
                iptr.holes = true;
            }
        }
        Ok(())
    }

    // ── Truncation ──────────────────────────────────────────────────────────

    /// Resize the file to `size`. Small extensions are written out as
    /// zeros, larger ones leave a hole. A size that falls short of any
    /// existing block shrinks the file; equal sizes leave it untouched.
    pub fn truncate(
        &mut self,
        cx: &Cx,
        size: u64,
        old_de: &DirEntry,
        df: Option<&DirtyFile>,
    ) -> Result<TruncateOutcome> {
        let i_size = i64::try_from(size)
            .map_err(|_| CafsError::BadData(format!("size {size} out of range")))?;
        let (at, block) =
            self.get_file_block_at_offset(cx, Int64Offset(i_size), BlockReqType::Read)?;
        let curr_len = at.start_off.0 + len_i64(block.contents().len());
        let is_last = at.next_block_start.is_none();
        match curr_len.cmp(&i_size) {
            Ordering::Less if is_last && i_size - curr_len > TRUNCATE_EXTEND_CUTOFF => {
                self.truncate_extend(cx, size, old_de, df)
            }
            Ordering::Less if is_last => {
                let zeros = vec![0; to_usize(i_size - curr_len)?];
                let written = self.write(cx, &zeros, Int64Offset(curr_len), old_de, df)?;
                Ok(TruncateOutcome {
                    new_de: written.new_de,
                    dirty_ptrs: written.dirty_ptrs,
                    unrefs: written.unrefs,
                    newly_dirtied_child_bytes: written.newly_dirtied_child_bytes,
                })
            }
            Ordering::Less => {
                // `size` lands in a hole: cut at the end of the block before
                // it, then grow back out to `size`.
                let cut = u64::try_from(curr_len).unwrap_or(0);
                let shrunk = self.truncate_shrink(cx, cut, old_de)?;
                let grown = self.truncate(cx, size, &shrunk.new_de, df)?;
                let mut dirty = DirtySet::default();
                dirty.extend(shrunk.dirty_ptrs);
                dirty.extend(grown.dirty_ptrs);
                let mut unrefs = shrunk.unrefs;
                unrefs.extend(grown.unrefs);
                Ok(TruncateOutcome {
                    new_de: grown.new_de,
                    dirty_ptrs: dirty.into_vec(),
                    unrefs,
                    newly_dirtied_child_bytes: shrunk.newly_dirtied_child_bytes
                        + grown.newly_dirtied_child_bytes,
                })
            }
            Ordering::Equal if is_last => Ok(TruncateOutcome {
                new_de: old_de.clone(),
                dirty_ptrs: Vec::new(),
                unrefs: Vec::new(),
                newly_dirtied_child_bytes: 0,
            }),
            _ => self.truncate_shrink(cx, size, old_de),
        }
    }

    /// Grow the file to `size` by appending an empty block at `size`; the
    /// range in between is a hole.
    pub fn truncate_extend(
        &mut self,
        cx: &Cx,
        size: u64,
        old_de: &DirEntry,
        df: Option<&DirtyFile>,
    ) -> Result<TruncateOutcome> {
        self.tree.begin_op();
        let result = self.truncate_extend_in_op(cx, size, old_de, df);
        self.end_op(cx, result)
    }

    fn truncate_extend_in_op(
        &mut self,
        cx: &Cx,
        size: u64,
        old_de: &DirEntry,
        df: Option<&DirtyFile>,
    ) -> Result<TruncateOutcome> {
        let root = self.tree.root_ptr();
        let i_size = i64::try_from(size)
            .map_err(|_| CafsError::BadData(format!("size {size} out of range")))?;
        debug!(target: "cafs::file", root = %root, size, "truncate_extend");
        let mut parents = self
            .tree
            .get_block_at_offset(cx, &Int64Offset(i_size), BlockReqType::Write)?
            .parents;
        let switch_to_indirect = parents.is_empty();
        self.prepare_new_level(&parents, df);
        let nrb = self.tree.new_right_block(
            cx,
            &mut parents,
            Int64Offset(i_size),
            default_new_block_data_version(true),
        )?;

        let mut dirty = DirtySet::default();
        if switch_to_indirect {
            if let Some(moved) = nrb.new_level {
                debug!(target: "cafs::file", root = %root, moved = %moved, "truncate_extend_made_indirect");
                dirty.insert(moved);
            }
        }
        dirty.extend(nrb.dirty_ptrs);

        // One flagged pointer would do; flag them all.
        for iptr in &mut self.tree.block_mut(&root)?.iptrs {
            iptr.holes = true;
        }
        self.tree.cache(cx, &root)?;
        dirty.insert(root);

        let mut new_de = old_de.clone();
        new_de.info.encoded_size = 0;
        new_de.entry_info.size = size;
        Ok(TruncateOutcome {
            new_de,
            dirty_ptrs: dirty.into_vec(),
            unrefs: Vec::new(),
            newly_dirtied_child_bytes: 0,
        })
    }

    /// Cut the file at `size`, dropping every block after the one holding
    /// the new end.
    pub fn truncate_shrink(
        &mut self,
        cx: &Cx,
        size: u64,
        old_de: &DirEntry,
    ) -> Result<TruncateOutcome> {
        self.tree.begin_op();
        let result = self.truncate_shrink_in_op(cx, size, old_de);
        self.end_op(cx, result)
    }

    fn truncate_shrink_in_op(
        &mut self,
        cx: &Cx,
        size: u64,
        old_de: &DirEntry,
    ) -> Result<TruncateOutcome> {
        let root = self.tree.root_ptr();
        let i_size = i64::try_from(size)
            .map_err(|_| CafsError::BadData(format!("size {size} out of range")))?;
        let at = self
            .tree
            .get_block_at_offset(cx, &Int64Offset(i_size), BlockReqType::Write)?;
        let ptr = at.ptr;

        let keep = to_usize(i_size - at.start_off.0)?;
        let block = self.tree.block_mut(&ptr)?;
        let old_len = block.contents().len();
        block.contents_mut().resize(keep, 0);
        let mut newly_dirtied_child_bytes = len_i64(keep);
        if at.was_dirty {
            newly_dirtied_child_bytes -= len_i64(old_len);
        }

        // Parents go dirty first so the range walk below sees the new
        // copies.
        let marked = self.tree.mark_parents_dirty(cx, &at.parents)?;
        let mut unrefs = marked.unrefs;
        let mut dirty = DirtySet::default();
        dirty.extend(marked.dirty_ptrs);

        if let Some(next) = at.next_block_start {
            self.drop_blocks_from(cx, next, &mut dirty, &mut unrefs)?;
        }

        if self.tree.root_block()?.is_indirect() {
            self.tree.cache(cx, &root)?;
            dirty.insert(root);
        }

        let mut new_de = old_de.clone();
        new_de.info.encoded_size = 0;
        new_de.entry_info.size = size;

        self.tree.cache(cx, &ptr)?;
        dirty.insert(ptr);
        debug!(
            target: "cafs::file",
            root = %root,
            size,
            unrefs = unrefs.len(),
            "truncate_shrink"
        );
        Ok(TruncateOutcome {
            new_de,
            dirty_ptrs: dirty.into_vec(),
            unrefs,
            newly_dirtied_child_bytes,
        })
    }

    /// Remove every pointer to a block starting at or after `from`,
    /// unreferencing the dropped leaves and interior blocks. A block that
    /// starts before `from` keeps its children below `from`.
    fn drop_blocks_from(
        &mut self,
        cx: &Cx,
        from: Int64Offset,
        dirty: &mut DirtySet,
        unrefs: &mut Vec<BlockInfo>,
    ) -> Result<()> {
        let range = self
            .tree
            .get_blocks_for_offset_range(cx, &from, None, false, false)?;

        // Each visited block's pointers as they were before truncation.
        let mut saved: HashMap<BlockPointer, Vec<(BlockInfo, Int64Offset)>> = HashMap::new();
        let mut dropped: HashSet<BlockPointer> = HashSet::new();
        for path in &range.paths {
            for step in path {
                if !saved.contains_key(&step.ptr) {
                    let children: Vec<(BlockInfo, Int64Offset)> = self
                        .tree
                        .block(&step.ptr)?
                        .iptrs
                        .iter()
                        .map(|iptr| (iptr.info, iptr.off))
                        .collect();
                    let cut = children
                        .iter()
                        .position(|(_, off)| *off >= from)
                        .unwrap_or(children.len());
                    if !dropped.contains(&step.ptr) && cut < children.len() {
                        self.tree.fetch(cx, &step.ptr, BlockReqType::Write)?;
                        self.tree.block_mut(&step.ptr)?.iptrs.truncate(cut);
                        self.tree.cache(cx, &step.ptr)?;
                        dirty.insert(step.ptr);
                    }
                    saved.insert(step.ptr, children);
                }

                let (child, child_off) = saved
                    .get(&step.ptr)
                    .and_then(|children| children.get(step.child_index))
                    .copied()
                    .ok_or_else(|| {
                        CafsError::BadData(format!(
                            "child index {} out of range in {}",
                            step.child_index, step.ptr
                        ))
                    })?;
                if child_off >= from && dropped.insert(child.ptr) && child.encoded_size != 0 {
                    unrefs.push(child);
                }
            }
        }
        trace!(
            target: "cafs::file",
            root = %self.tree.root_ptr(),
            from = from.0,
            dropped = dropped.len(),
            "drop_blocks_from"
        );
        Ok(())
    }

    // ── Sync preparation ────────────────────────────────────────────────────

    /// Re-cut dirty leaves whose size the splitter no longer accepts,
    /// moving overflow into the next block or pulling bytes back from it.
    /// Returns the infos that must be unreferenced.
    pub fn split(
        &mut self,
        cx: &Cx,
        dirty: &dyn IsDirtyProvider,
        df: Option<&DirtyFile>,
    ) -> Result<Vec<BlockInfo>> {
        self.tree.begin_op();
        let result = self.split_in_op(cx, dirty, df);
        self.end_op(cx, result)
    }

    fn split_in_op(
        &mut self,
        cx: &Cx,
        dirty: &dyn IsDirtyProvider,
        df: Option<&DirtyFile>,
    ) -> Result<Vec<BlockInfo>> {
        let mut unrefs = Vec::new();
        self.tree.fetch_root(cx, BlockReqType::Write)?;
        if !self.tree.root_block()?.is_indirect() {
            return Ok(unrefs);
        }
        let bsplit = self.tree.splitter();

        let mut off = Some(Int64Offset(0));
        while let Some(cur) = off {
            let Some(at) =
                self.tree
                    .get_next_dirty_block_at_offset(cx, &cur, BlockReqType::Write, dirty)?
            else {
                break;
            };
            off = at.next_block_start;
            let start_off = at.start_off.0;
            let split_at = bsplit.check_split(self.tree.block(&at.ptr)?);
            match split_at.cmp(&0) {
                Ordering::Equal => {}
                Ordering::Greater => {
                    let block = self.tree.block_mut(&at.ptr)?;
                    let old_end = start_off + len_i64(block.contents().len());
                    let extra = block.contents_mut().split_off(to_usize(split_at)?);
                    self.tree.cache(cx, &at.ptr)?;

                    if at.next_block_start.is_none() {
                        let mut parents = at.parents.clone();
                        self.prepare_new_level(&parents, df);
                        self.tree.new_right_block(
                            cx,
                            &mut parents,
                            Int64Offset(old_end),
                            default_new_block_data_version(false),
                        )?;
                    }
                    let right = self.tree.get_block_at_offset(
                        cx,
                        &Int64Offset(old_end),
                        BlockReqType::Write,
                    )?;
                    let rblock = self.tree.block_mut(&right.ptr)?;
                    let mut contents = extra;
                    contents.extend_from_slice(rblock.contents());
                    rblock.set_contents(contents);
                    self.tree.cache(cx, &right.ptr)?;

                    let end_of_block = start_off + split_at;
                    self.unref_right_child(&right.parents, &mut unrefs)?;
                    self.set_leaf_offset(&right.parents, end_of_block)?;
                    let marked = self.tree.mark_parents_dirty(cx, &right.parents)?;
                    unrefs.extend(marked.unrefs);
                    debug!(
                        target: "cafs::file",
                        ptr = %at.ptr,
                        split_at,
                        right = %right.ptr,
                        "split_moved_overflow"
                    );
                    off = Some(Int64Offset(end_of_block));
                }
                Ordering::Less => {
                    if at.next_block_start.is_none() {
                        continue;
                    }
                    let old_len = self.tree.block(&at.ptr)?.contents().len();
                    let old_end = start_off + len_i64(old_len);
                    let right = self.tree.get_block_at_offset(
                        cx,
                        &Int64Offset(old_end),
                        BlockReqType::Write,
                    )?;
                    let right_contents = self.tree.block(&right.ptr)?.contents().to_vec();
                    let block = self.tree.block_mut(&at.ptr)?;
                    let n = bsplit.copy_until_split(
                        block,
                        false,
                        &right_contents,
                        len_i64(old_len),
                    );
                    let end_of_block = start_off + len_i64(block.contents().len());
                    self.tree.cache(cx, &at.ptr)?;
                    let rest = right_contents[to_usize(n)?..].to_vec();

                    self.unref_right_child(&right.parents, &mut unrefs)?;
                    let Some((last, upper)) = right.parents.split_last() else {
                        return Err(CafsError::BadData(format!(
                            "leaf {} has no parent",
                            right.ptr
                        )));
                    };
                    if rest.is_empty() {
                        // TODO: collapse a level once only one leaf is left
                        // under it.
                        self.tree
                            .block_mut(&last.ptr)?
                            .iptrs
                            .remove(last.child_index);
                        let marked = self.tree.mark_parents_dirty(cx, upper)?;
                        unrefs.extend(marked.unrefs);
                        self.tree.cache(cx, &last.ptr)?;
                    } else {
                        self.tree.block_mut(&right.ptr)?.set_contents(rest);
                        self.tree.cache(cx, &right.ptr)?;
                        self.set_leaf_offset(&right.parents, end_of_block)?;
                        let marked = self.tree.mark_parents_dirty(cx, &right.parents)?;
                        unrefs.extend(marked.unrefs);
                    }
                    debug!(
                        target: "cafs::file",
                        ptr = %at.ptr,
                        pulled = n,
                        right = %right.ptr,
                        "split_pulled_bytes"
                    );
                    off = Some(Int64Offset(end_of_block));
                }
            }
        }
        Ok(unrefs)
    }

    /// Unreference the readied leaf at the end of `parents` and clear its
    /// size so it is readied again.
    fn unref_right_child(
        &mut self,
        parents: &[ParentBlockAndChildIndex],
        unrefs: &mut Vec<BlockInfo>,
    ) -> Result<()> {
        let Some(last) = parents.last() else {
            return Ok(());
        };
        let (info, _) = self.tree.child(last)?;
        if info.encoded_size != 0 {
            unrefs.push(info);
            self.tree
                .block_mut(&last.ptr)?
                .clear_indirect_ptr_size(last.child_index);
        }
        Ok(())
    }

    /// Point the leaf at the end of `parents` at `off`, propagating up
    /// through every level where it is the leftmost child.
    fn set_leaf_offset(&mut self, parents: &[ParentBlockAndChildIndex], off: i64) -> Result<()> {
        for step in parents.iter().rev() {
            self.tree
                .block_mut(&step.ptr)?
                .set_indirect_ptr_off(step.child_index, Int64Offset(off));
            if step.child_index > 0 {
                break;
            }
        }
        Ok(())
    }

    /// Ready every dirty block below the root. Leaves readied here report
    /// back to `df` once their upload completes.
    pub fn ready(
        &mut self,
        cx: &Cx,
        deps: ReadyDeps<'_>,
        df: Option<&Arc<DirtyFile>>,
    ) -> Result<HashMap<BlockPointer, BlockInfo>> {
        let make_synced = df.map(|df| {
            let df = Arc::clone(df);
            move |ptr: BlockPointer| -> SyncedCallback {
                let df = Arc::clone(&df);
                Box::new(move || df.set_block_synced(&ptr))
            }
        });
        self.tree.begin_op();
        let result = self.tree.ready(
            cx,
            deps,
            &HashSet::new(),
            make_synced
                .as_ref()
                .map(|make| make as &dyn Fn(BlockPointer) -> SyncedCallback),
        );
        self.end_op(cx, result)
    }

    /// Infos of every block below the root.
    pub fn get_indirect_file_block_infos(&mut self, cx: &Cx) -> Result<Vec<BlockInfo>> {
        self.tree.begin_op();
        let result = self.tree.get_indirect_block_infos(cx);
        self.end_op(cx, result)
    }

    /// Find which of `ptrs` are referenced by the tree, clearing their
    /// encoded size and dirtying every block above them.
    pub fn find_iptrs_and_clear_size(
        &mut self,
        cx: &Cx,
        ptrs: &HashSet<BlockPointer>,
    ) -> Result<HashSet<BlockPointer>> {
        self.tree.begin_op();
        let result = self.find_iptrs_in_op(cx, ptrs);
        self.end_op(cx, result)
    }

    fn find_iptrs_in_op(
        &mut self,
        cx: &Cx,
        ptrs: &HashSet<BlockPointer>,
    ) -> Result<HashSet<BlockPointer>> {
        let mut found = HashSet::new();
        self.tree.fetch_root(cx, BlockReqType::Read)?;
        if ptrs.is_empty() || !self.tree.root_block()?.is_indirect() {
            return Ok(found);
        }
        let range = self.tree.get_blocks_for_offset_range(
            cx,
            &Int64Offset(0),
            None,
            false,
            false,
        )?;

        let mut seen = HashSet::new();
        for path in &range.paths {
            for (level, step) in path.iter().enumerate() {
                if !seen.insert(step.ptr) {
                    continue;
                }
                let children: Vec<BlockPointer> = self
                    .tree
                    .block(&step.ptr)?
                    .iptrs
                    .iter()
                    .map(|iptr| iptr.info.ptr)
                    .collect();
                for (i, child) in children.into_iter().enumerate() {
                    if !ptrs.contains(&child) {
                        continue;
                    }
                    for s in &path[..=level] {
                        self.tree.fetch(cx, &s.ptr, BlockReqType::Write)?;
                    }
                    // The first path through a block need not be the one
                    // leading to the matching child.
                    let mut to_child = path[..=level].to_vec();
                    to_child[level].child_index = i;
                    self.tree.mark_parents_dirty(cx, &to_child)?;
                    trace!(target: "cafs::file", ptr = %child, "found_iptr");
                    found.insert(child);
                    if found.len() == ptrs.len() {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(found)
    }
}
