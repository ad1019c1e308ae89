//! Block split policy.
//!
//! Decides where file blocks end, how wide indirect blocks may grow, and
//! how an overfull directory block is divided.

use crate::block::{DirBlock, FileBlock, IndirectFilePtr};
use cafs_error::{CafsError, Result};
use cafs_types::StringOffset;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Fraction of a block's byte budget that indirect pointers may fill.
const MAX_PTRS_FILL_FRACTION: f64 = 0.75;

/// Split-policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitterConfig {
    /// Maximum plaintext bytes in a direct file block. Default: 512 KiB.
    pub max_block_size: u64,
    /// Largest change that may be embedded in metadata instead of written
    /// as a block. Default: 8 KiB.
    pub block_change_embed_max_size: u64,
    /// Maximum entries in a direct directory block; 0 disables directory
    /// splitting. Default: 100.
    pub max_dir_entries_per_block: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            max_block_size: 512 * 1024,
            block_change_embed_max_size: 8 * 1024,
            max_dir_entries_per_block: 100,
        }
    }
}

/// Decides block boundaries for files and directories.
pub trait BlockSplitter: fmt::Debug + Send + Sync {
    /// Copy as much of `data` into `block` at `off` as fits, extending the
    /// block as needed. Returns the number of bytes copied.
    fn copy_until_split(&self, block: &mut FileBlock, last_block: bool, data: &[u8], off: i64)
    -> i64;

    /// Where `block` should be split. Positive: bytes past this point move
    /// to the next block. Negative: this block may absorb that many bytes
    /// from the next block. Zero: leave it alone.
    fn check_split(&self, block: &FileBlock) -> i64;

    /// Maximum number of children in an indirect block.
    fn max_ptrs_per_block(&self) -> usize;

    /// Whether a change of `size` bytes should be embedded.
    fn should_embed_data(&self, size: u64) -> bool;

    /// Split a direct directory block holding too many entries. Returns the
    /// resulting blocks and, when split, the first name of the right half.
    fn split_dir_if_needed(&self, block: DirBlock)
    -> Result<(Vec<DirBlock>, Option<StringOffset>)>;
}

/// Fixed-size split policy: every file block is cut at exactly
/// `max_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSplitterSimple {
    max_size: i64,
    max_ptrs: usize,
    embed_max: u64,
    max_dir_entries: usize,
}

impl BlockSplitterSimple {
    pub fn new(config: SplitterConfig) -> Result<Self> {
        let max_size = i64::try_from(config.max_block_size)
            .map_err(|_| CafsError::BadData("max_block_size overflows i64".to_owned()))?;
        if max_size <= 0 {
            return Err(CafsError::BadData(
                "max_block_size must be > 0".to_owned(),
            ));
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        #[allow(clippy::cast_sign_loss)]
        let max_ptrs = ((max_size as f64 * MAX_PTRS_FILL_FRACTION)
            / IndirectFilePtr::ENCODED_LEN as f64) as usize;
        Ok(Self {
            max_size,
            max_ptrs: max_ptrs.max(2),
            embed_max: config.block_change_embed_max_size,
            max_dir_entries: config.max_dir_entries_per_block,
        })
    }

    /// Splitter with explicit limits, bypassing the fan-out derivation.
    #[must_use]
    pub fn with_limits(
        max_size: i64,
        max_ptrs: usize,
        embed_max: u64,
        max_dir_entries: usize,
    ) -> Self {
        Self {
            max_size: max_size.max(1),
            max_ptrs: max_ptrs.max(2),
            embed_max,
            max_dir_entries,
        }
    }

    #[must_use]
    pub fn max_size(&self) -> i64 {
        self.max_size
    }
}

impl BlockSplitter for BlockSplitterSimple {
    fn copy_until_split(
        &self,
        block: &mut FileBlock,
        _last_block: bool,
        data: &[u8],
        off: i64,
    ) -> i64 {
        let max = usize::try_from(self.max_size).unwrap_or(usize::MAX);
        let Ok(start) = usize::try_from(off) else {
            return 0;
        };
        if start >= max {
            // Nothing fits; pad the block out to its full size so the
            // caller moves on to the next one.
            let contents = block.contents_mut();
            if contents.len() < max {
                contents.resize(max, 0);
            }
            return 0;
        }
        let end = start.saturating_add(data.len()).min(max);
        let n = end - start;
        let contents = block.contents_mut();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(&data[..n]);
        trace!(target: "cafs::split", off, copied = n, len = contents.len(), "copy_until_split");
        i64::try_from(n).unwrap_or(i64::MAX)
    }

    fn check_split(&self, block: &FileBlock) -> i64 {
        let len = i64::try_from(block.contents().len()).unwrap_or(i64::MAX);
        if len > self.max_size { self.max_size } else { 0 }
    }

    fn max_ptrs_per_block(&self) -> usize {
        self.max_ptrs
    }

    fn should_embed_data(&self, size: u64) -> bool {
        size <= self.embed_max
    }

    fn split_dir_if_needed(
        &self,
        mut block: DirBlock,
    ) -> Result<(Vec<DirBlock>, Option<StringOffset>)> {
        if block.is_ind {
            return Err(CafsError::BadData(
                "cannot split an indirect directory block".to_owned(),
            ));
        }
        if self.max_dir_entries == 0 || block.children.len() <= self.max_dir_entries {
            return Ok((vec![block], None));
        }

        let mid = block.children.len() / 2;
        let Some(split_name) = block.children.keys().nth(mid).cloned() else {
            return Err(CafsError::BadSplit);
        };
        let right_children = block.children.split_off(&split_name);
        trace!(
            target: "cafs::split",
            left = block.children.len(),
            right = right_children.len(),
            split_name = %split_name,
            "split_dir"
        );
        let right = DirBlock::with_children(right_children);
        Ok((vec![block, right], Some(StringOffset(split_name))))
    }
}
