//! Per-file dirty block bookkeeping.
//!
//! Each dirty block of a file moves through two independent phases: the
//! sync phase (not syncing, syncing, synced) and the copy phase (whether
//! the next write must copy the block before modifying it, because a sync
//! is still reading the current copy).

use crate::DirtyBlockCache;
use cafs_error::{CafsError, Result};
use cafs_types::{BlockPointer, BranchName, TlfId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    NotSyncing,
    Syncing,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPhase {
    /// The next write must copy the block first.
    NeedsCopy,
    AlreadyCopied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyBlockState {
    pub sync: SyncPhase,
    pub copy: CopyPhase,
    /// Bytes charged to the sync buffer when syncing began.
    pub sync_size: i64,
    /// The block was replaced while syncing and will not be referenced by
    /// the file after the sync.
    pub orphaned: bool,
}

impl DirtyBlockState {
    fn fresh() -> Self {
        Self {
            sync: SyncPhase::NotSyncing,
            copy: CopyPhase::AlreadyCopied,
            sync_size: 0,
            orphaned: false,
        }
    }
}

/// Result of [`DirtyFile::set_block_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetDirtyOutcome {
    /// The caller must store a fresh copy of the block in the dirty cache.
    pub needs_caching: bool,
    /// The block is part of an in-progress sync.
    pub is_syncing: bool,
}

#[derive(Debug, Default)]
struct FileState {
    blocks: HashMap<BlockPointer, DirtyBlockState>,
    not_yet_syncing_bytes: i64,
    total_sync_bytes: i64,
    deferred_new_bytes: i64,
}

/// Dirty state of one file's blocks.
pub struct DirtyFile {
    tlf: TlfId,
    branch: BranchName,
    top: BlockPointer,
    cache: Arc<dyn DirtyBlockCache>,
    state: Mutex<FileState>,
}

impl std::fmt::Debug for DirtyFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyFile")
            .field("tlf", &self.tlf)
            .field("branch", &self.branch)
            .field("top", &self.top)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl DirtyFile {
    #[must_use]
    pub fn new(
        tlf: TlfId,
        branch: BranchName,
        top: BlockPointer,
        cache: Arc<dyn DirtyBlockCache>,
    ) -> Self {
        Self {
            tlf,
            branch,
            top,
            cache,
            state: Mutex::new(FileState::default()),
        }
    }

    #[must_use]
    pub fn top_ptr(&self) -> BlockPointer {
        self.top
    }

    #[must_use]
    pub fn tlf(&self) -> TlfId {
        self.tlf
    }

    #[must_use]
    pub fn branch(&self) -> &BranchName {
        &self.branch
    }

    #[must_use]
    pub fn block_state(&self, ptr: &BlockPointer) -> Option<DirtyBlockState> {
        self.state.lock().blocks.get(ptr).copied()
    }

    /// Whether a write to `ptr` must first copy the block.
    #[must_use]
    pub fn block_needs_copy(&self, ptr: &BlockPointer) -> bool {
        self.state
            .lock()
            .blocks
            .get(ptr)
            .is_none_or(|s| s.copy == CopyPhase::NeedsCopy)
    }

    pub fn set_block_dirty(&self, ptr: &BlockPointer) -> SetDirtyOutcome {
        let mut guard = self.state.lock();
        let entry = guard
            .blocks
            .entry(*ptr)
            .or_insert_with(|| DirtyBlockState {
                copy: CopyPhase::NeedsCopy,
                ..DirtyBlockState::fresh()
            });
        if entry.orphaned {
            return SetDirtyOutcome {
                needs_caching: false,
                is_syncing: entry.sync == SyncPhase::Syncing,
            };
        }
        let needs_caching = entry.copy == CopyPhase::NeedsCopy;
        entry.copy = CopyPhase::AlreadyCopied;
        let is_syncing = entry.sync == SyncPhase::Syncing;
        trace!(target: "cafs::file", ptr = %ptr, needs_caching, is_syncing, "set_block_dirty");
        SetDirtyOutcome {
            needs_caching,
            is_syncing,
        }
    }

    /// Forget `ptr`'s dirty state. Returns whether it was syncing.
    pub fn set_block_not_dirty(&self, ptr: &BlockPointer) -> bool {
        let mut guard = self.state.lock();
        let was_syncing = guard
            .blocks
            .remove(ptr)
            .is_some_and(|s| s.sync == SyncPhase::Syncing);
        trace!(target: "cafs::file", ptr = %ptr, was_syncing, "set_block_not_dirty");
        was_syncing
    }

    /// Mark `ptr` as part of the sync about to start, moving its bytes
    /// from the wait buffer into the sync buffer.
    pub fn set_block_syncing(&self, ptr: &BlockPointer) -> Result<()> {
        let mut guard = self.state.lock();
        let Some(entry) = guard.blocks.get(ptr).copied() else {
            return Err(CafsError::InvalidSyncState(format!(
                "block {ptr} is not dirty"
            )));
        };
        if entry.copy != CopyPhase::AlreadyCopied {
            return Err(CafsError::InvalidSyncState(format!(
                "block {ptr} has no private copy to sync"
            )));
        }
        let block = self.cache.get(self.tlf, ptr, &self.branch)?;
        let size = block.bytes_can_be_dirtied();
        guard.blocks.insert(
            *ptr,
            DirtyBlockState {
                sync: SyncPhase::Syncing,
                copy: CopyPhase::NeedsCopy,
                sync_size: size,
                orphaned: entry.orphaned,
            },
        );
        guard.not_yet_syncing_bytes -= size;
        guard.total_sync_bytes += size;
        drop(guard);
        self.cache.update_syncing_bytes(self.tlf, size);
        trace!(target: "cafs::file", ptr = %ptr, size, "set_block_syncing");
        Ok(())
    }

    /// `ptr` has been durably written.
    pub fn set_block_synced(&self, ptr: &BlockPointer) -> Result<()> {
        let mut guard = self.state.lock();
        let Some(entry) = guard.blocks.get_mut(ptr) else {
            return Err(CafsError::InvalidSyncState(format!(
                "block {ptr} is not tracked"
            )));
        };
        if entry.sync != SyncPhase::Syncing {
            return Err(CafsError::InvalidSyncState(format!(
                "block {ptr} is not syncing"
            )));
        }
        entry.sync = SyncPhase::Synced;
        let size = entry.sync_size;
        if entry.orphaned {
            let _ = guard.blocks.remove(ptr);
        }
        drop(guard);
        self.cache.block_sync_finished(self.tlf, size);
        Ok(())
    }

    /// The whole sync succeeded.
    pub fn finish_sync(&self) -> Result<()> {
        let top = self.top;
        let top_syncing = self
            .state
            .lock()
            .blocks
            .get(&top)
            .is_some_and(|s| s.sync == SyncPhase::Syncing);
        if top_syncing {
            self.set_block_synced(&top)?;
        }

        let mut guard = self.state.lock();
        guard.blocks.retain(|_, s| match s.sync {
            SyncPhase::Synced if s.copy == CopyPhase::AlreadyCopied && !s.orphaned => {
                // Rewritten during the sync; still dirty.
                s.sync = SyncPhase::NotSyncing;
                true
            }
            SyncPhase::Synced => false,
            SyncPhase::NotSyncing | SyncPhase::Syncing => !s.orphaned,
        });
        let total = guard.total_sync_bytes;
        guard.total_sync_bytes = 0;
        drop(guard);
        self.cache.sync_finished(self.tlf, total);
        debug!(target: "cafs::file", top = %top, total, "finish_sync");
        Ok(())
    }

    /// A sync failed: every syncing or synced block is dirty again and its
    /// bytes return to the wait buffer.
    pub fn reset_syncing_blocks_to_dirty(&self) {
        let mut guard = self.state.lock();
        let mut released_sync = Vec::new();
        let mut retried_syncing = Vec::new();
        let mut retried_synced = Vec::new();
        let mut restored = 0_i64;

        guard.blocks.retain(|_, s| {
            if s.orphaned {
                if s.sync == SyncPhase::Syncing {
                    released_sync.push(s.sync_size);
                }
                return false;
            }
            match s.sync {
                SyncPhase::Syncing => retried_syncing.push(s.sync_size),
                SyncPhase::Synced => retried_synced.push(s.sync_size),
                SyncPhase::NotSyncing => return true,
            }
            restored += s.sync_size;
            s.sync = SyncPhase::NotSyncing;
            s.copy = CopyPhase::AlreadyCopied;
            s.sync_size = 0;
            true
        });
        guard.not_yet_syncing_bytes += restored;
        guard.total_sync_bytes = 0;
        drop(guard);

        for size in released_sync {
            self.cache.block_sync_finished(self.tlf, size);
        }
        for size in retried_syncing {
            self.cache.update_unsynced_bytes(self.tlf, -size, true);
            self.cache.block_sync_finished(self.tlf, -size);
        }
        for size in retried_synced {
            self.cache.block_sync_finished(self.tlf, -size);
        }
        debug!(target: "cafs::file", top = %self.top, restored, "reset_syncing_blocks_to_dirty");
    }

    #[must_use]
    pub fn is_block_orphaned(&self, ptr: &BlockPointer) -> bool {
        self.state.lock().blocks.get(ptr).is_some_and(|s| s.orphaned)
    }

    pub fn set_block_orphaned(&self, ptr: &BlockPointer, orphaned: bool) {
        if let Some(entry) = self.state.lock().blocks.get_mut(ptr) {
            entry.orphaned = orphaned;
        }
    }

    /// Account for `n` newly dirtied (or, if negative, released) bytes that
    /// are not yet part of a sync.
    pub fn update_not_yet_syncing_bytes(&self, n: i64) {
        self.state.lock().not_yet_syncing_bytes += n;
        self.cache.update_unsynced_bytes(self.tlf, n, false);
    }

    #[must_use]
    pub fn not_yet_syncing_bytes(&self) -> i64 {
        self.state.lock().not_yet_syncing_bytes
    }

    #[must_use]
    pub fn total_sync_bytes(&self) -> i64 {
        self.state.lock().total_sync_bytes
    }

    /// Bytes written while a sync was in progress; they are charged only
    /// once the sync completes.
    pub fn add_deferred_new_bytes(&self, n: i64) {
        self.state.lock().deferred_new_bytes += n;
    }

    #[must_use]
    pub fn deferred_new_bytes(&self) -> i64 {
        self.state.lock().deferred_new_bytes
    }

    /// Move deferred bytes into the not-yet-syncing count.
    pub fn assimilate_deferred_new_bytes(&self) {
        let deferred = std::mem::take(&mut self.state.lock().deferred_new_bytes);
        if deferred != 0 {
            self.update_not_yet_syncing_bytes(deferred);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DirtyBlockCacheStandard, DirtyCacheConfig};
    use cafs_block::{Block, FileBlock};
    use cafs_types::BlockId;
    use std::time::Duration;

    const TLF: TlfId = TlfId([3; 16]);

    fn ptr(n: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId::from_payload(&[n]),
            ..BlockPointer::default()
        }
    }

    fn setup() -> (Arc<DirtyBlockCacheStandard>, DirtyFile) {
        let cache = Arc::new(
            DirtyBlockCacheStandard::new(DirtyCacheConfig {
                min_sync_buffer_cap: 100,
                max_sync_buffer_cap: 1000,
                start_sync_buffer_cap: 100,
                request_timeout: Duration::from_millis(500),
                ..DirtyCacheConfig::default()
            })
            .expect("cache"),
        );
        let shared: Arc<dyn DirtyBlockCache> = cache.clone();
        let df = DirtyFile::new(TLF, BranchName::master(), ptr(0), shared);
        (cache, df)
    }

    fn dirty(cache: &DirtyBlockCacheStandard, df: &DirtyFile, p: &BlockPointer, len: usize) {
        let outcome = df.set_block_dirty(p);
        if outcome.needs_caching {
            cache
                .put(
                    TLF,
                    p,
                    &BranchName::master(),
                    Block::File(FileBlock::with_contents(vec![0; len])),
                )
                .expect("put");
        }
        df.update_not_yet_syncing_bytes(i64::try_from(len).expect("len"));
    }

    #[test]
    fn first_dirty_needs_caching_then_not() {
        let (cache, df) = setup();
        assert!(df.block_needs_copy(&ptr(1)));
        let first = df.set_block_dirty(&ptr(1));
        assert!(first.needs_caching);
        assert!(!first.is_syncing);
        assert!(!df.block_needs_copy(&ptr(1)));
        let second = df.set_block_dirty(&ptr(1));
        assert!(!second.needs_caching);
        assert!(!df.set_block_not_dirty(&ptr(1)));
        cache.shutdown().expect("clean shutdown");
    }

    #[test]
    fn successful_sync_settles_ledger() {
        let (cache, df) = setup();
        dirty(&cache, &df, &ptr(0), 10);
        dirty(&cache, &df, &ptr(1), 20);
        assert_eq!(df.not_yet_syncing_bytes(), 30);
        assert_eq!(cache.ledger().wait_buf_bytes, 30);

        df.set_block_syncing(&ptr(0)).expect("syncing top");
        df.set_block_syncing(&ptr(1)).expect("syncing child");
        assert_eq!(df.total_sync_bytes(), 30);
        assert_eq!(df.not_yet_syncing_bytes(), 0);
        assert!(df.block_needs_copy(&ptr(1)));
        let ledger = cache.ledger();
        assert_eq!(ledger.sync_buf_bytes, 30);
        assert_eq!(ledger.wait_buf_bytes, 0);

        df.set_block_synced(&ptr(1)).expect("synced");
        df.finish_sync().expect("finish");
        assert!(df.block_state(&ptr(0)).is_none());
        assert!(df.block_state(&ptr(1)).is_none());
        assert_eq!(cache.ledger().sync_buf_bytes, 0);
        cache.delete(TLF, &ptr(0), &BranchName::master()).expect("delete");
        cache.delete(TLF, &ptr(1), &BranchName::master()).expect("delete");
        cache.shutdown().expect("clean shutdown");
    }

    #[test]
    fn write_during_sync_keeps_block_dirty() {
        let (cache, df) = setup();
        dirty(&cache, &df, &ptr(1), 10);
        df.set_block_syncing(&ptr(1)).expect("syncing");

        let during = df.set_block_dirty(&ptr(1));
        assert!(during.needs_caching);
        assert!(during.is_syncing);

        df.set_block_synced(&ptr(1)).expect("synced");
        df.finish_sync().expect("finish");
        let state = df.block_state(&ptr(1)).expect("still dirty");
        assert_eq!(state.sync, SyncPhase::NotSyncing);
        assert_eq!(state.copy, CopyPhase::AlreadyCopied);
    }

    #[test]
    fn failed_sync_restores_wait_buffer() {
        let (cache, df) = setup();
        dirty(&cache, &df, &ptr(1), 10);
        dirty(&cache, &df, &ptr(2), 15);
        df.set_block_syncing(&ptr(1)).expect("syncing");
        df.set_block_syncing(&ptr(2)).expect("syncing");
        df.set_block_synced(&ptr(2)).expect("synced");

        df.reset_syncing_blocks_to_dirty();
        let ledger = cache.ledger();
        assert_eq!(ledger.sync_buf_bytes, 0);
        assert_eq!(ledger.wait_buf_bytes, 25);
        assert_eq!(df.not_yet_syncing_bytes(), 25);
        assert_eq!(df.total_sync_bytes(), 0);
        for p in [ptr(1), ptr(2)] {
            let state = df.block_state(&p).expect("dirty");
            assert_eq!(state.sync, SyncPhase::NotSyncing);
            assert!(!df.block_needs_copy(&p));
        }

        // Retry succeeds.
        df.set_block_syncing(&ptr(1)).expect("syncing");
        df.set_block_syncing(&ptr(2)).expect("syncing");
        df.set_block_synced(&ptr(1)).expect("synced");
        df.set_block_synced(&ptr(2)).expect("synced");
        df.finish_sync().expect("finish");
        let ledger = cache.ledger();
        assert_eq!(ledger.sync_buf_bytes, 0);
        assert_eq!(ledger.wait_buf_bytes, 0);
    }

    #[test]
    fn orphaned_block_is_dropped_on_sync_completion() {
        let (cache, df) = setup();
        dirty(&cache, &df, &ptr(1), 10);
        df.set_block_syncing(&ptr(1)).expect("syncing");
        df.set_block_orphaned(&ptr(1), true);
        assert!(df.is_block_orphaned(&ptr(1)));
        let outcome = df.set_block_dirty(&ptr(1));
        assert!(!outcome.needs_caching);
        df.set_block_synced(&ptr(1)).expect("synced");
        assert!(df.block_state(&ptr(1)).is_none());
        df.finish_sync().expect("finish");
        assert_eq!(cache.ledger().sync_buf_bytes, 0);
    }

    #[test]
    fn syncing_requires_private_copy() {
        let (_cache, df) = setup();
        assert!(matches!(
            df.set_block_syncing(&ptr(9)),
            Err(CafsError::InvalidSyncState(_))
        ));
        assert!(df.set_block_synced(&ptr(9)).is_err());
    }

    #[test]
    fn deferred_bytes_are_assimilated_once() {
        let (cache, df) = setup();
        df.add_deferred_new_bytes(12);
        assert_eq!(df.deferred_new_bytes(), 12);
        assert_eq!(cache.ledger().wait_buf_bytes, 0);
        df.assimilate_deferred_new_bytes();
        assert_eq!(df.deferred_new_bytes(), 0);
        assert_eq!(df.not_yet_syncing_bytes(), 12);
        assert_eq!(cache.ledger().wait_buf_bytes, 12);
        df.assimilate_deferred_new_bytes();
        assert_eq!(df.not_yet_syncing_bytes(), 12);
        df.update_not_yet_syncing_bytes(-12);
        cache.shutdown().expect("clean shutdown");
    }
}
