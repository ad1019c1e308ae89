#![forbid(unsafe_code)]
//! Dirty block tracking and write backpressure.
//!
//! [`DirtyBlockCacheStandard`] holds every locally modified block that has
//! not yet been durably synced, keyed by `(tlf, block ref, branch)`, and
//! paces writers against the rate at which syncs drain. [`DirtyFile`]
//! tracks the per-block copy and sync phases of one file.
//!
//! # Byte ledger
//!
//! | Counter | Meaning |
//! |---------|---------|
//! | `wait_buf_bytes` | dirty bytes not yet part of any sync |
//! | `sync_buf_bytes` | bytes in syncs that have started but not finished |
//! | `sync_buffer_cap` | target size of the next sync; grows and shrinks with sync speed |
//! | `ignore_sync_bytes` | bytes of a slow sync excluded from the next growth step |

mod file;
mod standard;

pub use file::{CopyPhase, DirtyBlockState, DirtyFile, SetDirtyOutcome, SyncPhase};
pub use standard::DirtyBlockCacheStandard;

use asupersync::Cx;
use cafs_block::{Block, IsDirtyProvider};
use cafs_error::{CafsError, Result};
use cafs_types::{BlockPointer, BranchName, TlfId};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[inline]
fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| CafsError::Cancelled)
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Sync buffer sizing and backpressure tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyCacheConfig {
    /// Smallest (and reset) sync buffer capacity. Default: 1 MiB.
    pub min_sync_buffer_cap: i64,
    /// Largest sync buffer capacity; writers are refused once the wait
    /// buffer reaches twice this. Default: 32 MiB.
    pub max_sync_buffer_cap: i64,
    /// Initial sync buffer capacity. Default: 1 MiB.
    pub start_sync_buffer_cap: i64,
    /// Quiet period after which the capacity drops back to the minimum.
    /// Default: 5 minutes.
    pub reset_buffer_cap_after: Duration,
    /// Portion of each request's deadline never spent on backpressure.
    /// Default: 1 second.
    pub backpressure_slack: Duration,
    /// Deadline given to each permission request. Default: 30 seconds.
    pub request_timeout: Duration,
}

impl Default for DirtyCacheConfig {
    fn default() -> Self {
        Self {
            min_sync_buffer_cap: 1 << 20,
            max_sync_buffer_cap: 32 << 20,
            start_sync_buffer_cap: 1 << 20,
            reset_buffer_cap_after: Duration::from_secs(5 * 60),
            backpressure_slack: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl DirtyCacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_sync_buffer_cap <= 0 {
            return Err(CafsError::BadData(
                "min_sync_buffer_cap must be > 0".to_owned(),
            ));
        }
        if self.max_sync_buffer_cap < self.min_sync_buffer_cap {
            return Err(CafsError::BadData(
                "max_sync_buffer_cap must be >= min_sync_buffer_cap".to_owned(),
            ));
        }
        if !(self.min_sync_buffer_cap..=self.max_sync_buffer_cap)
            .contains(&self.start_sync_buffer_cap)
        {
            return Err(CafsError::BadData(
                "start_sync_buffer_cap must lie within [min, max]".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of the dirty-byte ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyLedger {
    pub sync_buf_bytes: i64,
    pub wait_buf_bytes: i64,
    pub sync_buffer_cap: i64,
    pub ignore_sync_bytes: i64,
}

// ── Permits ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitState {
    Pending,
    Granted,
    Shutdown,
}

#[derive(Debug)]
struct PermitSlot {
    state: Mutex<PermitState>,
    cv: Condvar,
}

impl PermitSlot {
    fn resolve(&self, outcome: PermitState) {
        let mut guard = self.state.lock();
        if *guard == PermitState::Pending {
            *guard = outcome;
        }
        drop(guard);
        self.cv.notify_all();
    }
}

/// Completion signal returned by
/// [`DirtyBlockCache::request_permission_to_dirty`].
///
/// Writers wait on it before accumulating the dirty bytes they asked for.
#[derive(Debug, Clone)]
pub struct DirtyPermit {
    slot: Arc<PermitSlot>,
}

const PERMIT_POLL: Duration = Duration::from_millis(10);

impl DirtyPermit {
    fn pending() -> Self {
        Self {
            slot: Arc::new(PermitSlot {
                state: Mutex::new(PermitState::Pending),
                cv: Condvar::new(),
            }),
        }
    }

    /// True once permission has been granted.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.slot.state.lock() == PermitState::Granted
    }

    /// Block until permission is granted, the cache shuts down, or `cx` is
    /// cancelled.
    pub fn wait(&self, cx: &Cx) -> Result<()> {
        let mut guard = self.slot.state.lock();
        loop {
            match *guard {
                PermitState::Granted => return Ok(()),
                PermitState::Shutdown => return Err(CafsError::ShutdownHappened),
                PermitState::Pending => {}
            }
            cx_checkpoint(cx)?;
            let _ = self.slot.cv.wait_for(&mut guard, PERMIT_POLL);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `Ok(false)`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.state.lock();
        loop {
            match *guard {
                PermitState::Granted => return Ok(true),
                PermitState::Shutdown => return Err(CafsError::ShutdownHappened),
                PermitState::Pending => {}
            }
            if self.slot.cv.wait_until(&mut guard, deadline).timed_out() {
                return Ok(*guard == PermitState::Granted);
            }
        }
    }
}

// ── Cache interface ─────────────────────────────────────────────────────────

/// Store of dirty blocks plus the global write-pacing ledger.
pub trait DirtyBlockCache: IsDirtyProvider {
    fn get(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> Result<Block>;

    fn put(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName, block: Block) -> Result<()>;

    fn delete(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> Result<()>;

    /// Whether anything is dirty or in flight for `tlf`.
    fn is_any_dirty(&self, tlf: TlfId) -> bool;

    /// Ask to dirty `estimated_bytes` more bytes. The returned permit
    /// becomes ready once the buffers have room.
    fn request_permission_to_dirty(
        &self,
        cx: &Cx,
        tlf: TlfId,
        estimated_bytes: i64,
    ) -> Result<DirtyPermit>;

    /// Reconcile an earlier estimate. `was_syncing` selects the sync buffer
    /// instead of the wait buffer. Negative values release bytes.
    fn update_unsynced_bytes(&self, tlf: TlfId, new_unsynced_bytes: i64, was_syncing: bool);

    /// Move `size` bytes from the wait buffer into the sync buffer.
    fn update_syncing_bytes(&self, tlf: TlfId, size: i64);

    /// A single block finished syncing. Negative `size` means the block
    /// will be retried and its bytes return to the wait buffer.
    fn block_sync_finished(&self, tlf: TlfId, size: i64);

    /// A whole sync of `size` bytes finished.
    fn sync_finished(&self, tlf: TlfId, size: i64);

    /// True once the wait buffer has reached the sync buffer capacity.
    fn should_force_sync(&self, tlf: TlfId) -> bool;

    /// Stop the permission worker. Fails if bytes are still outstanding.
    fn shutdown(&self) -> Result<()>;
}
