//! In-memory dirty block cache with TCP-like sync buffer sizing.
//!
//! The sync buffer capacity behaves like a congestion window: a sync that
//! drains at least a full buffer grows it additively, a sync that runs past
//! a third of half the request timeout shrinks it multiplicatively, and a
//! quiet period without large syncs resets it to the minimum. Writers may
//! fill the wait buffer up to one capacity freely; beyond that each request
//! is delayed in proportion to the overage, and nothing is admitted once
//! the wait buffer reaches twice the maximum capacity.

use crate::{
    DirtyBlockCache, DirtyCacheConfig, DirtyLedger, DirtyPermit, PermitSlot, PermitState,
    cx_checkpoint,
};
use asupersync::Cx;
use cafs_block::{Block, DirtyBlockId, IsDirtyProvider};
use cafs_error::{CafsError, Result};
use cafs_types::{BlockPointer, BranchName, TlfId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Fraction of half the request timeout a sync may take before the buffer
/// shrinks.
const DECREASE_THRESHOLD: f64 = 0.33;

#[derive(Debug)]
struct DirtyRequest {
    permit: Arc<PermitSlot>,
    bytes: i64,
    start: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct DirtyState {
    blocks: HashMap<DirtyBlockId, Block>,
    sync_buf_bytes: i64,
    wait_buf_bytes: i64,
    sync_buffer_cap: i64,
    ignore_sync_bytes: i64,
    sync_started: Option<Instant>,
    reset_cap_at: Option<Instant>,
    requests: VecDeque<DirtyRequest>,
    bytes_decreased: bool,
    shutdown: bool,
}

impl DirtyState {
    fn update_wait_buf(&mut self, bytes: i64) {
        self.wait_buf_bytes += bytes;
        // Overwrites of syncing blocks can be charged twice and released
        // once; never let the counter go negative.
        if self.wait_buf_bytes < 0 {
            self.wait_buf_bytes = 0;
        }
    }

    fn maybe_reset_buffer_cap(&mut self, min_cap: i64, now: Instant) {
        if let Some(at) = self.reset_cap_at {
            if now >= at {
                debug!(
                    target: "cafs::dirty",
                    from = self.sync_buffer_cap,
                    to = min_cap,
                    "sync_buffer_cap_reset"
                );
                self.sync_buffer_cap = min_cap;
                self.reset_cap_at = None;
            }
        }
    }

    /// How much longer a request should be held back.
    fn calc_backpressure(
        &self,
        start: Instant,
        deadline: Instant,
        slack: Duration,
        now: Instant,
    ) -> Duration {
        let total_req_time = deadline.saturating_duration_since(start);
        let Some(total_req_time) = total_req_time.checked_sub(slack) else {
            return Duration::ZERO;
        };
        if total_req_time.is_zero() || self.wait_buf_bytes < self.sync_buffer_cap {
            return Duration::ZERO;
        }

        #[allow(clippy::cast_precision_loss)]
        let frac = ((self.wait_buf_bytes - self.sync_buffer_cap) as f64
            / self.sync_buffer_cap.max(1) as f64)
            .min(1.0);
        let total_backpressure = total_req_time.mul_f64(frac);
        let spent = now.saturating_duration_since(start);
        total_backpressure.saturating_sub(spent)
    }

    fn accept_new_write(&mut self, bytes: i64, max_cap: i64) -> bool {
        let can_accept = self.wait_buf_bytes < max_cap.saturating_mul(2);
        if can_accept {
            self.wait_buf_bytes += bytes;
        }
        can_accept
    }

    /// Shrink the buffer if the current sync has used too much of its
    /// allowed time. Returns `(decreased, next_wakeup, frac_so_far)`.
    fn maybe_decrease_buffer(
        &mut self,
        start: Instant,
        deadline: Instant,
        so_far: f64,
        min_cap: i64,
        now: Instant,
    ) -> (bool, Duration, f64) {
        let allowed = deadline.saturating_duration_since(start).as_secs_f64() / 2.0;
        if allowed <= 0.0 {
            return (false, Duration::ZERO, so_far);
        }
        let used = now.saturating_duration_since(start);
        let frac_used = used.as_secs_f64() / allowed;
        if frac_used >= DECREASE_THRESHOLD {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            let shrunk = (self.sync_buffer_cap as f64 * (1.0 - (frac_used - so_far))) as i64;
            self.sync_buffer_cap = shrunk.max(min_cap);
            debug!(
                target: "cafs::dirty",
                blocked_ms = used.as_millis(),
                pct_of_timeout = frac_used * 100.0,
                sync_buffer_cap = self.sync_buffer_cap,
                "sync_buffer_decreased"
            );
            if self.sync_buf_bytes > self.ignore_sync_bytes {
                self.ignore_sync_bytes = self.sync_buf_bytes;
            }
            return (true, Duration::from_secs_f64(allowed), frac_used);
        }

        let max_wakeup = Duration::from_secs_f64(allowed / 3.0);
        (false, max_wakeup.saturating_sub(used), so_far)
    }
}

#[derive(Debug)]
struct Shared {
    config: DirtyCacheConfig,
    state: Mutex<DirtyState>,
    wakeup: Condvar,
}

impl Shared {
    fn signal_decreased_bytes(&self, state: &mut DirtyState) {
        state.bytes_decreased = true;
        self.wakeup.notify_all();
    }
}

/// Standard [`DirtyBlockCache`], with a background thread that grants
/// permission to dirty new bytes.
#[derive(Debug)]
pub struct DirtyBlockCacheStandard {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DirtyBlockCacheStandard {
    pub fn new(config: DirtyCacheConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(DirtyState {
                blocks: HashMap::new(),
                sync_buf_bytes: 0,
                wait_buf_bytes: 0,
                sync_buffer_cap: config.start_sync_buffer_cap,
                ignore_sync_bytes: 0,
                sync_started: None,
                reset_cap_at: None,
                requests: VecDeque::new(),
                bytes_decreased: false,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("cafs-dirty-permission".to_owned())
            .spawn(move || process_permission(&worker_shared))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Snapshot of the byte counters.
    #[must_use]
    pub fn ledger(&self) -> DirtyLedger {
        let mut guard = self.lock_state();
        guard.maybe_reset_buffer_cap(self.shared.config.min_sync_buffer_cap, Instant::now());
        DirtyLedger {
            sync_buf_bytes: guard.sync_buf_bytes,
            wait_buf_bytes: guard.wait_buf_bytes,
            sync_buffer_cap: guard.sync_buffer_cap,
            ignore_sync_bytes: guard.ignore_sync_bytes,
        }
    }

    /// Number of dirty blocks currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> MutexGuard<'_, DirtyState> {
        self.shared.state.lock()
    }

    fn stop_worker(&self) {
        {
            let mut guard = self.lock_state();
            guard.shutdown = true;
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(target: "cafs::dirty", "permission_worker_panicked");
            }
        }
    }
}

impl IsDirtyProvider for DirtyBlockCacheStandard {
    fn is_dirty(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> bool {
        self.lock_state()
            .blocks
            .contains_key(&DirtyBlockId::new(tlf, ptr, branch))
    }
}

impl DirtyBlockCache for DirtyBlockCacheStandard {
    fn get(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> Result<Block> {
        self.lock_state()
            .blocks
            .get(&DirtyBlockId::new(tlf, ptr, branch))
            .cloned()
            .ok_or_else(|| CafsError::NoSuchBlock {
                id: ptr.id.to_string(),
            })
    }

    fn put(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName, block: Block) -> Result<()> {
        let _ = self
            .lock_state()
            .blocks
            .insert(DirtyBlockId::new(tlf, ptr, branch), block);
        trace!(target: "cafs::dirty", ptr = %ptr, "dirty_put");
        Ok(())
    }

    fn delete(&self, tlf: TlfId, ptr: &BlockPointer, branch: &BranchName) -> Result<()> {
        let _ = self
            .lock_state()
            .blocks
            .remove(&DirtyBlockId::new(tlf, ptr, branch));
        trace!(target: "cafs::dirty", ptr = %ptr, "dirty_delete");
        Ok(())
    }

    fn is_any_dirty(&self, _tlf: TlfId) -> bool {
        let guard = self.lock_state();
        !guard.blocks.is_empty() || guard.sync_buf_bytes > 0 || guard.wait_buf_bytes > 0
    }

    fn request_permission_to_dirty(
        &self,
        cx: &Cx,
        _tlf: TlfId,
        estimated_bytes: i64,
    ) -> Result<DirtyPermit> {
        cx_checkpoint(cx)?;
        if estimated_bytes < 0 {
            return Err(CafsError::BadData(format!(
                "permission requested for a negative byte count: {estimated_bytes}"
            )));
        }
        let permit = DirtyPermit::pending();
        let now = Instant::now();
        let mut guard = self.lock_state();
        if guard.shutdown {
            return Err(CafsError::ShutdownHappened);
        }
        guard.requests.push_back(DirtyRequest {
            permit: Arc::clone(&permit.slot),
            bytes: estimated_bytes,
            start: now,
            deadline: now + self.shared.config.request_timeout,
        });
        drop(guard);
        self.shared.wakeup.notify_all();
        Ok(permit)
    }

    fn update_unsynced_bytes(&self, _tlf: TlfId, new_unsynced_bytes: i64, was_syncing: bool) {
        let mut guard = self.lock_state();
        if was_syncing {
            guard.sync_buf_bytes += new_unsynced_bytes;
        } else {
            guard.update_wait_buf(new_unsynced_bytes);
        }
        if new_unsynced_bytes < 0 {
            self.shared.signal_decreased_bytes(&mut guard);
        }
    }

    fn update_syncing_bytes(&self, _tlf: TlfId, size: i64) {
        let mut guard = self.lock_state();
        guard.sync_buf_bytes += size;
        guard.update_wait_buf(-size);
        self.shared.signal_decreased_bytes(&mut guard);
    }

    fn block_sync_finished(&self, _tlf: TlfId, size: i64) {
        let mut guard = self.lock_state();
        if size > 0 {
            guard.sync_buf_bytes -= size;
            self.shared.signal_decreased_bytes(&mut guard);
        } else {
            guard.update_wait_buf(-size);
        }
    }

    fn sync_finished(&self, _tlf: TlfId, size: i64) {
        if size <= 0 {
            return;
        }
        let config = &self.shared.config;
        let now = Instant::now();
        let mut guard = self.lock_state();
        guard.maybe_reset_buffer_cap(config.min_sync_buffer_cap, now);
        guard.sync_started = None;

        // Bytes of a sync that already timed out do not count toward growth.
        let ignore = guard.ignore_sync_bytes.min(size);
        let buffer_increase = size - ignore;
        guard.ignore_sync_bytes -= ignore;

        if size >= guard.sync_buffer_cap / 2 {
            guard.reset_cap_at = Some(now + config.reset_buffer_cap_after);
        }
        if buffer_increase >= guard.sync_buffer_cap {
            guard.sync_buffer_cap =
                (guard.sync_buffer_cap + buffer_increase).min(config.max_sync_buffer_cap);
        }
        self.shared.signal_decreased_bytes(&mut guard);
        debug!(
            target: "cafs::dirty",
            size,
            sync_buffer_cap = guard.sync_buffer_cap,
            wait_buf = guard.wait_buf_bytes,
            ignored = ignore,
            "sync_finished"
        );
    }

    fn should_force_sync(&self, _tlf: TlfId) -> bool {
        let mut guard = self.lock_state();
        guard.maybe_reset_buffer_cap(self.shared.config.min_sync_buffer_cap, Instant::now());
        guard.wait_buf_bytes >= guard.sync_buffer_cap
    }

    fn shutdown(&self) -> Result<()> {
        self.stop_worker();
        let mut guard = self.lock_state();
        // Queued requests were never granted, so their bytes never
        // reached the wait buffer.
        while let Some(req) = guard.requests.pop_front() {
            req.permit.resolve(PermitState::Shutdown);
        }
        if guard.sync_buf_bytes != 0 || guard.wait_buf_bytes != 0 || guard.ignore_sync_bytes != 0
        {
            warn!(
                target: "cafs::dirty",
                sync_buf = guard.sync_buf_bytes,
                wait_buf = guard.wait_buf_bytes,
                ignore = guard.ignore_sync_bytes,
                "dirty_bytes_leftover_on_shutdown"
            );
            return Err(CafsError::LeftoverDirtyBytes {
                sync_buf: guard.sync_buf_bytes,
                wait_buf: guard.wait_buf_bytes,
                ignore: guard.ignore_sync_bytes,
            });
        }
        Ok(())
    }
}

impl Drop for DirtyBlockCacheStandard {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

// ── Permission worker ───────────────────────────────────────────────────────

#[allow(clippy::too_many_lines)]
fn process_permission(shared: &Shared) {
    let config = shared.config;
    let mut current: Option<DirtyRequest> = None;
    let mut backpressure = Duration::ZERO;
    let mut max_wakeup = Duration::ZERO;
    let mut decreased = false;
    let mut frac_so_far = 0.0_f64;
    let mut last_known_timeout = Duration::ZERO;

    let mut guard = shared.state.lock();
    loop {
        if current.is_some() {
            // Make sure we wake up in time to shrink the buffer.
            if !decreased && (backpressure.is_zero() || max_wakeup < backpressure) {
                backpressure = max_wakeup;
            }
        } else if guard.sync_started.is_some() {
            backpressure = max_wakeup;
        }

        let wake_at = (!backpressure.is_zero()).then(|| Instant::now() + backpressure);
        loop {
            if guard.shutdown {
                if let Some(req) = current.take() {
                    // Hand the request back so shutdown resolves it.
                    guard.requests.push_front(req);
                }
                return;
            }
            if guard.bytes_decreased {
                guard.bytes_decreased = false;
                break;
            }
            if current.is_none() {
                if let Some(req) = guard.requests.pop_front() {
                    current = Some(req);
                    decreased = false;
                    break;
                }
            }
            match wake_at {
                Some(at) => {
                    if shared.wakeup.wait_until(&mut guard, at).timed_out() {
                        break;
                    }
                }
                None => shared.wakeup.wait(&mut guard),
            }
        }

        let now = Instant::now();
        guard.maybe_reset_buffer_cap(config.min_sync_buffer_cap, now);

        if current.is_some() || !max_wakeup.is_zero() {
            if let Some(started) = guard.sync_started {
                let deadline = started + last_known_timeout;
                (decreased, max_wakeup, frac_so_far) = guard.maybe_decrease_buffer(
                    started,
                    deadline,
                    frac_so_far,
                    config.min_sync_buffer_cap,
                    now,
                );
            } else {
                max_wakeup = Duration::ZERO;
            }
        }

        let Some(req) = current.as_ref() else {
            continue;
        };
        last_known_timeout = req.deadline.saturating_duration_since(req.start);
        backpressure =
            guard.calc_backpressure(req.start, req.deadline, config.backpressure_slack, now);
        if backpressure.is_zero() && guard.accept_new_write(req.bytes, config.max_sync_buffer_cap)
        {
            trace!(target: "cafs::dirty", bytes = req.bytes, "dirty_permission_granted");
            req.permit.resolve(PermitState::Granted);
            current = None;
        } else if !backpressure.is_zero() {
            if guard.sync_started.is_none() {
                guard.sync_started = Some(now);
                frac_so_far = 0.0;
            }
            debug!(
                target: "cafs::dirty",
                backpressure_ms = backpressure.as_millis(),
                wait_buf = guard.wait_buf_bytes,
                sync_buffer_cap = guard.sync_buffer_cap,
                "backpressure_applied"
            );
        }
    }
}
