//! Admission control for the dirty block cache
//!
//! Writers ask for permission to dirty a number of bytes before buffering a
//! block. The controller tracks two counters:
//!
//! - **unsynced**: bytes buffered in memory that no sync round has picked up
//! - **syncing**: bytes handed to an in-flight sync round
//!
//! A request is granted immediately whenever the buffered total is below the
//! hard cap at the time of the call, even if the grant itself overshoots the
//! cap. Otherwise it joins a FIFO queue and is granted by the completion
//! notification that brings the total back under the cap. A released waiter's
//! bytes count against the hard cap at once, but only move into `unsynced`
//! once its token observes the grant.
//!
//! ```text
//! request ──► Granted (unsynced) ──block_sync_finished──► syncing ──sync_finished──► released
//!    │
//!    └─(total >= hard cap)──► queued ──(room again)──► Granted
//! ```
//!
//! Between the soft threshold and the hard cap, [`AdmissionController::calc_backpressure`]
//! hands out a graduated delay so writers slow down before they hit the cap.

use crate::clock::Clock;
use crate::error::{BlockError, BlockResult};

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use stratafs_common::DirtyCacheConfig;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const COMPONENT: &str = "DirtyBlockCache";

/// A queued request waiting for room under the hard cap
struct Waiter {
    id: u64,
    bytes: u64,
    tx: oneshot::Sender<()>,
}

/// Counters and queue, all guarded by one lock
struct AdmissionState {
    unsynced_bytes: u64,
    syncing_bytes: u64,
    /// Released from the queue, not yet claimed by the token
    pending_grant_bytes: u64,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    shut_down: bool,
}

impl AdmissionState {
    const fn total(&self) -> u64 {
        self.unsynced_bytes
            .saturating_add(self.syncing_bytes)
            .saturating_add(self.pending_grant_bytes)
    }
}

struct Shared {
    state: Mutex<AdmissionState>,
    soft_threshold: u64,
    hard_cap: u64,
    reserve: Duration,
    clock: Arc<dyn Clock>,
}

impl Shared {
    /// Grant queued requests, oldest first, while the total is under the cap
    fn release_waiters(&self, state: &mut AdmissionState) {
        while state.total() < self.hard_cap {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(()).is_err() {
                continue;
            }
            state.pending_grant_bytes = state.pending_grant_bytes.saturating_add(waiter.bytes);
            debug!(
                "Released queued dirty request of {} bytes (unsynced={}, syncing={}, queued={})",
                waiter.bytes,
                state.unsynced_bytes,
                state.syncing_bytes,
                state.waiters.len()
            );
        }
    }

    /// Move a released request's bytes into the unsynced counter
    fn claim_grant(&self, bytes: u64) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        apply_delta(&mut state.pending_grant_bytes, -to_delta(bytes), "pending grant");
        state.unsynced_bytes = state.unsynced_bytes.saturating_add(bytes);
        trace!(
            "Claimed grant of {} bytes: unsynced={}, syncing={}",
            bytes, state.unsynced_bytes, state.syncing_bytes
        );
    }

    /// Forget a request whose caller stopped waiting
    ///
    /// If the grant raced ahead of the cancellation, the reserved bytes are
    /// handed back.
    fn abandon(&self, id: u64, bytes: u64, mut rx: oneshot::Receiver<()>) {
        let mut state = self.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
            debug!("Dropped queued dirty request of {} bytes", bytes);
            return;
        }
        if rx.try_recv().is_ok() && !state.shut_down {
            apply_delta(&mut state.pending_grant_bytes, -to_delta(bytes), "pending grant");
            debug!("Refunded {} bytes from an abandoned grant", bytes);
            self.release_waiters(&mut state);
        }
    }
}

/// Why a token will never be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Cancelled,
    Shutdown,
}

impl Failure {
    fn into_error(self) -> BlockError {
        match self {
            Self::Cancelled => BlockError::Cancelled,
            Self::Shutdown => BlockError::Shutdown(COMPONENT),
        }
    }
}

enum TokenStatus {
    Granted,
    Queued { id: u64, rx: oneshot::Receiver<()> },
    Failed(Failure),
}

/// Future-style handle returned by [`AdmissionController::request_permission_to_dirty`]
///
/// Dropping a token that has not been observed as granted gives up the
/// request, exactly like cancelling it.
#[must_use = "a permission token does nothing unless waited on"]
pub struct PermissionToken {
    bytes: u64,
    status: TokenStatus,
    cancel: CancellationToken,
    shared: Arc<Shared>,
}

impl PermissionToken {
    /// Number of bytes this token reserves
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Wait until the request is granted
    ///
    /// Fails with [`BlockError::Cancelled`] if the caller's cancellation token
    /// fires first and with [`BlockError::Shutdown`] if the cache is torn
    /// down while the request is queued.
    pub async fn wait(mut self) -> BlockResult<()> {
        let outcome = match &mut self.status {
            TokenStatus::Granted => Ok(()),
            TokenStatus::Failed(failure) => Err(*failure),
            TokenStatus::Queued { rx, .. } => {
                tokio::select! {
                    biased;
                    granted = rx => granted.map_err(|_| Failure::Shutdown),
                    () = self.cancel.cancelled() => Err(Failure::Cancelled),
                }
            }
        };
        self.settle(outcome)
    }

    /// Check for a grant without blocking
    ///
    /// Returns `None` while the request is still queued.
    pub fn try_wait(&mut self) -> Option<BlockResult<()>> {
        let outcome = match &mut self.status {
            TokenStatus::Granted => Ok(()),
            TokenStatus::Failed(failure) => Err(*failure),
            TokenStatus::Queued { rx, .. } => match rx.try_recv() {
                Ok(()) => Ok(()),
                Err(oneshot::error::TryRecvError::Closed) => Err(Failure::Shutdown),
                Err(oneshot::error::TryRecvError::Empty) if self.cancel.is_cancelled() => {
                    Err(Failure::Cancelled)
                }
                Err(oneshot::error::TryRecvError::Empty) => return None,
            },
        };
        Some(self.settle(outcome))
    }

    fn settle(&mut self, outcome: Result<(), Failure>) -> BlockResult<()> {
        match outcome {
            Ok(()) => {
                if matches!(self.status, TokenStatus::Queued { .. }) {
                    self.shared.claim_grant(self.bytes);
                }
                self.status = TokenStatus::Granted;
                Ok(())
            }
            Err(failure) => {
                if failure == Failure::Cancelled {
                    self.abandon();
                }
                self.status = TokenStatus::Failed(failure);
                Err(failure.into_error())
            }
        }
    }

    fn abandon(&mut self) {
        let status = std::mem::replace(&mut self.status, TokenStatus::Failed(Failure::Cancelled));
        if let TokenStatus::Queued { id, rx } = status {
            self.shared.abandon(id, self.bytes, rx);
        }
    }
}

impl Drop for PermissionToken {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl std::fmt::Debug for PermissionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match &self.status {
            TokenStatus::Granted => "granted",
            TokenStatus::Queued { .. } => "queued",
            TokenStatus::Failed(Failure::Cancelled) => "cancelled",
            TokenStatus::Failed(Failure::Shutdown) => "shutdown",
        };
        f.debug_struct("PermissionToken")
            .field("bytes", &self.bytes)
            .field("status", &status)
            .finish()
    }
}

/// Snapshot of the admission counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionStats {
    /// Bytes dirtied but not yet picked up by a sync
    pub unsynced_bytes: u64,
    /// Bytes in an in-flight sync round
    pub syncing_bytes: u64,
    /// Bytes released to queued requests that have not yet observed the grant
    pub pending_grant_bytes: u64,
    /// Requests waiting for room
    pub queued_requests: usize,
    /// Bytes requested by queued requests
    pub queued_bytes: u64,
}

/// Tracks buffered bytes and decides when writers may proceed
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    /// Create a controller with the given limits
    pub fn new(config: &DirtyCacheConfig, clock: Arc<dyn Clock>) -> BlockResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(AdmissionState {
                    unsynced_bytes: 0,
                    syncing_bytes: 0,
                    pending_grant_bytes: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    shut_down: false,
                }),
                soft_threshold: config.soft_threshold_bytes,
                hard_cap: config.hard_cap_bytes,
                reserve: config.backpressure_reserve(),
                clock,
            }),
        })
    }

    /// Ask for permission to dirty `bytes` bytes
    ///
    /// Never blocks: the returned token is either already granted or queued.
    pub fn request_permission_to_dirty(
        &self,
        cancel: &CancellationToken,
        bytes: u64,
    ) -> BlockResult<PermissionToken> {
        let mut state = self.shared.state.lock();
        if state.shut_down {
            return Err(BlockError::Shutdown(COMPONENT));
        }
        if cancel.is_cancelled() {
            return Err(BlockError::Cancelled);
        }

        let status = if state.total() < self.shared.hard_cap {
            state.unsynced_bytes = state.unsynced_bytes.saturating_add(bytes);
            debug!(
                "Granted dirty request of {} bytes (unsynced={}, syncing={})",
                bytes, state.unsynced_bytes, state.syncing_bytes
            );
            TokenStatus::Granted
        } else {
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, bytes, tx });
            debug!(
                "Blocked dirty request of {} bytes (unsynced={}, syncing={}, queued={})",
                bytes,
                state.unsynced_bytes,
                state.syncing_bytes,
                state.waiters.len()
            );
            TokenStatus::Queued { id, rx }
        };

        Ok(PermissionToken {
            bytes,
            status,
            cancel: cancel.clone(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Reconcile an earlier reservation with the real encoded size
    ///
    /// `delta` is applied to the syncing counter when `is_syncing` is set, and
    /// to the unsynced counter otherwise.
    pub fn update_unsynced_bytes(&self, delta: i64, is_syncing: bool) {
        let mut state = self.shared.state.lock();
        if is_syncing {
            apply_delta(&mut state.syncing_bytes, delta, "syncing");
        } else {
            apply_delta(&mut state.unsynced_bytes, delta, "unsynced");
        }
        trace!(
            "Applied {} byte correction (syncing={}): unsynced={}, syncing={}",
            delta, is_syncing, state.unsynced_bytes, state.syncing_bytes
        );
        if delta < 0 {
            self.shared.release_waiters(&mut state);
        }
    }

    /// A block's bytes have been handed to the current sync round
    pub fn block_sync_finished(&self, size: u64) {
        let mut state = self.shared.state.lock();
        let moved = size.min(state.unsynced_bytes);
        if moved < size {
            warn!(
                "Block sync of {} bytes exceeds unsynced total of {}",
                size, state.unsynced_bytes
            );
        }
        state.unsynced_bytes -= moved;
        state.syncing_bytes = state.syncing_bytes.saturating_add(size);
        trace!(
            "Block sync finished: unsynced={}, syncing={}",
            state.unsynced_bytes, state.syncing_bytes
        );
    }

    /// A sync round's writes are durable
    pub fn sync_finished(&self, size: u64) {
        let mut state = self.shared.state.lock();
        apply_delta(&mut state.syncing_bytes, -to_delta(size), "syncing");
        debug!(
            "Sync of {} bytes finished: unsynced={}, syncing={}",
            size, state.unsynced_bytes, state.syncing_bytes
        );
        self.shared.release_waiters(&mut state);
    }

    /// Whether enough bytes are buffered that a sync should start now
    #[must_use]
    pub fn should_force_sync(&self) -> bool {
        self.shared.state.lock().unsynced_bytes >= self.shared.soft_threshold
    }

    /// How long a writer with the given deadline should pause
    ///
    /// The delay grows linearly from zero at the soft threshold to the whole
    /// usable slack at the hard cap. The slack is measured from the
    /// controller's clock, not from `reference`, minus the configured reserve
    /// kept back for the flush itself.
    #[must_use]
    pub fn calc_backpressure(&self, reference: Instant, deadline: Instant) -> Duration {
        let unsynced = self.shared.state.lock().unsynced_bytes;
        let soft = self.shared.soft_threshold;
        if unsynced <= soft {
            return Duration::ZERO;
        }

        let now = self.shared.clock.now();
        let slack = deadline
            .saturating_duration_since(now)
            .saturating_sub(self.shared.reserve);
        let span = self.shared.hard_cap - soft;
        if span == 0 {
            return slack;
        }

        let over = (unsynced - soft).min(span);
        let nanos = slack.as_nanos() * u128::from(over) / u128::from(span);
        let delay = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        trace!(
            "Backpressure {:?} for unsynced={} (requested at {:?} ago)",
            delay,
            unsynced,
            now.saturating_duration_since(reference)
        );
        delay
    }

    /// Snapshot of the counters
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let state = self.shared.state.lock();
        AdmissionStats {
            unsynced_bytes: state.unsynced_bytes,
            syncing_bytes: state.syncing_bytes,
            pending_grant_bytes: state.pending_grant_bytes,
            queued_requests: state.waiters.len(),
            queued_bytes: state.waiters.iter().map(|w| w.bytes).sum(),
        }
    }

    /// The controller's clock
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// Discard all state; queued requests fail with `Shutdown`
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        let dropped = state.waiters.len();
        state.waiters.clear();
        state.unsynced_bytes = 0;
        state.syncing_bytes = 0;
        state.pending_grant_bytes = 0;
        debug!("Admission controller shut down, dropped {} queued requests", dropped);
    }
}

fn to_delta(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Apply a signed correction, clamping at zero
fn apply_delta(counter: &mut u64, delta: i64, name: &str) {
    if delta >= 0 {
        *counter = counter.saturating_add(delta.unsigned_abs());
        return;
    }
    let decrease = delta.unsigned_abs();
    if decrease > *counter {
        warn!(
            "Correction of {} would drive {} bytes below zero (was {})",
            delta, name, *counter
        );
    }
    *counter = counter.saturating_sub(decrease);
}
