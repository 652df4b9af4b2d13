//! Outbound request correlation.
//!
//! Every outgoing request registers an entry here before its frame is
//! enqueued, so a racing response can never find an empty table. Resolution
//! removes the entry under the table lock, which is what makes "no waiter is
//! resolved more than once" hold: whoever removes the entry owns the
//! one-shot completion slot.
//!
//! Frames that arrive for an id that was already resolved are expected
//! races (the peer may send progress concurrently with a local timeout) and
//! are dropped with a trace, not faulted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::RemoteFault;
use crate::message::RequestId;

/// Per-request options for [`Connection::send_request_with`].
///
/// [`Connection::send_request_with`]: crate::connection::Connection::send_request_with
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Resolve the waiter cancelled and send a `Cancel` frame if no terminal
    /// response arrives within this duration. `None` falls back to the
    /// connection default.
    pub timeout: Option<Duration>,
    /// When set, every progress response for this request resets the timer
    /// to its original duration.
    pub keep_alive: bool,
    /// Cancellation scope linked to the caller. Cancelling it resolves the
    /// waiter and sends a single `Cancel` frame to the peer.
    pub cancel: CancelToken,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Why a waiter resolved cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    Caller,
    Timeout,
    ConnectionClosed,
}

/// Terminal outcome delivered to a waiter. At most one per request.
#[derive(Debug)]
pub(crate) enum Outcome {
    Success(Value),
    Fault(RemoteFault),
    Cancelled(CancelReason),
}

/// Deadline shared between the table (which extends it on keep-alive
/// progress) and the request's timer task (which fires when it passes).
#[derive(Debug)]
pub(crate) struct DeadlineState {
    period: Duration,
    deadline: Mutex<Instant>,
}

impl DeadlineState {
    pub(crate) fn starting_now(period: Duration) -> Arc<Self> {
        Arc::new(Self {
            period,
            deadline: Mutex::new(Instant::now() + period),
        })
    }

    /// Current deadline instant.
    pub(crate) fn get(&self) -> Instant {
        *self.deadline.lock()
    }

    /// True once the deadline has passed.
    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.get()
    }

    fn extend(&self) {
        *self.deadline.lock() = Instant::now() + self.period;
    }
}

pub(crate) struct Entry {
    pub(crate) method: String,
    pub(crate) waiter: oneshot::Sender<Outcome>,
    pub(crate) keep_alive: bool,
    pub(crate) deadline: Option<Arc<DeadlineState>>,
    pub(crate) timer: Option<JoinHandle<()>>,
    /// Stream for non-terminal intermediate results, when the caller asked
    /// for them.
    pub(crate) updates: Option<mpsc::UnboundedSender<Value>>,
}

#[derive(Default)]
pub(crate) struct RequestTable {
    entries: Mutex<HashMap<RequestId, Entry>>,
    /// Ids that were resolved locally. Distinguishes a late frame (expected
    /// race, dropped quietly) from a response to a request this endpoint
    /// never issued (protocol error).
    retired: Mutex<HashSet<RequestId>>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an entry. The caller must do this before enqueueing the
    /// request frame.
    pub(crate) fn insert(&self, id: RequestId, entry: Entry) {
        let replaced = self.entries.lock().insert(id, entry);
        debug_assert!(replaced.is_none(), "request id collision");
    }

    /// Resolve `id` with a terminal outcome. Returns `true` if this call won
    /// the entry; `false` if it was already resolved or never existed.
    pub(crate) fn resolve(&self, id: RequestId, outcome: Outcome) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.remove(&id) {
                Some(entry) => {
                    self.retired.lock().insert(id);
                    entry
                }
                None => return false,
            }
        };
        finish(id, entry, outcome);
        true
    }

    /// Resolve every outstanding entry, in connection-teardown order.
    pub(crate) fn resolve_all(&self, reason: CancelReason) {
        let drained: Vec<(RequestId, Entry)> = {
            let mut entries = self.entries.lock();
            let mut retired = self.retired.lock();
            retired.extend(entries.keys().copied());
            entries.drain().collect()
        };
        for (id, entry) in drained {
            finish(id, entry, Outcome::Cancelled(reason));
        }
    }

    /// Deliver a non-terminal intermediate result. The entry is retained.
    /// Returns `false` if no live entry exists.
    pub(crate) fn deliver_update(&self, id: RequestId, value: Value) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&id) else {
            return false;
        };
        if let Some(updates) = &entry.updates {
            // A dropped consumer is not an error; the request itself is
            // still in flight.
            let _ = updates.send(value);
        } else {
            tracing::debug!(
                request_id = %id,
                method = %entry.method,
                "intermediate result dropped: caller did not subscribe"
            );
        }
        true
    }

    /// Record a progress response: with keep-alive, the timer restarts at
    /// its original duration; without, progress is ignored. The entry is
    /// retained either way. Returns `false` if no live entry exists.
    pub(crate) fn note_progress(&self, id: RequestId) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(&id) else {
            return false;
        };
        if entry.keep_alive {
            if let Some(deadline) = &entry.deadline {
                deadline.extend();
                tracing::trace!(request_id = %id, "keep-alive progress extended deadline");
            }
        }
        true
    }

    /// Attach a running timer to an entry. If the entry was already
    /// resolved, the timer is aborted instead.
    pub(crate) fn arm_timer(&self, id: RequestId, timer: JoinHandle<()>) {
        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }
    }

    /// True if `id` was resolved at some point on this connection.
    pub(crate) fn was_resolved(&self, id: RequestId) -> bool {
        self.retired.lock().contains(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

fn finish(id: RequestId, entry: Entry, outcome: Outcome) {
    if let Some(timer) = entry.timer {
        timer.abort();
    }
    tracing::debug!(request_id = %id, method = %entry.method, outcome = ?&outcome, "request resolved");
    // The waiter may already be gone (caller dropped the future); that is
    // its prerogative.
    let _ = entry.waiter.send(outcome);
}

/// Timer task body for a request with a timeout. Sleeps until the shared
/// deadline passes, re-arming whenever keep-alive progress pushed it out,
/// then resolves the request cancelled and runs `on_timeout` (which sends
/// the `Cancel` frame).
pub(crate) async fn run_timeout(
    table: Arc<RequestTable>,
    id: RequestId,
    deadline: Arc<DeadlineState>,
    on_timeout: impl FnOnce() + Send + 'static,
) {
    loop {
        tokio::time::sleep_until(deadline.get()).await;
        if deadline.expired() {
            break;
        }
    }
    if table.resolve(id, Outcome::Cancelled(CancelReason::Timeout)) {
        tracing::debug!(request_id = %id, "request timed out");
        on_timeout();
    }
}
