//! Shared plumbing for the collective phases: chunk layout, abandoned-call
//! tracking, and timeout-wrapped edge sends/receives.

use std::collections::HashSet;
use std::pin::pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{ArborError, Result};
use crate::protocol::TreeMessage;
use crate::transport::Link;

/// Split `count` elements into chunk element counts.
///
/// Every chunk holds `chunk_elems` elements except possibly the last,
/// which holds the remainder. Chunks are always element-aligned; a value
/// is never split across two chunks.
pub(crate) fn chunk_counts(count: usize, chunk_elems: usize) -> Vec<usize> {
    debug_assert!(count > 0 && chunk_elems > 0);
    let full = count / chunk_elems;
    let rem = count % chunk_elems;
    let mut counts = vec![chunk_elems; full];
    if rem > 0 {
        counts.push(rem);
    }
    counts
}

/// Calls that have been abandoned via a root reset.
///
/// Blocked edge waiters select against [`AbortTable::wait_abandoned`] so a
/// reset releases them promptly instead of leaving them to time out.
pub(crate) struct AbortTable {
    calls: Mutex<HashSet<u64>>,
    notify: Notify,
}

impl AbortTable {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Mark a call abandoned and wake every waiter.
    pub(crate) fn insert(&self, call: u64) {
        self.calls.lock().expect("abort table lock poisoned").insert(call);
        self.notify.notify_waiters();
    }

    pub(crate) fn contains(&self, call: u64) -> bool {
        self.calls
            .lock()
            .expect("abort table lock poisoned")
            .contains(&call)
    }

    /// Resolve once the call is marked abandoned.
    pub(crate) async fn wait_abandoned(&self, call: u64) {
        loop {
            // Arm the notification before checking, so an insert between
            // the check and the await is not lost.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.contains(call) {
                return;
            }
            notified.await;
        }
    }
}

/// Receive the next payload for `call` on one edge, bounded by the
/// collective timeout and interruptible by an abandon.
pub(crate) async fn edge_recv(
    abort: &AbortTable,
    link: &Link,
    call: u64,
    operation: &'static str,
    timeout: Duration,
) -> Result<TreeMessage> {
    let recv = async {
        tokio::select! {
            msg = link.recv(call) => msg,
            _ = abort.wait_abandoned(call) => Err(ArborError::CallAbandoned { call }),
        }
    };
    match tokio::time::timeout(timeout, recv).await {
        Ok(res) => res,
        Err(_) => Err(ArborError::CollectiveTimeout {
            operation,
            peer: link.peer(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Send one payload over an edge, bounded by the collective timeout.
///
/// A send only blocks when the peer has stopped draining its socket, so a
/// stalled peer surfaces here the same way it does on the receive side.
pub(crate) async fn edge_send(
    link: &Link,
    msg: &TreeMessage,
    operation: &'static str,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, link.send(msg)).await {
        Ok(res) => res,
        Err(_) => Err(ArborError::CollectiveTimeout {
            operation,
            peer: link.peer(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
