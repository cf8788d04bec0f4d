//! Correlation-id-keyed pending-request table.
//!
//! A caller registers its correlation id and waits on the returned oneshot;
//! the connection's reader task completes entries as replies arrive. A
//! periodic sweep drops entries whose deadline passed, so replies to calls
//! that already timed out are discarded instead of leaking table slots.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::frame::MgmtResponse;

struct Pending {
    tx: oneshot::Sender<MgmtResponse>,
    deadline: Instant,
}

/// Table of management calls awaiting their reply.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<Uuid, Pending>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and return the receiver its reply will arrive on.
    pub async fn register(
        &self,
        correlation_id: Uuid,
        deadline: Instant,
    ) -> oneshot::Receiver<MgmtResponse> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;
        inner.insert(correlation_id, Pending { tx, deadline });
        rx
    }

    /// Route a reply to its caller.
    ///
    /// Returns false when no caller is waiting (already timed out or never
    /// registered); such replies are dropped.
    pub async fn complete(&self, correlation_id: Uuid, response: MgmtResponse) -> bool {
        let entry = {
            let mut inner = self.inner.lock().await;
            inner.remove(&correlation_id)
        };

        match entry {
            Some(pending) => pending.tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Remove an entry whose caller gave up waiting.
    pub async fn remove(&self, correlation_id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.remove(&correlation_id);
    }

    /// Drop entries whose deadline has passed. Returns how many expired.
    pub async fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.len();
        inner.retain(|_, pending| pending.deadline > now);
        before - inner.len()
    }

    /// Drop every entry; their callers observe a closed channel.
    pub async fn abort_all(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let count = inner.len();
        inner.clear();
        count
    }

    /// Number of outstanding calls.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Returns true when no calls are outstanding.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
