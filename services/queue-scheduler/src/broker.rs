//! Broker connection and management client.
//!
//! Each accepted session is wrapped in a `BrokerConnection`: a writer half
//! guarded by a lock, a pending-request table, and a reader task that
//! routes replies by correlation id. The `ManagementClient` is the cloneable
//! calling surface handed to sync passes.
//!
//! Calls on one connection are serialized — the writer lock is held for the
//! full round trip — so a slow broker only ever sees one management request
//! at a time. Different brokers are driven concurrently.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use mqplane_address::Address;
use mqplane_mgmt::{
    read_frame, status, write_frame, Frame, FrameError, ManagementError, Method, MgmtResponse,
    PendingRequests, ResponseBody,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

struct ConnectionShared {
    group_id: String,
    connection_seq: u64,
    connected_at: DateTime<Utc>,
    request_timeout: Duration,
    writer: Mutex<OwnedWriteHalf>,
    pending: PendingRequests,
    closed: AtomicBool,
}

/// One live broker session, owned by its connection task.
pub struct BrokerConnection {
    shared: Arc<ConnectionShared>,
}

impl BrokerConnection {
    /// Wrap the write half of an accepted, already-opened session.
    pub fn new(
        group_id: impl Into<String>,
        connection_seq: u64,
        writer: OwnedWriteHalf,
        request_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                group_id: group_id.into(),
                connection_seq,
                connected_at: Utc::now(),
                request_timeout,
                writer: Mutex::new(writer),
                pending: PendingRequests::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Cheap-clone handle for the scheduler state and sync passes.
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            client: ManagementClient {
                shared: Arc::clone(&self.shared),
            },
        }
    }

    /// Run the reader until the session ends, then abandon outstanding calls.
    ///
    /// Routes replies through the pending table; a reply nobody waits for
    /// anymore is dropped. A malformed frame is skipped (framing stays in
    /// sync); anything else that goes wrong ends the session.
    pub async fn run_reader(self, mut reader: OwnedReadHalf) {
        let sweeper = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(shared.request_timeout);
                loop {
                    interval.tick().await;
                    if shared.closed.load(Ordering::Relaxed) {
                        break;
                    }
                    let expired = shared.pending.sweep(Instant::now()).await;
                    if expired > 0 {
                        debug!(
                            group_id = %shared.group_id,
                            expired,
                            "Swept expired management calls"
                        );
                    }
                }
            })
        };

        loop {
            match read_frame(&mut reader).await {
                Ok(Frame::Response {
                    correlation_id,
                    status,
                    body,
                }) => {
                    let routed = self
                        .shared
                        .pending
                        .complete(correlation_id, MgmtResponse { status, body })
                        .await;
                    if !routed {
                        debug!(
                            group_id = %self.shared.group_id,
                            correlation_id = %correlation_id,
                            "Dropping reply with no waiting caller"
                        );
                    }
                }
                Ok(Frame::Close { condition }) => {
                    debug!(
                        group_id = %self.shared.group_id,
                        condition = ?condition,
                        "Broker closed the session"
                    );
                    break;
                }
                Ok(other) => {
                    warn!(
                        group_id = %self.shared.group_id,
                        frame = ?other,
                        "Unexpected frame from broker"
                    );
                }
                Err(FrameError::Malformed(reason)) => {
                    warn!(
                        group_id = %self.shared.group_id,
                        reason = %reason,
                        "Skipping malformed frame"
                    );
                }
                Err(FrameError::Closed) => {
                    debug!(group_id = %self.shared.group_id, "Session ended");
                    break;
                }
                Err(e) => {
                    warn!(
                        group_id = %self.shared.group_id,
                        error = %e,
                        "Session read failed"
                    );
                    break;
                }
            }
        }

        sweeper.abort();
        self.shutdown().await;
    }

    /// Mark the connection closed and fail every outstanding call.
    async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        let abandoned = self.shared.pending.abort_all().await;
        if abandoned > 0 {
            debug!(
                group_id = %self.shared.group_id,
                abandoned,
                "Abandoned in-flight management calls"
            );
        }
    }
}

/// Calling surface for management operations on one broker.
#[derive(Clone)]
pub struct ManagementClient {
    shared: Arc<ConnectionShared>,
}

impl ManagementClient {
    pub fn group_id(&self) -> &str {
        &self.shared.group_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Relaxed)
    }

    /// One request/response round trip with the connection's timeout.
    async fn call(
        &self,
        method: Method,
        address: Option<String>,
    ) -> Result<MgmtResponse, ManagementError> {
        if self.is_closed() {
            return Err(ManagementError::ConnectionLost);
        }

        let correlation_id = Uuid::new_v4();
        let timeout = self.shared.request_timeout;
        let rx = self
            .shared
            .pending
            .register(correlation_id, Instant::now() + timeout)
            .await;

        // Held across the round trip: one call in flight per connection.
        let mut writer = self.shared.writer.lock().await;

        let frame = Frame::request(correlation_id, method, address);
        if let Err(e) = write_frame(&mut *writer, &frame).await {
            self.shared.pending.remove(correlation_id).await;
            debug!(
                group_id = %self.shared.group_id,
                error = %e,
                "Management request write failed"
            );
            return Err(ManagementError::ConnectionLost);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // The pending table was torn down under us: session lost.
            Ok(Err(_)) => Err(ManagementError::ConnectionLost),
            Err(_) => {
                self.shared.pending.remove(correlation_id).await;
                Err(ManagementError::Timeout { elapsed: timeout })
            }
        }
    }

    /// Create a queue. Creating an already-present queue is success.
    pub async fn create_queue(&self, address: &Address) -> Result<(), ManagementError> {
        let response = self.call(Method::Create, Some(address.name.clone())).await?;
        match response.status {
            s if status::is_success(s) => Ok(()),
            status::ALREADY_EXISTS => Ok(()),
            s => Err(rejected(Method::Create, &address.name, s)),
        }
    }

    /// Delete a queue. Deleting an already-absent queue is success.
    pub async fn delete_queue(&self, name: &str) -> Result<(), ManagementError> {
        let response = self.call(Method::Delete, Some(name.to_string())).await?;
        match response.status {
            s if status::is_success(s) => Ok(()),
            status::NOT_FOUND => Ok(()),
            s => Err(rejected(Method::Delete, name, s)),
        }
    }

    /// List the queue names currently present on the broker.
    pub async fn list_queues(&self) -> Result<BTreeSet<String>, ManagementError> {
        let response = self.call(Method::List, None).await?;
        if !status::is_success(response.status) {
            return Err(rejected(Method::List, "", response.status));
        }
        match response.body {
            Some(ResponseBody::Queues(names)) => Ok(names.into_iter().collect()),
            _ => Err(ManagementError::Rejected {
                status: response.status,
                description: "LIST reply carried no queue list".to_string(),
            }),
        }
    }

    /// Number of queues currently present on the broker.
    pub async fn queue_count(&self) -> Result<i64, ManagementError> {
        let response = self.call(Method::Count, None).await?;
        if !status::is_success(response.status) {
            return Err(rejected(Method::Count, "", response.status));
        }
        match response.body {
            Some(ResponseBody::Count(n)) => Ok(n),
            _ => Err(ManagementError::Rejected {
                status: response.status,
                description: "COUNT reply carried no count".to_string(),
            }),
        }
    }
}

fn rejected(method: Method, target: &str, status: u32) -> ManagementError {
    let description = if target.is_empty() {
        method.to_string()
    } else {
        format!("{} {}", method, target)
    };
    ManagementError::Rejected {
        status,
        description,
    }
}

/// Cheap-clone reference to a live broker connection.
#[derive(Clone)]
pub struct BrokerHandle {
    client: ManagementClient,
}

impl BrokerHandle {
    pub fn client(&self) -> ManagementClient {
        self.client.clone()
    }

    pub fn group_id(&self) -> &str {
        self.client.group_id()
    }

    pub fn connection_seq(&self) -> u64 {
        self.client.shared.connection_seq
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.client.shared.connected_at
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("group_id", &self.group_id())
            .field("connection_seq", &self.connection_seq())
            .field("closed", &self.is_closed())
            .finish()
    }
}
