//! AMQP listener and connection admission.
//!
//! This module accepts inbound broker connections, performs the Open
//! handshake, enforces at-most-one broker per group, and feeds
//! connect/disconnect events into the reconciler's event stream.
//!
//! - Handshake and all per-connection work run on the connection's own
//!   task, never on the accept loop
//! - A second connection claiming an already-live group id is rejected
//!   with `Close {condition: "amqp:resource-locked"}`; the incumbent is
//!   undisturbed
//! - Connection sequence numbers guard teardown so a stale close never
//!   evicts a successor connection for the same group

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mqplane_mgmt::{
    read_frame, write_frame, Frame, CONDITION_DECODE_ERROR, CONDITION_NOT_ALLOWED,
    CONDITION_RESOURCE_LOCKED, PROTOCOL_VERSION,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::BrokerConnection;
use crate::config::Config;
use crate::reconciler::SchedulerEvent;

/// Default maximum concurrent broker connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Configuration for the AMQP listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Timeout for the Open handshake.
    pub handshake_timeout: Duration,
    /// Per-call management timeout handed to each connection.
    pub request_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Derive the listener configuration from the service config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.listen_addr,
            max_connections: config.max_connections,
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
        }
    }
}

/// Statistics for the listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently active.
    pub connections_active: AtomicU64,
    /// Connections rejected due to the max-connections limit.
    pub connections_rejected: AtomicU64,
    /// Connections rejected because their group already has a live broker.
    pub duplicate_brokers: AtomicU64,
    /// Handshakes that timed out or carried a bad first frame.
    pub handshake_failures: AtomicU64,
}

/// Registry of live broker connections, keyed by group id.
///
/// Admission control only: the slot is claimed before OpenOk goes out and
/// released when the session ends. The reconciler learns about connections
/// through the event stream, never by reading this registry.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    slots: HashMap<String, u64>,
    next_seq: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a group. Returns the new connection's sequence
    /// number, or None when the group already has a live connection.
    pub async fn claim(&self, group_id: &str) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if inner.slots.contains_key(group_id) {
            return None;
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.slots.insert(group_id.to_string(), seq);
        Some(seq)
    }

    /// Release the slot if this connection still owns it.
    pub async fn release(&self, group_id: &str, seq: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.slots.get(group_id) {
            Some(&live) if live == seq => {
                inner.slots.remove(group_id);
                true
            }
            _ => false,
        }
    }

    /// Returns true when the group has a live connection.
    pub async fn contains(&self, group_id: &str) -> bool {
        self.inner.lock().await.slots.contains_key(group_id)
    }

    /// Number of live connections.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }
}

/// The AMQP listener.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    events: mpsc::Sender<SchedulerEvent>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listener.
    pub async fn bind(
        config: ListenerConfig,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "AMQP listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            registry,
            events,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the accept loop.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "AMQP listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(
                                    peer_addr = %peer_addr,
                                    error = %e,
                                    "Connection error"
                                );
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("broker_session", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid a tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle one broker session from handshake to teardown.
    async fn handle_connection(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let open = match tokio::time::timeout(
            self.config.handshake_timeout,
            read_frame(&mut stream),
        )
        .await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                debug!(peer_addr = %peer_addr, error = %e, "Handshake read failed");
                return Ok(());
            }
            Err(_) => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Handshake timed out");
                return Ok(());
            }
        };

        let (container_id, protocol) = match open {
            Frame::Open {
                container_id,
                protocol,
            } => (container_id, protocol),
            other => {
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, frame = ?other, "First frame was not Open");
                let _ = write_frame(
                    &mut stream,
                    &Frame::Close {
                        condition: Some(CONDITION_NOT_ALLOWED.to_string()),
                    },
                )
                .await;
                return Ok(());
            }
        };

        if protocol != PROTOCOL_VERSION {
            self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer_addr = %peer_addr,
                group_id = %container_id,
                expected = PROTOCOL_VERSION,
                got = protocol,
                "Protocol version mismatch"
            );
            let _ = write_frame(
                &mut stream,
                &Frame::Close {
                    condition: Some(CONDITION_DECODE_ERROR.to_string()),
                },
            )
            .await;
            return Ok(());
        }

        // At most one broker per group: claim the slot before accepting.
        let Some(seq) = self.registry.claim(&container_id).await else {
            self.stats.duplicate_brokers.fetch_add(1, Ordering::Relaxed);
            warn!(
                peer_addr = %peer_addr,
                group_id = %container_id,
                "Rejecting duplicate broker for live group"
            );
            let _ = write_frame(
                &mut stream,
                &Frame::Close {
                    condition: Some(CONDITION_RESOURCE_LOCKED.to_string()),
                },
            )
            .await;
            return Ok(());
        };

        if let Err(e) = write_frame(&mut stream, &Frame::OpenOk).await {
            self.registry.release(&container_id, seq).await;
            return Err(e.into());
        }

        info!(
            peer_addr = %peer_addr,
            group_id = %container_id,
            connection_seq = seq,
            "Broker connected"
        );

        let (read_half, write_half) = stream.into_split();
        let connection = BrokerConnection::new(
            container_id.clone(),
            seq,
            write_half,
            self.config.request_timeout,
        );
        let handle = connection.handle();

        if self
            .events
            .send(SchedulerEvent::BrokerConnected {
                group_id: container_id.clone(),
                broker: handle,
            })
            .await
            .is_err()
        {
            // Scheduler is gone; nothing will drive this connection.
            self.registry.release(&container_id, seq).await;
            return Ok(());
        }

        // The session lives here until the broker goes away.
        connection.run_reader(read_half).await;

        self.registry.release(&container_id, seq).await;
        info!(
            group_id = %container_id,
            connection_seq = seq,
            "Broker disconnected"
        );
        let _ = self
            .events
            .send(SchedulerEvent::BrokerDisconnected {
                group_id: container_id,
                connection_seq: seq,
            })
            .await;

        Ok(())
    }
}
