//! Test harness for queue-scheduler integration tests.
//!
//! Provides an in-process scheduler (listener + reconciler wired to a real
//! ephemeral port) and a fake broker that speaks the management protocol
//! and tracks every call it serves.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use mqplane_address::Address;
use mqplane_mgmt::{read_frame, status, write_frame, Frame, Method, ResponseBody, PROTOCOL_VERSION};
use mqplane_queue_scheduler::{
    Config, ConnectionRegistry, Listener, ListenerConfig, Reconciler, SchedulerEvent, StatusReader,
};

/// Scheduler config tuned for fast tests.
#[allow(dead_code)]
pub fn test_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        status_addr: "127.0.0.1:0".parse().unwrap(),
        config_dirs: Vec::new(),
        poll_interval: Duration::from_millis(100),
        request_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        worker_pool_size: 4,
        max_connections: 32,
        max_attempts: 3,
    }
}

/// An in-process scheduler bound to an ephemeral port.
#[allow(dead_code)]
pub struct SchedulerHandle {
    pub amqp_addr: SocketAddr,
    pub events: mpsc::Sender<SchedulerEvent>,
    pub status: StatusReader,
    shutdown_tx: watch::Sender<bool>,
}

#[allow(dead_code)]
impl SchedulerHandle {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(256);

        let (reconciler, status) = Reconciler::new(&config, events_rx, events_tx.clone());
        tokio::spawn(reconciler.run(shutdown_rx.clone()));

        let registry = Arc::new(ConnectionRegistry::new());
        let listener_config = ListenerConfig {
            bind_addr: config.listen_addr,
            max_connections: config.max_connections,
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
        };
        let listener = Arc::new(
            Listener::bind(listener_config, registry, events_tx.clone())
                .await
                .expect("bind listener"),
        );
        let amqp_addr = listener.local_addr().expect("listener addr");
        tokio::spawn(listener.run());

        Self {
            amqp_addr,
            events: events_tx,
            status,
            shutdown_tx,
        }
    }

    /// Replace a group's desired set, as the config adapter would.
    pub async fn set_group(&self, group_id: &str, names: &[&str]) {
        let desired: BTreeSet<Address> = names.iter().map(|n| Address::queue(*n)).collect();
        self.events
            .send(SchedulerEvent::GroupsChanged {
                group_id: group_id.to_string(),
                desired,
            })
            .await
            .expect("scheduler event stream open");
    }

    /// Wait until the group reports the given phase and queue count.
    pub async fn wait_for_queue_count(&self, group_id: &str, expected: i64) {
        let status = self.status.clone();
        let group = group_id.to_string();
        wait_until(&format!("{} to report {} queues", group_id, expected), || {
            status.num_queues(&group) == Some(expected)
        })
        .await;
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Options for a fake broker.
#[allow(dead_code)]
#[derive(Default)]
pub struct FakeBrokerOptions {
    /// Queues already present before the scheduler connects.
    pub initial_queues: BTreeSet<String>,

    /// Queue names whose CREATE always fails with an internal error.
    pub fail_creates: HashSet<String>,
}

/// Outcome of a fake broker's connection attempt.
#[allow(dead_code)]
pub enum ConnectOutcome {
    Accepted(FakeBroker),
    Rejected(Option<String>),
}

#[allow(dead_code)]
impl ConnectOutcome {
    pub fn unwrap_accepted(self) -> FakeBroker {
        match self {
            ConnectOutcome::Accepted(broker) => broker,
            ConnectOutcome::Rejected(condition) => {
                panic!("connection rejected: {:?}", condition)
            }
        }
    }

    pub fn unwrap_rejected(self) -> Option<String> {
        match self {
            ConnectOutcome::Accepted(broker) => {
                panic!("expected rejection, but {} was accepted", broker.group_id)
            }
            ConnectOutcome::Rejected(condition) => condition,
        }
    }
}

/// A fake broker process: opens a session, serves management calls against
/// an in-memory queue set, and counts what it served.
#[allow(dead_code)]
pub struct FakeBroker {
    pub group_id: String,
    queues: Arc<Mutex<BTreeSet<String>>>,
    create_calls: Arc<AtomicU64>,
    delete_calls: Arc<AtomicU64>,
    list_calls: Arc<AtomicU64>,
    count_calls: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl FakeBroker {
    pub async fn connect(addr: SocketAddr, group_id: &str) -> ConnectOutcome {
        Self::connect_with(addr, group_id, FakeBrokerOptions::default()).await
    }

    pub async fn connect_with(
        addr: SocketAddr,
        group_id: &str,
        options: FakeBrokerOptions,
    ) -> ConnectOutcome {
        let mut stream = TcpStream::connect(addr).await.expect("connect to scheduler");

        write_frame(
            &mut stream,
            &Frame::Open {
                container_id: group_id.to_string(),
                protocol: PROTOCOL_VERSION,
            },
        )
        .await
        .expect("send open");

        match read_frame(&mut stream).await.expect("handshake reply") {
            Frame::OpenOk => {}
            Frame::Close { condition } => return ConnectOutcome::Rejected(condition),
            other => panic!("unexpected handshake reply: {:?}", other),
        }

        let queues = Arc::new(Mutex::new(options.initial_queues));
        let create_calls = Arc::new(AtomicU64::new(0));
        let delete_calls = Arc::new(AtomicU64::new(0));
        let list_calls = Arc::new(AtomicU64::new(0));
        let count_calls = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        {
            let queues = Arc::clone(&queues);
            let create_calls = Arc::clone(&create_calls);
            let delete_calls = Arc::clone(&delete_calls);
            let list_calls = Arc::clone(&list_calls);
            let count_calls = Arc::clone(&count_calls);
            let fail_creates = options.fail_creates;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        frame = read_frame(&mut stream) => {
                            let Ok(frame) = frame else { break };
                            match frame {
                                Frame::Request { correlation_id, application_properties } => {
                                    let reply = match application_properties.method {
                                        Method::Create => {
                                            create_calls.fetch_add(1, Ordering::Relaxed);
                                            let name = application_properties.address.unwrap_or_default();
                                            if fail_creates.contains(&name) {
                                                Frame::response(correlation_id, status::INTERNAL_ERROR, None)
                                            } else {
                                                let created = queues.lock().unwrap().insert(name);
                                                let reply_status = if created { status::CREATED } else { status::ALREADY_EXISTS };
                                                Frame::response(correlation_id, reply_status, None)
                                            }
                                        }
                                        Method::Delete => {
                                            delete_calls.fetch_add(1, Ordering::Relaxed);
                                            let name = application_properties.address.unwrap_or_default();
                                            let removed = queues.lock().unwrap().remove(&name);
                                            let reply_status = if removed { status::OK } else { status::NOT_FOUND };
                                            Frame::response(correlation_id, reply_status, None)
                                        }
                                        Method::List => {
                                            list_calls.fetch_add(1, Ordering::Relaxed);
                                            let names: Vec<String> = queues.lock().unwrap().iter().cloned().collect();
                                            Frame::response(correlation_id, status::OK, Some(ResponseBody::Queues(names)))
                                        }
                                        Method::Count => {
                                            count_calls.fetch_add(1, Ordering::Relaxed);
                                            let count = queues.lock().unwrap().len() as i64;
                                            Frame::response(correlation_id, status::OK, Some(ResponseBody::Count(count)))
                                        }
                                    };
                                    if write_frame(&mut stream, &reply).await.is_err() {
                                        break;
                                    }
                                }
                                Frame::Close { .. } => break,
                                _ => {}
                            }
                        }
                        _ = &mut shutdown_rx => break,
                    }
                }
            });
        }

        ConnectOutcome::Accepted(FakeBroker {
            group_id: group_id.to_string(),
            queues,
            create_calls,
            delete_calls,
            list_calls,
            count_calls,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// The broker's current queue set.
    pub fn queues(&self) -> BTreeSet<String> {
        self.queues.lock().unwrap().clone()
    }

    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }

    /// Every management call served, all verbs.
    pub fn total_calls(&self) -> u64 {
        self.create_calls.load(Ordering::Relaxed)
            + self.delete_calls.load(Ordering::Relaxed)
            + self.list_calls.load(Ordering::Relaxed)
            + self.count_calls.load(Ordering::Relaxed)
    }

    /// Drop the session abruptly, as a dying broker pod would.
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Poll a condition until it holds or a 5s deadline passes.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[allow(dead_code)]
pub fn queue_names(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[allow(dead_code)]
pub fn config_dir_entry(group_id: &str) -> serde_json::Value {
    serde_json::json!({
        "store_and_forward": true,
        "multicast": false,
        "group_id": group_id,
    })
}

#[allow(dead_code)]
pub fn write_entry_file(dir: &std::path::Path, name: &str, group_id: &str) {
    std::fs::write(
        dir.join(format!("{}.json", name)),
        config_dir_entry(group_id).to_string(),
    )
    .expect("write entry file");
}

#[allow(dead_code)]
pub fn entry_path(dir: &std::path::Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}
