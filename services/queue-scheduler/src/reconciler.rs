//! Reconciler core: the single serialized event stream that converges
//! per-group broker queue sets toward desired configuration.
//!
//! The reconciler:
//! - Consumes config-change and connect/disconnect events strictly in order
//! - Owns the scheduler state; nothing else mutates it
//! - Dispatches sync passes onto a bounded worker pool so a slow broker
//!   never stalls unrelated groups
//! - Feeds pass completions back through its own mailbox, which keeps the
//!   bookkeeping single-writer without any locks
//!
//! Per-group phases move `Unassigned -> Assigning -> Synced -> Unassigned`
//! on disconnect; a new desired set while connected re-enters `Assigning`,
//! and an exhausted retry budget parks the group in `Degraded` until the
//! next event.

use std::collections::BTreeSet;
use std::sync::Arc;

use mqplane_address::Address;
use mqplane_mgmt::ManagementError;
use mqplane_reconcile::{BackoffPolicy, QueuePlan};
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::broker::{BrokerHandle, ManagementClient};
use crate::config::Config;
use crate::state::{GroupPhase, SchedulerState, StatusReader, StatusSnapshot};

/// Events consumed by the reconciler, strictly in arrival order.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A group's desired address set was replaced wholesale.
    GroupsChanged {
        group_id: String,
        desired: BTreeSet<Address>,
    },

    /// A broker presented this group id and was admitted.
    BrokerConnected {
        group_id: String,
        broker: BrokerHandle,
    },

    /// The group's connection ended.
    BrokerDisconnected {
        group_id: String,
        connection_seq: u64,
    },

    /// A sync pass finished. Internal: completions re-enter the mailbox so
    /// state mutation stays on the event loop.
    SyncCompleted {
        group_id: String,
        epoch: u64,
        outcome: SyncOutcome,
    },
}

/// Result of one sync pass.
#[derive(Debug)]
pub enum SyncOutcome {
    /// The broker's queue set now matches the applied desired set.
    Synced {
        applied: BTreeSet<Address>,
        queue_count: i64,
    },

    /// Some addresses exhausted their retry budget.
    Degraded {
        failed: Vec<String>,
        queue_count: Option<i64>,
    },

    /// The session died mid-pass; the disconnect event does the bookkeeping.
    ConnectionLost,
}

/// The reconciler.
pub struct Reconciler {
    state: SchedulerState,
    events_rx: mpsc::Receiver<SchedulerEvent>,
    events_tx: mpsc::Sender<SchedulerEvent>,
    workers: Arc<Semaphore>,
    status_tx: watch::Sender<StatusSnapshot>,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl Reconciler {
    /// Create a reconciler and the status reader over its snapshots.
    ///
    /// `events_tx` must be the sender side of `events_rx`: sync passes use
    /// it to report their completion back into the event stream.
    pub fn new(
        config: &Config,
        events_rx: mpsc::Receiver<SchedulerEvent>,
        events_tx: mpsc::Sender<SchedulerEvent>,
    ) -> (Self, StatusReader) {
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());

        let reconciler = Self {
            state: SchedulerState::new(),
            events_rx,
            events_tx,
            workers: Arc::new(Semaphore::new(config.worker_pool_size)),
            status_tx,
            backoff: BackoffPolicy::default(),
            max_attempts: config.max_attempts,
        };

        (reconciler, StatusReader::new(status_rx))
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.workers.available_permits(),
            max_attempts = self.max_attempts,
            "Starting reconciler"
        );

        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            debug!("Event stream closed");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::GroupsChanged { group_id, desired } => {
                self.on_groups_changed(group_id, desired);
            }
            SchedulerEvent::BrokerConnected { group_id, broker } => {
                self.on_broker_connected(group_id, broker);
            }
            SchedulerEvent::BrokerDisconnected {
                group_id,
                connection_seq,
            } => {
                self.on_broker_disconnected(&group_id, connection_seq);
            }
            SchedulerEvent::SyncCompleted {
                group_id,
                epoch,
                outcome,
            } => {
                self.on_sync_completed(&group_id, epoch, outcome);
            }
        }

        self.publish_status();
    }

    fn on_groups_changed(&mut self, group_id: String, desired: BTreeSet<Address>) {
        let entry = self.state.entry_mut(&group_id);

        let unchanged_synced =
            entry.phase == GroupPhase::Synced && entry.last_applied.as_ref() == Some(&desired);
        entry.desired = desired;

        debug!(
            group_id = %group_id,
            addresses = entry.desired.len(),
            "Desired state updated"
        );

        if entry.broker.is_none() {
            // Deferred: a later connect triggers the full sync.
            return;
        }

        if entry.phase == GroupPhase::Assigning {
            entry.resync_pending = true;
            debug!(group_id = %group_id, "Sync pass in flight; coalescing");
            return;
        }

        if unchanged_synced {
            debug!(group_id = %group_id, "Desired set unchanged; nothing to apply");
            return;
        }

        self.start_sync(&group_id);
    }

    fn on_broker_connected(&mut self, group_id: String, broker: BrokerHandle) {
        let entry = self.state.entry_mut(&group_id);

        if let Some(old) = &entry.broker {
            // The old connection's disconnect has not been processed yet;
            // the admission registry guarantees the new one superseded it.
            warn!(
                group_id = %group_id,
                old_seq = old.connection_seq(),
                new_seq = broker.connection_seq(),
                "Replacing broker connection"
            );
        }

        info!(
            group_id = %group_id,
            connection_seq = broker.connection_seq(),
            desired = entry.desired.len(),
            "Broker assigned to group"
        );

        entry.broker = Some(broker);
        entry.last_applied = None;
        entry.resync_pending = false;

        self.start_sync(&group_id);
    }

    fn on_broker_disconnected(&mut self, group_id: &str, connection_seq: u64) {
        let Some(entry) = self.state.get_mut(group_id) else {
            debug!(group_id = %group_id, "Disconnect for unknown group");
            return;
        };

        match &entry.broker {
            Some(broker) if broker.connection_seq() == connection_seq => {
                info!(
                    group_id = %group_id,
                    connection_seq,
                    "Broker unassigned from group"
                );
                entry.broker = None;
                entry.phase = GroupPhase::Unassigned;
                // In-flight calls are left to fail on their own; bumping the
                // epoch discards whatever they report.
                entry.epoch += 1;
                entry.resync_pending = false;
                entry.last_applied = None;
            }
            _ => {
                debug!(
                    group_id = %group_id,
                    connection_seq,
                    "Stale disconnect ignored"
                );
            }
        }
    }

    fn on_sync_completed(&mut self, group_id: &str, epoch: u64, outcome: SyncOutcome) {
        let Some(entry) = self.state.get_mut(group_id) else {
            return;
        };

        if epoch != entry.epoch {
            debug!(
                group_id = %group_id,
                epoch,
                current_epoch = entry.epoch,
                "Discarding stale sync result"
            );
            return;
        }

        let resync = entry.resync_pending;

        match outcome {
            SyncOutcome::Synced {
                applied,
                queue_count,
            } => {
                info!(group_id = %group_id, queue_count, "Group synced");
                entry.phase = GroupPhase::Synced;
                entry.last_applied = Some(applied);
                entry.queue_count = queue_count;
                entry.failed.clear();
            }
            SyncOutcome::Degraded {
                failed,
                queue_count,
            } => {
                warn!(
                    group_id = %group_id,
                    failed = ?failed,
                    "Group degraded: retry budget exhausted"
                );
                entry.phase = GroupPhase::Degraded;
                entry.failed = failed;
                if let Some(count) = queue_count {
                    entry.queue_count = count;
                }
            }
            SyncOutcome::ConnectionLost => {
                debug!(group_id = %group_id, "Sync pass lost its connection");
                // The disconnect event unassigns the group.
                return;
            }
        }

        if resync {
            entry.resync_pending = false;
            self.start_sync(group_id);
        }
    }

    /// Spawn a sync pass for the group onto the worker pool.
    fn start_sync(&mut self, group_id: &str) {
        let entry = self.state.entry_mut(group_id);
        let Some(broker) = entry.broker.clone() else {
            return;
        };

        entry.epoch += 1;
        entry.phase = GroupPhase::Assigning;
        entry.resync_pending = false;

        let epoch = entry.epoch;
        let desired = entry.desired.clone();
        let client = broker.client();
        let events = self.events_tx.clone();
        let workers = Arc::clone(&self.workers);
        let backoff = self.backoff.clone();
        let max_attempts = self.max_attempts;
        let group = group_id.to_string();

        debug!(
            group_id = %group,
            epoch,
            desired = desired.len(),
            "Starting sync pass"
        );

        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            let outcome = sync_group(&client, &desired, &backoff, max_attempts).await;
            let _ = events
                .send(SchedulerEvent::SyncCompleted {
                    group_id: group,
                    epoch,
                    outcome,
                })
                .await;
        });
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.state.snapshot());
    }
}

enum QueueOp {
    Create(Address),
    Delete(String),
}

impl QueueOp {
    fn name(&self) -> &str {
        match self {
            QueueOp::Create(address) => &address.name,
            QueueOp::Delete(name) => name,
        }
    }

    async fn apply(&self, client: &ManagementClient) -> Result<(), ManagementError> {
        match self {
            QueueOp::Create(address) => client.create_queue(address).await,
            QueueOp::Delete(name) => client.delete_queue(name).await,
        }
    }
}

/// One reconciliation pass against one broker.
///
/// Lists the actual queue set, applies the create/delete plan, and retries
/// failed addresses in backoff-spaced rounds so one bad address never
/// blocks the rest of the pass.
async fn sync_group(
    client: &ManagementClient,
    desired: &BTreeSet<Address>,
    backoff: &BackoffPolicy,
    max_attempts: u32,
) -> SyncOutcome {
    let actual = match list_with_retry(client, backoff, max_attempts).await {
        Ok(actual) => actual,
        Err(ManagementError::ConnectionLost) => return SyncOutcome::ConnectionLost,
        Err(e) => {
            warn!(
                group_id = %client.group_id(),
                error = %e,
                "Listing queues failed"
            );
            return SyncOutcome::Degraded {
                failed: Vec::new(),
                queue_count: None,
            };
        }
    };

    let plan = QueuePlan::compute(desired, &actual);
    if plan.is_empty() {
        debug!(group_id = %client.group_id(), "Queue set already converged");
        return SyncOutcome::Synced {
            applied: desired.clone(),
            queue_count: actual.len() as i64,
        };
    }

    info!(
        group_id = %client.group_id(),
        create = plan.create.len(),
        delete = plan.delete.len(),
        "Applying queue plan"
    );

    let mut ops: Vec<QueueOp> = plan
        .create
        .into_iter()
        .map(QueueOp::Create)
        .chain(plan.delete.into_iter().map(QueueOp::Delete))
        .collect();

    let mut attempt = 0u32;
    loop {
        let mut failed = Vec::new();

        for op in ops {
            match op.apply(client).await {
                Ok(()) => {}
                Err(ManagementError::ConnectionLost) => return SyncOutcome::ConnectionLost,
                Err(e) => {
                    warn!(
                        group_id = %client.group_id(),
                        address = op.name(),
                        attempt,
                        error = %e,
                        "Management call failed"
                    );
                    failed.push(op);
                }
            }
        }

        if failed.is_empty() {
            break;
        }

        attempt += 1;
        if attempt >= max_attempts {
            let failed_names = failed.iter().map(|op| op.name().to_string()).collect();
            let queue_count = client.queue_count().await.ok();
            return SyncOutcome::Degraded {
                failed: failed_names,
                queue_count,
            };
        }

        tokio::time::sleep(backoff.delay(attempt - 1)).await;
        ops = failed;
    }

    let queue_count = match client.queue_count().await {
        Ok(count) => count,
        Err(ManagementError::ConnectionLost) => return SyncOutcome::ConnectionLost,
        Err(e) => {
            debug!(
                group_id = %client.group_id(),
                error = %e,
                "Queue count failed; deriving from desired set"
            );
            desired.len() as i64
        }
    };

    SyncOutcome::Synced {
        applied: desired.clone(),
        queue_count,
    }
}

async fn list_with_retry(
    client: &ManagementClient,
    backoff: &BackoffPolicy,
    max_attempts: u32,
) -> Result<BTreeSet<String>, ManagementError> {
    let mut attempt = 0u32;
    loop {
        match client.list_queues().await {
            Ok(actual) => return Ok(actual),
            Err(ManagementError::ConnectionLost) => return Err(ManagementError::ConnectionLost),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }
                warn!(
                    group_id = %client.group_id(),
                    attempt,
                    error = %e,
                    "Listing queues failed; retrying"
                );
                tokio::time::sleep(backoff.delay(attempt - 1)).await;
            }
        }
    }
}
