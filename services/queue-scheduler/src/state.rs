//! Scheduler state: the per-group bookkeeping table and its read-only
//! status snapshots.
//!
//! The table is owned and mutated exclusively by the reconciler's event
//! loop (single-writer discipline). Everyone else — the status surface,
//! readiness probes, tests — reads immutable snapshots published over a
//! watch channel after each state change.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use mqplane_address::Address;
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::BrokerHandle;

/// Per-group convergence phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    /// No live broker connection; desired state is recorded and deferred.
    #[default]
    Unassigned,

    /// Broker connected, sync pass in progress.
    Assigning,

    /// Broker's queue set matches the last applied desired set.
    Synced,

    /// Retry budget exhausted for at least one address.
    Degraded,
}

/// Mutable bookkeeping for one group. Only the reconciler touches this.
#[derive(Debug, Default)]
pub struct GroupEntry {
    /// Latest desired address set.
    pub desired: BTreeSet<Address>,

    /// Live broker connection, if any.
    pub broker: Option<BrokerHandle>,

    /// Convergence phase.
    pub phase: GroupPhase,

    /// Desired set most recently applied in full.
    pub last_applied: Option<BTreeSet<Address>>,

    /// Last observed actual queue count on the broker.
    pub queue_count: i64,

    /// Addresses that exhausted their retry budget in the last pass.
    pub failed: Vec<String>,

    /// Epoch of the in-flight (or most recent) sync pass. Completions
    /// carrying an older epoch are discarded.
    pub epoch: u64,

    /// A newer desired set arrived while a pass was in flight; run another
    /// pass when it completes.
    pub resync_pending: bool,
}

/// The process-wide group table.
#[derive(Debug, Default)]
pub struct SchedulerState {
    groups: HashMap<String, GroupEntry>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for a group.
    pub fn entry_mut(&mut self, group_id: &str) -> &mut GroupEntry {
        self.groups.entry(group_id.to_string()).or_default()
    }

    pub fn get(&self, group_id: &str) -> Option<&GroupEntry> {
        self.groups.get(group_id)
    }

    pub fn get_mut(&mut self, group_id: &str) -> Option<&mut GroupEntry> {
        self.groups.get_mut(group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Build an immutable status snapshot of every group.
    pub fn snapshot(&self) -> StatusSnapshot {
        let groups = self
            .groups
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    GroupStatus {
                        phase: entry.phase,
                        broker_connected: entry.broker.is_some(),
                        connected_at: entry.broker.as_ref().map(|b| b.connected_at()),
                        desired_addresses: entry.desired.len(),
                        queue_count: entry.queue_count,
                        failed_addresses: entry.failed.clone(),
                    },
                )
            })
            .collect();

        StatusSnapshot { groups }
    }
}

/// Read-only status of one group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub phase: GroupPhase,
    pub broker_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub desired_addresses: usize,
    pub queue_count: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_addresses: Vec<String>,
}

/// Immutable snapshot of every group's status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub groups: BTreeMap<String, GroupStatus>,
}

impl StatusSnapshot {
    /// Last observed actual queue count for a group, if known.
    pub fn num_queues(&self, group_id: &str) -> Option<i64> {
        self.groups.get(group_id).map(|g| g.queue_count)
    }
}

/// Cheap-clone reader over the published status snapshots.
///
/// Readiness probes call this; it never blocks on the reconciler.
#[derive(Debug, Clone)]
pub struct StatusReader {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusReader {
    pub fn new(rx: watch::Receiver<StatusSnapshot>) -> Self {
        Self { rx }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    /// Last observed actual queue count for a group.
    pub fn num_queues(&self, group_id: &str) -> Option<i64> {
        self.rx.borrow().num_queues(group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_defaults_to_unassigned() {
        let mut state = SchedulerState::new();
        let entry = state.entry_mut("br1");
        assert_eq!(entry.phase, GroupPhase::Unassigned);
        assert!(entry.desired.is_empty());
        assert!(entry.broker.is_none());
    }

    #[test]
    fn test_snapshot_num_queues() {
        let mut state = SchedulerState::new();
        let entry = state.entry_mut("br1");
        entry.phase = GroupPhase::Synced;
        entry.queue_count = 2;

        let snapshot = state.snapshot();
        assert_eq!(snapshot.num_queues("br1"), Some(2));
        assert_eq!(snapshot.num_queues("unknown"), None);
    }

    #[test]
    fn test_snapshot_serializes_phase_snake_case() {
        let mut state = SchedulerState::new();
        state.entry_mut("br1").phase = GroupPhase::Assigning;

        let json = serde_json::to_string(&state.snapshot()).unwrap();
        assert!(json.contains("\"phase\":\"assigning\""));
    }
}
