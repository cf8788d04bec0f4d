//! Config source adapter.
//!
//! Desired state arrives as per-source sets of address entries (one JSON
//! value per address name, the shape a mounted config object takes). This
//! module merges all sources into per-group desired sets and feeds
//! whole-group replacement events into the reconciler, in the order the
//! underlying sources produced them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use mqplane_address::{decode_entry, Address, AddressEntry};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::reconciler::SchedulerEvent;

/// Aggregates address entries from multiple sources into per-group desired
/// sets.
///
/// Each source replaces its entries wholesale on every update. Entries
/// sharing a group id are merged across all currently known sources; when
/// two sources define the same address name, the most recently updated
/// source wins. Only groups whose merged set actually changed are reported,
/// so duplicate notifications produce no downstream work.
#[derive(Default)]
pub struct ConfigAggregator {
    sources: HashMap<String, SourceEntries>,
    emitted: HashMap<String, BTreeSet<Address>>,
    update_counter: u64,
}

struct SourceEntries {
    updated: u64,
    entries: BTreeMap<String, AddressEntry>,
}

impl ConfigAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one source's entries wholesale.
    ///
    /// A malformed entry is dropped with a warning; the rest of the source
    /// still applies. Returns the groups whose merged desired set changed,
    /// in group-id order.
    pub fn apply_source(
        &mut self,
        source: &str,
        raw_entries: &BTreeMap<String, serde_json::Value>,
    ) -> Vec<(String, BTreeSet<Address>)> {
        let mut entries = BTreeMap::new();
        for (name, value) in raw_entries {
            match decode_entry(name, value) {
                Ok(entry) => {
                    entries.insert(name.clone(), entry);
                }
                Err(e) => {
                    warn!(
                        source = %source,
                        entry = %name,
                        error = %e,
                        "Dropping malformed address entry"
                    );
                }
            }
        }

        self.update_counter += 1;
        self.sources.insert(
            source.to_string(),
            SourceEntries {
                updated: self.update_counter,
                entries,
            },
        );

        self.diff_merged()
    }

    /// Forget a source entirely (its backing object disappeared).
    pub fn remove_source(&mut self, source: &str) -> Vec<(String, BTreeSet<Address>)> {
        if self.sources.remove(source).is_none() {
            return Vec::new();
        }
        self.diff_merged()
    }

    fn merged(&self) -> HashMap<String, BTreeSet<Address>> {
        // Most recently updated source wins on name collisions.
        let mut sources: Vec<&SourceEntries> = self.sources.values().collect();
        sources.sort_by_key(|s| s.updated);

        let mut by_name: BTreeMap<&str, &AddressEntry> = BTreeMap::new();
        for source in sources {
            for (name, entry) in &source.entries {
                by_name.insert(name.as_str(), entry);
            }
        }

        let mut groups: HashMap<String, BTreeSet<Address>> = HashMap::new();
        for entry in by_name.values() {
            groups
                .entry(entry.group_id.clone())
                .or_default()
                .insert(entry.address.clone());
        }
        groups
    }

    fn diff_merged(&mut self) -> Vec<(String, BTreeSet<Address>)> {
        let merged = self.merged();

        // A group absent from the new snapshot is torn down by the
        // lifecycle layer, not by us; just forget it.
        self.emitted
            .retain(|group_id, _| merged.contains_key(group_id));

        let mut changed = Vec::new();
        for (group_id, addresses) in merged {
            if self.emitted.get(&group_id) != Some(&addresses) {
                self.emitted.insert(group_id.clone(), addresses.clone());
                changed.push((group_id, addresses));
            }
        }
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed
    }
}

/// Poll the configured source directories and feed group changes into the
/// scheduler's event stream. Runs until shutdown.
pub async fn run_config_watch_loop(
    dirs: Vec<PathBuf>,
    poll_interval: Duration,
    events: mpsc::Sender<SchedulerEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut aggregator = ConfigAggregator::new();
    let mut timer = tokio::time::interval(poll_interval);

    info!(
        sources = dirs.len(),
        interval_secs = poll_interval.as_secs(),
        "Starting config watch loop"
    );

    loop {
        tokio::select! {
            _ = timer.tick() => {
                for dir in &dirs {
                    let source = dir.display().to_string();

                    let changed = match read_entry_dir(dir) {
                        Ok(entries) => aggregator.apply_source(&source, &entries),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            debug!(source = %source, "Source directory absent");
                            aggregator.remove_source(&source)
                        }
                        Err(e) => {
                            warn!(source = %source, error = %e, "Failed to read source directory");
                            continue;
                        }
                    };

                    for (group_id, desired) in changed {
                        info!(
                            group_id = %group_id,
                            addresses = desired.len(),
                            "Group configuration changed"
                        );
                        if events
                            .send(SchedulerEvent::GroupsChanged { group_id, desired })
                            .await
                            .is_err()
                        {
                            // Scheduler is gone; stop feeding it.
                            return Ok(());
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Config watch loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Read one source directory: one JSON file per address entry, file stem =
/// address name. Dot-prefixed names and subdirectories are skipped (config
/// map mounts carry dot-prefixed bookkeeping entries).
fn read_entry_dir(dir: &Path) -> std::io::Result<BTreeMap<String, serde_json::Value>> {
    let mut entries = BTreeMap::new();

    for dirent in std::fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();

        let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if file_name.starts_with('.') || !path.is_file() {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read entry file");
                continue;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                entries.insert(name.to_string(), value);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dropping unparseable entry file");
            }
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(group_id: &str) -> serde_json::Value {
        serde_json::json!({
            "store_and_forward": true,
            "multicast": false,
            "group_id": group_id,
        })
    }

    fn raw(entries: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        entries
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn names(set: &BTreeSet<Address>) -> Vec<&str> {
        set.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn test_snapshot_groups_by_group_id() {
        let mut aggregator = ConfigAggregator::new();

        let changed = aggregator.apply_source(
            "maas",
            &raw(&[
                ("queue1", entry("br1")),
                ("queue2", entry("br1")),
                ("queue3", entry("br2")),
            ]),
        );

        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].0, "br1");
        assert_eq!(names(&changed[0].1), vec!["queue1", "queue2"]);
        assert_eq!(changed[1].0, "br2");
        assert_eq!(names(&changed[1].1), vec!["queue3"]);
    }

    #[test]
    fn test_duplicate_snapshot_emits_nothing() {
        let mut aggregator = ConfigAggregator::new();
        let entries = raw(&[("queue1", entry("br1"))]);

        assert_eq!(aggregator.apply_source("maas", &entries).len(), 1);
        assert!(aggregator.apply_source("maas", &entries).is_empty());
    }

    #[test]
    fn test_malformed_entry_is_dropped_others_survive() {
        let mut aggregator = ConfigAggregator::new();

        let changed = aggregator.apply_source(
            "maas",
            &raw(&[
                ("queue1", entry("br1")),
                ("broken", serde_json::json!({"multicast": "nope"})),
                ("queue2", entry("br2")),
            ]),
        );

        assert_eq!(changed.len(), 2);
        assert_eq!(names(&changed[0].1), vec!["queue1"]);
        assert_eq!(names(&changed[1].1), vec!["queue2"]);
    }

    #[test]
    fn test_sources_merge_into_one_group() {
        let mut aggregator = ConfigAggregator::new();

        aggregator.apply_source("maas-a", &raw(&[("queue1", entry("br1"))]));
        let changed = aggregator.apply_source("maas-b", &raw(&[("queue2", entry("br1"))]));

        assert_eq!(changed.len(), 1);
        assert_eq!(names(&changed[0].1), vec!["queue1", "queue2"]);
    }

    #[test]
    fn test_name_collision_latest_source_wins() {
        let mut aggregator = ConfigAggregator::new();

        aggregator.apply_source("maas-a", &raw(&[("queue1", entry("br1"))]));
        let changed = aggregator.apply_source("maas-b", &raw(&[("queue1", entry("br2"))]));

        // queue1 moved to br2; br1's merged set is now empty and vanishes
        // (teardown is the lifecycle layer's job).
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].0, "br2");
        assert_eq!(names(&changed[0].1), vec!["queue1"]);
    }

    #[test]
    fn test_removing_an_address_shrinks_the_group() {
        let mut aggregator = ConfigAggregator::new();

        aggregator.apply_source(
            "maas",
            &raw(&[("queue1", entry("br1")), ("queue2", entry("br1"))]),
        );
        let changed = aggregator.apply_source("maas", &raw(&[("queue1", entry("br1"))]));

        assert_eq!(changed.len(), 1);
        assert_eq!(names(&changed[0].1), vec!["queue1"]);
    }

    #[test]
    fn test_removed_source_revokes_its_entries() {
        let mut aggregator = ConfigAggregator::new();

        aggregator.apply_source("maas-a", &raw(&[("queue1", entry("br1"))]));
        aggregator.apply_source("maas-b", &raw(&[("queue2", entry("br1"))]));

        let changed = aggregator.remove_source("maas-b");
        assert_eq!(changed.len(), 1);
        assert_eq!(names(&changed[0].1), vec!["queue1"]);
    }

    #[test]
    fn test_read_entry_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("queue1.json"),
            entry("br1").to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join(".hidden"), "{}").unwrap();
        std::fs::write(dir.path().join("garbage.json"), "not json").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let entries = read_entry_dir(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("queue1"));
    }
}
