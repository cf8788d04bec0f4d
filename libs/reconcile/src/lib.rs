//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge a broker's queue set to a desired address set. Key
//! concepts:
//!
//! - **Desired state**: Which addresses should exist on the group's broker.
//! - **Actual state**: The queue names a broker reports over management.
//! - **Convergence**: Applying the minimal create/delete set.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Plans are deterministic given the same inputs
//! - A plan never touches a queue outside the group it was computed for

use std::collections::BTreeSet;
use std::time::Duration;

use mqplane_address::Address;

/// The minimal set of management operations converging actual to desired.
///
/// Ordering between disjoint address names is unspecified; both lists come
/// out name-sorted because the inputs are ordered sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueuePlan {
    /// Addresses present in desired but absent on the broker.
    pub create: Vec<Address>,

    /// Queue names present on the broker but absent from desired.
    pub delete: Vec<String>,
}

impl QueuePlan {
    /// Compute `desired − actual` and `actual − desired`, keyed by name.
    pub fn compute(desired: &BTreeSet<Address>, actual: &BTreeSet<String>) -> Self {
        let desired_names: BTreeSet<&str> = desired.iter().map(|a| a.name.as_str()).collect();

        let create = desired
            .iter()
            .filter(|a| !actual.contains(&a.name))
            .cloned()
            .collect();

        let delete = actual
            .iter()
            .filter(|name| !desired_names.contains(name.as_str()))
            .cloned()
            .collect();

        Self { create, delete }
    }

    /// Returns true if the plan has no operations to apply.
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }

    /// Total number of management operations in the plan.
    pub fn len(&self) -> usize {
        self.create.len() + self.delete.len()
    }
}

/// Exponential backoff configuration for retried management calls.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        // Add jitter
        let jitter_range = delay * self.jitter;
        let jitter = rand_jitter(jitter_range);
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple jitter using a basic LCG (for no external deps).
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

/// Default attempts per address within one reconciliation pass.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn desired(names: &[&str]) -> BTreeSet<Address> {
        names.iter().map(|n| Address::queue(*n)).collect()
    }

    fn actual(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[rstest]
    #[case::fresh_broker(&["a", "b"], &[], &["a", "b"], &[])]
    #[case::already_converged(&["a", "b"], &["a", "b"], &[], &[])]
    #[case::teardown(&[], &["a", "b"], &[], &["a", "b"])]
    #[case::mixed(&["a", "c"], &["a", "b"], &["c"], &["b"])]
    fn test_plan_compute(
        #[case] want: &[&str],
        #[case] have: &[&str],
        #[case] expect_create: &[&str],
        #[case] expect_delete: &[&str],
    ) {
        let plan = QueuePlan::compute(&desired(want), &actual(have));

        let created: Vec<&str> = plan.create.iter().map(|a| a.name.as_str()).collect();
        let deleted: Vec<&str> = plan.delete.iter().map(String::as_str).collect();

        assert_eq!(created, expect_create);
        assert_eq!(deleted, expect_delete);
    }

    #[test]
    fn test_plan_empty_when_converged() {
        let plan = QueuePlan::compute(&desired(&["q1"]), &actual(&["q1"]));
        assert!(plan.is_empty());
        assert_eq!(plan.len(), 0);
    }

    #[test]
    fn test_plan_keyed_by_name_not_attributes() {
        let want: BTreeSet<Address> = [Address {
            name: "q1".to_string(),
            store_and_forward: true,
            multicast: false,
            flavor: Some("small".to_string()),
        }]
        .into();

        // The broker only knows names; a flavor change alone is not a
        // create/delete.
        let plan = QueuePlan::compute(&want, &actual(&["q1"]));
        assert!(plan.is_empty());
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();

        let d0 = policy.delay(0);
        let d1 = policy.delay(1);
        let d2 = policy.delay(2);

        // Should increase exponentially (with some jitter variance)
        assert!(d0 < Duration::from_millis(200));
        assert!(d1 < Duration::from_millis(400));
        assert!(d2 < Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        let d10 = policy.delay(10);
        assert!(d10 <= Duration::from_secs(6)); // max + some margin
    }
}
