//! mqplane Queue Scheduler Library
//!
//! The queue scheduler keeps the queues present on live broker processes
//! synchronized with a continuously-changing desired configuration, using
//! only management calls over the brokers' own inbound sessions — never a
//! broker restart.
//!
//! ## Architecture
//!
//! - **ConfigSource adapter**: merges per-source address entries into
//!   per-group desired sets and emits whole-group replacement events
//! - **AMQP Listener**: admits one broker per group, feeds
//!   connect/disconnect events to the reconciler
//! - **BrokerConnection / ManagementClient**: per-broker session with
//!   serialized, correlation-id-tracked management calls
//! - **Reconciler**: the single serialized event stream that owns scheduler
//!   state and dispatches sync passes onto a bounded worker pool
//! - **Status surface**: read-only snapshots for orchestrator probes
//!
//! ## Modules
//!
//! - `broker`: broker sessions and the management calling surface
//! - `configsource`: desired-state aggregation and the source watch loop
//! - `listener`: connection admission and the accept loop
//! - `reconciler`: the convergence core
//! - `state`: the group table and status snapshots

pub mod broker;
pub mod config;
pub mod configsource;
pub mod health;
pub mod listener;
pub mod reconciler;
pub mod state;

// Re-export commonly used types
pub use broker::{BrokerConnection, BrokerHandle, ManagementClient};
pub use config::Config;
pub use configsource::{run_config_watch_loop, ConfigAggregator};
pub use listener::{ConnectionRegistry, Listener, ListenerConfig, ListenerStats};
pub use reconciler::{Reconciler, SchedulerEvent, SyncOutcome};
pub use state::{GroupPhase, GroupStatus, StatusReader, StatusSnapshot};
