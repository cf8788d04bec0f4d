//! Configuration for the queue scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Queue scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the AMQP listener binds to.
    pub listen_addr: SocketAddr,

    /// Address the status/readiness HTTP surface binds to.
    pub status_addr: SocketAddr,

    /// Directories of address entry files, one source per directory.
    pub config_dirs: Vec<PathBuf>,

    /// Interval between config source polls.
    pub poll_interval: Duration,

    /// Per-call management request timeout.
    pub request_timeout: Duration,

    /// Timeout for the Open handshake on a new connection.
    pub handshake_timeout: Duration,

    /// Size of the sync worker pool, independent of group count.
    pub worker_pool_size: usize,

    /// Maximum concurrent broker connections.
    pub max_connections: usize,

    /// Attempts per address within one reconciliation pass.
    pub max_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("MQP_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:5672".to_string())
            .parse()
            .context("Invalid MQP_LISTEN_ADDR")?;

        let status_addr = std::env::var("MQP_STATUS_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("Invalid MQP_STATUS_ADDR")?;

        let config_dirs = std::env::var("MQP_CONFIG_DIRS")
            .unwrap_or_else(|_| "/etc/mqplane/addresses".to_string())
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| PathBuf::from(s.trim()))
            .collect();

        let poll_interval = std::env::var("MQP_CONFIG_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        let request_timeout = std::env::var("MQP_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        let handshake_timeout = std::env::var("MQP_HANDSHAKE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(10));

        let worker_pool_size = std::env::var("MQP_WORKER_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let max_connections = std::env::var("MQP_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1024);

        let max_attempts = std::env::var("MQP_SYNC_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(mqplane_reconcile::DEFAULT_MAX_ATTEMPTS);

        Ok(Self {
            listen_addr,
            status_addr,
            config_dirs,
            poll_interval,
            request_timeout,
            handshake_timeout,
            worker_pool_size,
            max_connections,
            max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // Environment is shared between tests; only assert on keys no test sets.
        let config = Config::from_env().unwrap();
        assert_eq!(config.listen_addr.port(), 5672);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.config_dirs, vec![PathBuf::from("/etc/mqplane/addresses")]);
    }
}
