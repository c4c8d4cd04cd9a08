// Session configuration
// This is the document passed with --cassconfig: contact points, pooling
// limits, timeouts and the changelog consistency horizon

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection and execution settings for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub contact_points: Vec<String>,
    #[serde(default)]
    pub local_datacenter: Option<String>,
    #[serde(default = "default_max_conn_local")]
    pub max_connection_per_host_local: usize,
    #[serde(default = "default_max_conn_remote")]
    pub max_connection_per_host_remote: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_simultaneous_requests_per_connection_threshold: usize,
    /// Connect timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub individual_node_connection_timeout: u64,
    #[serde(default = "default_timeout_ms")]
    pub driver_read_timeout_millis: u64,
    /// Minimum age (ms) of a changelog entry before it is handed to consumers
    #[serde(default = "default_consistency_horizon")]
    pub consistency_horizon: u64,
    /// Upper bound (ms) on waiting for a group of fan-out writes
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,
    #[serde(default)]
    pub log_cql: bool,
    /// Rows fetched per bounded range read during a full scan
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
    /// Number of token ranges a full scan is split into
    #[serde(default = "default_scan_range_count")]
    pub scan_range_count: usize,
}

fn default_max_conn_local() -> usize {
    16
}

fn default_max_conn_remote() -> usize {
    4
}

fn default_max_in_flight() -> usize {
    128
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_consistency_horizon() -> u64 {
    2000
}

fn default_batch_timeout() -> u64 {
    10_000
}

fn default_scan_page_size() -> usize {
    1000
}

fn default_scan_range_count() -> usize {
    16
}

impl SessionConfig {
    /// Configuration with every optional setting at its default
    pub fn new(contact_points: Vec<String>) -> Self {
        Self {
            contact_points,
            local_datacenter: None,
            max_connection_per_host_local: default_max_conn_local(),
            max_connection_per_host_remote: default_max_conn_remote(),
            max_simultaneous_requests_per_connection_threshold: default_max_in_flight(),
            individual_node_connection_timeout: default_timeout_ms(),
            driver_read_timeout_millis: default_timeout_ms(),
            consistency_horizon: default_consistency_horizon(),
            batch_timeout: default_batch_timeout(),
            log_cql: false,
            scan_page_size: default_scan_page_size(),
            scan_range_count: default_scan_range_count(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.contact_points.is_empty() {
            return Err(Error::Config("contactPoints must not be empty".to_string()));
        }
        if self.max_connection_per_host_local == 0 || self.max_connection_per_host_remote == 0 {
            return Err(Error::Config(
                "connection pool sizes must be > 0".to_string(),
            ));
        }
        if self.max_simultaneous_requests_per_connection_threshold == 0 {
            return Err(Error::Config(
                "maxSimultaneousRequestsPerConnectionThreshold must be > 0".to_string(),
            ));
        }
        if self.individual_node_connection_timeout == 0 || self.driver_read_timeout_millis == 0 {
            return Err(Error::Config("timeouts must be > 0".to_string()));
        }
        if self.batch_timeout == 0 {
            return Err(Error::Config("batchTimeout must be > 0".to_string()));
        }
        if self.scan_page_size == 0 || self.scan_range_count == 0 {
            return Err(Error::Config(
                "scanPageSize and scanRangeCount must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// How many asynchronous statements may be in flight before callers block
    pub fn in_flight_capacity(&self) -> usize {
        self.max_connection_per_host_local * self.max_simultaneous_requests_per_connection_threshold
    }

    pub fn consistency_horizon(&self) -> Duration {
        Duration::from_millis(self.consistency_horizon)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout)
    }
}
