use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::options::UnreachablePolicy;
use crate::retry::RetryConfig;

/// Tunables shared by every management session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Deadline of a single admin RPC attempt
    pub rpc_timeout_ms: u64,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub retry_jitter: bool,
    /// How long a joining member may stay RECOVERING
    pub join_wait_timeout_ms: u64,
    /// Poll period while waiting for state changes
    pub poll_interval_ms: u64,
    /// How long to wait for GTID catch-up during channel drain and failover
    pub sync_timeout_ms: u64,
    pub unreachable_policy: UnreachablePolicy,
    /// Prefix of generated recovery accounts
    pub recovery_account_prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 5_000,
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            retry_jitter: true,
            join_wait_timeout_ms: 60_000,
            poll_interval_ms: 100,
            sync_timeout_ms: 30_000,
            unreachable_policy: UnreachablePolicy::DegradedSuccess,
            recovery_account_prefix: String::from("clusteradm_recovery_"),
        }
    }
}

impl AdminConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: AdminConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: AdminConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Settings tuned for the in-process simulated fleet.
    pub fn fast() -> Self {
        Self {
            rpc_timeout_ms: 1_000,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            join_wait_timeout_ms: 500,
            poll_interval_ms: 2,
            sync_timeout_ms: 500,
            ..Self::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            attempt_timeout: Duration::from_millis(self.rpc_timeout_ms),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter: self.retry_jitter,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn join_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.join_wait_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
