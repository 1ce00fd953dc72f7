//! Orchestrator configuration.
//!
//! One explicit [`OrchestratorConfig`] value is threaded through every
//! constructor. There are no process-wide mode flags or singletons, so
//! multiple configurations can coexist (tests run fleets side by side).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limiter::ModelLimits;

/// Top-level configuration for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bound of each agent's inbound message channel.
    pub queue_capacity: usize,
    /// Bound of the shared state-change stream.
    pub state_change_capacity: usize,
    /// Bound of the single-writer checkpoint queue.
    pub checkpoint_queue_capacity: usize,
    /// Per-state step timeout, seconds. An overrunning handler counts as
    /// a transient failure.
    pub step_timeout_secs: u64,
    /// Base retry backoff, milliseconds; doubled per attempt.
    pub retry_backoff_ms: u64,
    /// Grace period for shutdown draining and final checkpoints, seconds.
    pub shutdown_grace_secs: u64,
    /// Times an agent is restarted after reaching DONE/ERROR before the
    /// supervisor gives up on it.
    pub restart_limit: u32,
    /// SQLite database path for sessions and checkpoints.
    pub db_path: String,
    /// Directory for the append-only message event log; `None` disables
    /// the audit side channel.
    pub event_log_dir: Option<String>,
    /// Rate/budget limits per model identifier.
    pub models: BTreeMap<String, ModelLimits>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            state_change_capacity: 256,
            checkpoint_queue_capacity: 256,
            step_timeout_secs: 300,
            retry_backoff_ms: 500,
            shutdown_grace_secs: 10,
            restart_limit: 3,
            db_path: "foreman.db".to_string(),
            event_log_dir: None,
            models: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a YAML file; missing keys fall back to defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert!(config.queue_capacity > 0);
        assert!(config.checkpoint_queue_capacity > 0);
        assert_eq!(config.step_timeout(), Duration::from_secs(300));
        assert!(config.models.is_empty());
    }

    #[test]
    fn test_yaml_round_trip_with_partial_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreman.yaml");
        std::fs::write(
            &path,
            r#"
queue_capacity: 8
db_path: "/tmp/orchestrator-test.db"
models:
  claude-sonnet:
    capacity: 200000.0
    refill_per_minute: 100000.0
    concurrency_slots: 2
    daily_budget_usd: 25.0
    usd_per_1k_tokens: 0.003
"#,
        )
        .unwrap();

        let config = OrchestratorConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.queue_capacity, 8);
        // Unset keys keep their defaults.
        assert_eq!(config.state_change_capacity, 256);
        let limits = config.models.get("claude-sonnet").unwrap();
        assert_eq!(limits.concurrency_slots, 2);
        assert_eq!(limits.daily_budget_usd, 25.0);
    }
}
