//! Engine configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,

    #[serde(default)]
    pub purge: PurgeConfig,

    #[serde(default)]
    pub lease: LeaseConfig,

    /// Task class name → timeout in seconds. Seeded into the store at startup.
    #[serde(default = "default_task_classes")]
    pub task_classes: BTreeMap<String, u64>,
}

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How long a writer waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

/// Stale/auto-fail sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Interval between stale sweeps (in seconds).
    #[serde(default = "default_stale_interval")]
    pub stale_interval_secs: u64,
}

/// Purge sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Interval between purge passes (in seconds).
    #[serde(default = "default_purge_interval")]
    pub interval_secs: u64,

    /// Terminal tasks finished longer ago than this are deleted.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

/// Runner lease configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease time-to-live (in seconds). Heartbeats run every third of it.
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,
}

/// Retention and lease windows are capped at 100 years.
const MAX_WINDOW_HOURS: u64 = 100 * 365 * 24;

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".taskq").join("taskq.db"))
        .unwrap_or_else(|| PathBuf::from("/tmp/taskq/taskq.db"))
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_stale_interval() -> u64 {
    30
}

fn default_purge_interval() -> u64 {
    3_600
}

fn default_retention_hours() -> u64 {
    72 // 3 days
}

fn default_lease_ttl() -> u64 {
    60
}

fn default_task_classes() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("FAST_SCRIPT".to_string(), 30),
        ("STANDARD".to_string(), 300),
        ("LONG_RUNNING".to_string(), 3_600),
    ])
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            sweeper: SweeperConfig::default(),
            purge: PurgeConfig::default(),
            lease: LeaseConfig::default(),
            task_classes: default_task_classes(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_interval_secs: default_stale_interval(),
        }
    }
}

impl SweeperConfig {
    pub fn stale_interval(&self) -> Duration {
        Duration::from_secs(self.stale_interval_secs.max(1))
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_purge_interval(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl PurgeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(MAX_WINDOW_HOURS) as i64)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.min(MAX_WINDOW_HOURS * 3_600) as i64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.ttl_secs / 3).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.sweeper.stale_interval(), Duration::from_secs(30));
        assert_eq!(config.purge.retention(), chrono::Duration::days(3));
        assert_eq!(config.lease.heartbeat_interval(), Duration::from_secs(20));
        assert_eq!(config.task_classes.get("FAST_SCRIPT"), Some(&30));
        assert!(config.store.db_path.ends_with("taskq.db"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "sweeper": { "stale_interval_secs": 60 },
            "purge": { "retention_hours": 24 }
        }))
        .unwrap();
        assert_eq!(config.sweeper.stale_interval_secs, 60);
        assert_eq!(config.purge.retention_hours, 24);
        assert_eq!(config.purge.interval_secs, 3_600);
        assert_eq!(config.task_classes.len(), 3);
    }

    #[test]
    fn test_heartbeat_interval_floor() {
        let lease = LeaseConfig { ttl_secs: 1 };
        assert_eq!(lease.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_loop_intervals_floor() {
        let sweeper = SweeperConfig { stale_interval_secs: 0 };
        assert_eq!(sweeper.stale_interval(), Duration::from_secs(1));

        let purge = PurgeConfig {
            interval_secs: 0,
            retention_hours: 72,
        };
        assert_eq!(purge.interval(), Duration::from_secs(1));
    }
}
