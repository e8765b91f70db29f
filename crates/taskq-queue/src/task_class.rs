//! Task classes and the registry the stale sweeper reads timeouts from.

use std::collections::HashMap;

use chrono::Duration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::QueueError;
use crate::store::TaskStore;

/// Upper bound on a class timeout (one year).
pub const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Named timeout policy shared by many tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskClass {
    pub name: String,
    pub timeout_secs: u64,
}

impl TaskClass {
    pub fn new(name: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::seconds(self.timeout_secs.min(MAX_TIMEOUT_SECS) as i64)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::Validation("task class name is empty".to_string()));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(QueueError::Validation(format!(
                "task class '{}' has invalid timeout {}s",
                self.name, self.timeout_secs
            )));
        }
        Ok(())
    }
}

/// Snapshot of the task classes in the store.
///
/// Holds nothing until [`refresh`](Self::refresh) is called; callers decide when the
/// snapshot is reloaded.
#[derive(Debug, Default)]
pub struct TaskClassRegistry {
    classes: RwLock<HashMap<String, TaskClass>>,
}

impl TaskClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reload every class from the store, replacing the previous snapshot.
    pub async fn refresh(&self, store: &dyn TaskStore) -> Result<usize, QueueError> {
        let loaded = store.list_task_classes().await?;
        let count = loaded.len();
        let map = loaded
            .into_iter()
            .map(|class| (class.name.clone(), class))
            .collect::<HashMap<_, _>>();
        *self.classes.write() = map;
        debug!("Task class registry refreshed ({} classes)", count);
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<TaskClass> {
        self.classes.read().get(name).cloned()
    }

    pub fn timeout_for(&self, name: &str) -> Option<Duration> {
        self.classes.read().get(name).map(TaskClass::timeout)
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }
}
