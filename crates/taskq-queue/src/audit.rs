//! Audit trail records.
//!
//! The store appends one entry per mutating call inside the same transaction as the
//! mutation. The engine never reads them back; adapters may.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    /// Operation name, e.g. `create_task`, `claim`, `purge`.
    pub operation: String,
    /// Queue id, task id, class name or lease name the operation targeted.
    pub target_id: String,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
