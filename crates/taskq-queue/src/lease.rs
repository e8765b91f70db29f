//! Heartbeat leases for single-runner enforcement.
//!
//! A lease is a row in `runner_leases` naming its holder and an expiry. The holder
//! renews it on a heartbeat; anyone may take it over once it has expired, so a
//! crashed runner never blocks its successor for longer than one TTL.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::QueueError;
use crate::schema::{decode_ts, encode_ts};
use crate::sqlite::SqliteTaskStore;

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// Snapshot of a lease row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Named lease held by this process.
pub struct RunnerLease {
    conn: Connection,
    name: String,
    holder: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl RunnerLease {
    pub fn new(
        store: &SqliteTaskStore,
        name: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conn: store.connection().clone(),
            name: name.into(),
            holder: holder.into(),
            ttl,
            clock,
        }
    }

    /// Lease name for the runner of one queue.
    pub fn queue_lease_name(queue_name: &str) -> String {
        format!("queue:{}", queue_name)
    }

    /// Holder id unique to this process instance.
    pub fn default_holder() -> String {
        format!("pid-{}-{}", std::process::id(), Uuid::new_v4().simple())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Take the lease if it is free, expired or already ours.
    pub async fn try_acquire(&self) -> Result<LeaseInfo, QueueError> {
        let name = self.name.clone();
        let holder = self.holder.clone();
        let now = self.clock.now();
        let expires_at = now + self.ttl;

        let lease = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let existing = tx
                    .query_row(
                        "SELECT holder, expires_at FROM runner_leases WHERE name = ?1",
                        [&name],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;

                if let Some((current, raw_expiry)) = existing {
                    let current_expiry = match decode_ts(&raw_expiry) {
                        Ok(at) => at,
                        Err(e) => {
                            return Ok(Err(QueueError::Database(format!(
                                "Corrupt lease expiry for '{}': {}",
                                name, e
                            ))))
                        }
                    };
                    if current != holder && current_expiry > now {
                        return Ok(Err(QueueError::LeaseHeld {
                            name,
                            holder: current,
                            expires_at: current_expiry,
                        }));
                    }
                    if current != holder {
                        warn!("Taking over expired lease '{}' from {}", name, current);
                    }
                }

                tx.execute(
                    "INSERT INTO runner_leases (name, holder, acquired_at, heartbeat_at, expires_at)
                     VALUES (?1, ?2, ?3, ?3, ?4)
                     ON CONFLICT(name) DO UPDATE SET
                        holder = excluded.holder,
                        acquired_at = excluded.acquired_at,
                        heartbeat_at = excluded.heartbeat_at,
                        expires_at = excluded.expires_at",
                    params![name, holder, encode_ts(&now), encode_ts(&expires_at)],
                )?;
                tx.commit()?;

                Ok(Ok(LeaseInfo {
                    name,
                    holder,
                    acquired_at: now,
                    heartbeat_at: now,
                    expires_at,
                }))
            })
            .await??;

        info!("Lease '{}' acquired by {} (expires {})", lease.name, lease.holder, lease.expires_at);
        Ok(lease)
    }

    /// Push the expiry out by one TTL. Fails with `LeaseLost` if someone else holds it
    /// or it was released.
    pub async fn renew(&self) -> Result<DateTime<Utc>, QueueError> {
        let name = self.name.clone();
        let holder = self.holder.clone();
        let now = self.clock.now();
        let expires_at = now + self.ttl;

        let renewed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE runner_leases SET heartbeat_at = ?1, expires_at = ?2
                     WHERE name = ?3 AND holder = ?4",
                    params![encode_ts(&now), encode_ts(&expires_at), name, holder],
                )?;
                Ok(changed > 0)
            })
            .await?;

        if !renewed {
            return Err(QueueError::LeaseLost {
                name: self.name.clone(),
                holder: self.holder.clone(),
            });
        }
        debug!("Lease '{}' renewed until {}", self.name, expires_at);
        Ok(expires_at)
    }

    /// Drop the lease if we hold it. Returns false if it was not ours.
    pub async fn release(&self) -> Result<bool, QueueError> {
        let name = self.name.clone();
        let holder = self.holder.clone();

        let released = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM runner_leases WHERE name = ?1 AND holder = ?2",
                    params![name, holder],
                )?;
                Ok(changed > 0)
            })
            .await?;

        if released {
            info!("Lease '{}' released by {}", self.name, self.holder);
        }
        Ok(released)
    }

    /// Current row for this lease name, whoever holds it.
    pub async fn current(&self) -> Result<Option<LeaseInfo>, QueueError> {
        let name = self.name.clone();
        let lease = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT name, holder, acquired_at, heartbeat_at, expires_at
                         FROM runner_leases WHERE name = ?1",
                        [&name],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((name, holder, acquired_at, heartbeat_at, expires_at)) = lease else {
            return Ok(None);
        };
        let parse = |raw: &str| {
            decode_ts(raw).map_err(|e| QueueError::Database(format!("Corrupt lease timestamp: {}", e)))
        };
        Ok(Some(LeaseInfo {
            name,
            holder,
            acquired_at: parse(&acquired_at)?,
            heartbeat_at: parse(&heartbeat_at)?,
            expires_at: parse(&expires_at)?,
        }))
    }

    /// Renew on `interval` until shutdown, then release.
    ///
    /// Returns `LeaseLost` as soon as a renewal finds the lease taken over; the
    /// caller must stop the work the lease guards.
    pub async fn heartbeat_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), QueueError> {
        info!("Starting lease heartbeat for '{}' (interval: {:?})", self.name, interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.renew().await {
                        Ok(_) => {}
                        Err(e @ QueueError::LeaseLost { .. }) => {
                            error!("{}", e);
                            return Err(e);
                        }
                        Err(e) => warn!("Lease '{}' renewal failed: {}", self.name, e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Lease heartbeat for '{}' shutting down", self.name);
                    break;
                }
            }
        }

        self.release().await?;
        Ok(())
    }
}
