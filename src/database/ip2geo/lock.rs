//! Datasource locks
//!
//! The refresh job takes a lock keyed by datasource name before mutating a
//! datasource. A lock is free when no row exists for the job, or the existing
//! row was released or has outlived its duration.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::database::core::SharedConn;

/// A held (or formerly held) lock on a datasource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockModel {
    /// Unique id of this acquisition
    pub lock_id: String,
    /// Datasource name the lock guards
    pub job_id: String,
    pub acquired_at: DateTime<Utc>,
    pub lock_duration_secs: u64,
    pub released: bool,
}

impl LockModel {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let duration = i64::try_from(self.lock_duration_secs)
            .ok()
            .and_then(Duration::try_seconds);
        duration
            .and_then(|d| self.acquired_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Whether another caller may take over this lock at `now`
    fn is_free(&self, now: DateTime<Utc>) -> bool {
        self.released || self.is_expired(now)
    }
}

/// Lock operations used by the lock service
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take the lock for `job_id`; `None` if someone else holds it
    async fn acquire(&self, job_id: &str, lock_duration_secs: u64) -> Result<Option<LockModel>>;

    /// Release `lock`; `false` if it was not held under this lock id
    async fn release(&self, lock: &LockModel) -> Result<bool>;

    /// Restart the duration of `lock`; `None` if it is no longer held
    async fn renew(&self, lock: &LockModel) -> Result<Option<LockModel>>;
}

/// SQLite repository for datasource locks
#[derive(Clone)]
pub struct LockRepository {
    conn: SharedConn,
}

impl LockRepository {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    /// Current lock row for `job_id`, if any
    pub fn get_lock(&self, job_id: &str) -> Result<Option<LockModel>> {
        self.conn.with(|conn| query_lock(conn, job_id))
    }
}

#[async_trait]
impl LockBackend for LockRepository {
    async fn acquire(&self, job_id: &str, lock_duration_secs: u64) -> Result<Option<LockModel>> {
        let job_id = job_id.to_string();
        self.conn
            .with_blocking(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let now = Utc::now();

                if let Some(existing) = query_lock(&tx, &job_id)? {
                    if !existing.is_free(now) {
                        debug!(job_id = %job_id, lock_id = %existing.lock_id, "Lock is held");
                        return Ok(None);
                    }
                }

                let lock = LockModel {
                    lock_id: uuid::Uuid::new_v4().to_string(),
                    job_id: job_id.clone(),
                    acquired_at: now,
                    lock_duration_secs,
                    released: false,
                };
                tx.execute(
                    "INSERT OR REPLACE INTO ip2geo_lock
                     (job_id, lock_id, acquired_at, lock_duration_secs, released)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                    params![
                        lock.job_id,
                        lock.lock_id,
                        lock.acquired_at.timestamp(),
                        i64::try_from(lock_duration_secs).unwrap_or(i64::MAX)
                    ],
                )
                .map_err(|e| anyhow!("Failed to store lock for '{}': {}", job_id, e))?;
                tx.commit()?;

                Ok(Some(lock))
            })
            .await
    }

    async fn release(&self, lock: &LockModel) -> Result<bool> {
        let lock = lock.clone();
        self.conn
            .with_blocking(move |conn| {
                let changed = conn
                    .execute(
                        "UPDATE ip2geo_lock SET released = 1
                         WHERE job_id = ?1 AND lock_id = ?2 AND released = 0",
                        params![lock.job_id, lock.lock_id],
                    )
                    .map_err(|e| anyhow!("Failed to release lock for '{}': {}", lock.job_id, e))?;
                Ok(changed > 0)
            })
            .await
    }

    async fn renew(&self, lock: &LockModel) -> Result<Option<LockModel>> {
        let lock = lock.clone();
        self.conn
            .with_blocking(move |conn| {
                let now = Utc::now();
                let changed = conn
                    .execute(
                        "UPDATE ip2geo_lock SET acquired_at = ?3
                         WHERE job_id = ?1 AND lock_id = ?2 AND released = 0",
                        params![lock.job_id, lock.lock_id, now.timestamp()],
                    )
                    .map_err(|e| anyhow!("Failed to renew lock for '{}': {}", lock.job_id, e))?;
                if changed == 0 {
                    return Ok(None);
                }
                Ok(Some(LockModel {
                    acquired_at: now,
                    ..lock
                }))
            })
            .await
    }
}

fn query_lock(conn: &Connection, job_id: &str) -> Result<Option<LockModel>> {
    let row = conn
        .query_row(
            "SELECT lock_id, acquired_at, lock_duration_secs, released
             FROM ip2geo_lock WHERE job_id = ?1",
            [job_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| anyhow!("Failed to read lock for '{}': {}", job_id, e))?;

    let Some((lock_id, acquired_at, duration, released)) = row else {
        return Ok(None);
    };

    let acquired_at = DateTime::<Utc>::from_timestamp(acquired_at, 0)
        .ok_or_else(|| anyhow!("Invalid lock timestamp {} for '{}'", acquired_at, job_id))?;

    Ok(Some(LockModel {
        lock_id,
        job_id: job_id.to_string(),
        acquired_at,
        lock_duration_secs: u64::try_from(duration).unwrap_or(0),
        released,
    }))
}
