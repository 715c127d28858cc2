//! Datasource metadata and its repository
//!
//! A datasource is a named, versioned collection of IP-to-geo data. Its
//! metadata document records which storage index currently serves it, its
//! lifecycle state and the refresh statistics used to decide expiry.
//!
//! The repository is the source of truth for these documents. Every write
//! attempt is announced on the [`WriteEventBus`] so caches can follow along
//! without polling.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::events::{WriteEvent, WriteEventBus, WriteOutcome};
use crate::database::core::SharedConn;

// =============================================================================
// Types
// =============================================================================

/// Lifecycle state of a datasource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasourceState {
    /// Registered, first index not built yet
    Creating,
    /// Serving lookups
    Available,
    /// The first build failed
    CreateFailed,
    /// Being removed
    Deleting,
}

impl std::fmt::Display for DatasourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasourceState::Creating => write!(f, "CREATING"),
            DatasourceState::Available => write!(f, "AVAILABLE"),
            DatasourceState::CreateFailed => write!(f, "CREATE_FAILED"),
            DatasourceState::Deleting => write!(f, "DELETING"),
        }
    }
}

/// Description of the geo database loaded into the serving index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// How long the data stays valid after a refresh; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_for_in_days: Option<i64>,
    /// Attribute names present in every geo data row
    #[serde(default)]
    pub fields: Vec<String>,
}

/// Outcome timestamps of the refresh job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_succeeded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processing_time_in_millis: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Set when a refresh found no newer data and kept the current index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_skipped_at: Option<DateTime<Utc>>,
}

/// Datasource metadata document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasource {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_update_interval")]
    pub update_interval_in_days: i64,
    pub state: DatasourceState,
    /// Storage index currently serving lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<String>,
    /// Every index ever built for this datasource, oldest first
    #[serde(default)]
    pub indices: Vec<String>,
    #[serde(default)]
    pub database: DatabaseInfo,
    #[serde(default)]
    pub update_stats: UpdateStats,
}

fn default_update_interval() -> i64 {
    1
}

impl Datasource {
    /// Create a datasource in the `CREATING` state
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            update_interval_in_days: default_update_interval(),
            state: DatasourceState::Creating,
            current_index: None,
            indices: Vec::new(),
            database: DatabaseInfo::default(),
            update_stats: UpdateStats::default(),
        }
    }

    pub fn with_state(mut self, state: DatasourceState) -> Self {
        self.state = state;
        self
    }

    /// Point the datasource at a new serving index
    pub fn with_current_index(mut self, index_name: impl Into<String>) -> Self {
        let index_name = index_name.into();
        if !self.indices.contains(&index_name) {
            self.indices.push(index_name.clone());
        }
        self.current_index = Some(index_name);
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.database.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_valid_for_in_days(mut self, days: Option<i64>) -> Self {
        self.database.valid_for_in_days = days;
        self
    }

    pub fn with_last_succeeded_at(mut self, at: DateTime<Utc>) -> Self {
        self.update_stats.last_succeeded_at = Some(at);
        self
    }

    pub fn with_last_skipped_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.update_stats.last_skipped_at = at;
        self
    }

    /// Name of the storage index currently serving this datasource
    pub fn current_index_name(&self) -> Option<&str> {
        self.current_index.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.state == DatasourceState::Available
    }

    /// Most recent instant the data was confirmed current
    pub fn last_checked_at(&self) -> Option<DateTime<Utc>> {
        match (
            self.update_stats.last_succeeded_at,
            self.update_stats.last_skipped_at,
        ) {
            (Some(succeeded), Some(skipped)) => Some(succeeded.max(skipped)),
            (succeeded, skipped) => succeeded.or(skipped),
        }
    }

    /// Instant after which the data counts as expired
    ///
    /// `None` when the datasource has no validity window. A datasource with a
    /// window that was never checked expired at the beginning of time.
    pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
        let days = self.database.valid_for_in_days?;
        let expiration = match self.last_checked_at() {
            Some(checked) => Duration::try_days(days)
                .and_then(|validity| checked.checked_add_signed(validity))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            None => DateTime::<Utc>::MIN_UTC,
        };
        Some(expiration)
    }

    /// Whether the data is expired at `at`
    pub fn will_expire(&self, at: DateTime<Utc>) -> bool {
        match self.expiration_date() {
            Some(expiration) => at > expiration,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.will_expire(Utc::now())
    }

    /// Serialize to the stored JSON document
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow!("Failed to serialize datasource '{}': {}", self.name, e))
    }

    /// Parse a stored JSON document
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| anyhow!("Failed to parse datasource: {}", e))
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Read access to datasource metadata
///
/// Async methods are used on the enrichment path; the blocking variant is for
/// configuration-time validation, which runs outside the runtime.
#[async_trait]
pub trait DatasourceStore: Send + Sync {
    async fn get_datasource(&self, name: &str) -> Result<Option<Datasource>>;

    fn get_datasource_blocking(&self, name: &str) -> Result<Option<Datasource>>;

    async fn get_all_datasources(&self) -> Result<Vec<Datasource>>;
}

// =============================================================================
// Repository
// =============================================================================

/// SQLite repository for datasource metadata documents
#[derive(Clone)]
pub struct DatasourceRepository {
    conn: SharedConn,
    events: Arc<WriteEventBus>,
}

impl DatasourceRepository {
    pub fn new(conn: SharedConn, events: Arc<WriteEventBus>) -> Self {
        Self { conn, events }
    }

    /// Event bus announcing every write attempt
    pub fn events(&self) -> &Arc<WriteEventBus> {
        &self.events
    }

    /// Create or replace a datasource document
    ///
    /// Publishes an `Indexed` event with the outcome of the write.
    pub fn put_datasource(&self, datasource: &Datasource) -> Result<()> {
        let body = datasource.to_json()?;
        let name = datasource.name.clone();

        let result = self.conn.with(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO ip2geo_datasource (name, body, updated_at)
                 VALUES (?1, ?2, strftime('%s', 'now'))",
                params![name, body],
            )
            .map_err(|e| anyhow!("Failed to store datasource '{}': {}", name, e))
        });

        match result {
            Ok(_) => {
                info!(datasource = %name, state = %datasource.state, "Stored datasource");
                self.events
                    .publish(&WriteEvent::indexed(WriteOutcome::Success, name, body));
                Ok(())
            }
            Err(e) => {
                warn!(datasource = %name, error = %e, "Failed to store datasource");
                self.events
                    .publish(&WriteEvent::indexed(WriteOutcome::Failure, name, body));
                Err(e)
            }
        }
    }

    /// Delete a datasource document
    ///
    /// Returns whether a document was removed. Publishes a `Deleted` event with
    /// the outcome of the write.
    pub fn delete_datasource(&self, name: &str) -> Result<bool> {
        let result = self.conn.with(|conn| {
            conn.execute("DELETE FROM ip2geo_datasource WHERE name = ?1", [name])
                .map_err(|e| anyhow!("Failed to delete datasource '{}': {}", name, e))
        });

        match result {
            Ok(removed) => {
                info!(datasource = name, removed, "Deleted datasource");
                self.events
                    .publish(&WriteEvent::deleted(WriteOutcome::Success, name));
                Ok(removed > 0)
            }
            Err(e) => {
                warn!(datasource = name, error = %e, "Failed to delete datasource");
                self.events
                    .publish(&WriteEvent::deleted(WriteOutcome::Failure, name));
                Err(e)
            }
        }
    }

    /// Number of stored datasources
    pub fn count(&self) -> Result<u64> {
        self.conn.with(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM ip2geo_datasource", [], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
    }
}

fn query_datasource(conn: &Connection, name: &str) -> Result<Option<Datasource>> {
    let result: Result<String, _> = conn.query_row(
        "SELECT body FROM ip2geo_datasource WHERE name = ?1",
        [name],
        |row| row.get(0),
    );

    match result {
        Ok(body) => Datasource::from_json(&body).map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(anyhow!("Failed to get datasource '{}': {}", name, e)),
    }
}

fn query_all_datasources(conn: &Connection) -> Result<Vec<Datasource>> {
    let mut stmt = conn.prepare("SELECT name, body FROM ip2geo_datasource ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut results = Vec::new();
    for row in rows {
        let (name, body) = row?;
        match Datasource::from_json(&body) {
            Ok(datasource) => results.push(datasource),
            Err(e) => warn!(datasource = %name, error = %e, "Skipping unparseable datasource record"),
        }
    }
    Ok(results)
}

#[async_trait]
impl DatasourceStore for DatasourceRepository {
    async fn get_datasource(&self, name: &str) -> Result<Option<Datasource>> {
        let name = name.to_string();
        self.conn
            .with_blocking(move |conn| query_datasource(conn, &name))
            .await
    }

    fn get_datasource_blocking(&self, name: &str) -> Result<Option<Datasource>> {
        self.conn.with(|conn| query_datasource(conn, name))
    }

    async fn get_all_datasources(&self) -> Result<Vec<Datasource>> {
        self.conn.with_blocking(query_all_datasources).await
    }
}

// =============================================================================
// Tests
// =============================================================================
