//! ip2geo database storage
//!
//! This module provides the persistent database behind the enrichment runtime:
//! - Datasource records (JSON documents keyed by name) - SQLite
//! - Geo data indexes (IP ranges with attribute objects) - SQLite, one table per index
//! - Datasource locks used by the refresh job - SQLite
//!
//! Datasource writes are published on a [`WriteEventBus`]; the
//! [`DatasourceRegistryCache`] subscribes to it to stay current.

mod datasource;
mod events;
mod geo_data;
mod lock;
mod registry_cache;

pub use datasource::{
    DatabaseInfo, Datasource, DatasourceRepository, DatasourceState, DatasourceStore, UpdateStats,
};
pub use events::{WriteEvent, WriteEventBus, WriteListener, WriteOutcome};
pub use geo_data::{GeoData, GeoDataRepository, GeoDataRow, GeoDataStore};
pub use lock::{LockBackend, LockModel, LockRepository};
pub use registry_cache::{CacheEntry, DatasourceRegistryCache};

use crate::database::core::{DatabaseConn, SchemaManager, SchemaStatus, SharedConn};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Main ip2geo database (SQLite backend)
///
/// `Ip2GeoDatabase` owns the shared connection and the write event bus, and
/// hands out repositories bound to both. It handles:
/// - Schema initialization
/// - Automatic schema drift detection and reset
/// - Wiring a registry cache to datasource write events
pub struct Ip2GeoDatabase {
    conn: SharedConn,
    events: Arc<WriteEventBus>,
}

impl Ip2GeoDatabase {
    /// Open the ip2geo database at the specified path
    ///
    /// If the database doesn't exist, it will be created and initialized.
    /// If the schema is outdated or corrupted, the metadata tables are reset.
    pub fn open(path: &str) -> Result<Self> {
        let db = DatabaseConn::open_path(path)?;
        let schema = SchemaManager::new(&db.conn);

        match schema.check_status()? {
            SchemaStatus::Current => {
                info!("ip2geo database schema is current");
            }
            SchemaStatus::NotInitialized => {
                info!("Initializing ip2geo database schema");
                schema.initialize()?;
            }
            SchemaStatus::NeedsMigration { from, to } => {
                info!("ip2geo database needs migration from v{} to v{}", from, to);
                schema.reset()?;
                schema.initialize()?;
            }
            SchemaStatus::Incompatible {
                database_version,
                required_version,
            } => {
                info!(
                    "ip2geo database schema incompatible (db: v{}, required: v{}), resetting",
                    database_version, required_version
                );
                schema.reset()?;
                schema.initialize()?;
            }
            SchemaStatus::Corrupted => {
                info!("ip2geo database schema corrupted, resetting");
                schema.reset()?;
                schema.initialize()?;
            }
        }

        Ok(Self::from_conn(db))
    }

    /// Open the ip2geo database from a data directory
    ///
    /// Creates the standard database file path: `{data_dir}/ip2geo-data.sqlite3`
    pub fn open_in_dir(data_dir: &str) -> Result<Self> {
        crate::database::ensure_data_dir(data_dir)?;
        let path = format!("{}/ip2geo-data.sqlite3", data_dir);
        Self::open(&path)
    }

    /// Create an in-memory ip2geo database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let db = DatabaseConn::open_in_memory()?;
        SchemaManager::new(&db.conn).initialize()?;
        Ok(Self::from_conn(db))
    }

    fn from_conn(db: DatabaseConn) -> Self {
        Self {
            conn: SharedConn::new(db),
            events: Arc::new(WriteEventBus::new()),
        }
    }

    pub fn datasources(&self) -> DatasourceRepository {
        DatasourceRepository::new(self.conn.clone(), self.events.clone())
    }

    pub fn geo_data(&self) -> GeoDataRepository {
        GeoDataRepository::new(self.conn.clone())
    }

    pub fn locks(&self) -> LockRepository {
        LockRepository::new(self.conn.clone())
    }

    pub fn events(&self) -> &Arc<WriteEventBus> {
        &self.events
    }

    /// Create a registry cache backed by this database and subscribed to its writes
    pub fn registry_cache(&self) -> Arc<DatasourceRegistryCache> {
        let cache = Arc::new(DatasourceRegistryCache::new(Arc::new(self.datasources())));
        self.events.subscribe(cache.clone());
        cache
    }

    /// Get metadata value from the database
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.conn.with(|conn| SchemaManager::new(conn).get_meta(key))
    }

    /// Set metadata value in the database
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .with(|conn| SchemaManager::new(conn).set_meta(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_open_in_memory() {
        let db = Ip2GeoDatabase::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_open_in_dir_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested");
        let data_dir = data_dir.to_str().unwrap();

        {
            let db = Ip2GeoDatabase::open_in_dir(data_dir).unwrap();
            db.datasources()
                .put_datasource(&Datasource::new("geo", "https://example.com"))
                .unwrap();
        }

        let db = Ip2GeoDatabase::open_in_dir(data_dir).unwrap();
        assert_eq!(db.datasources().count().unwrap(), 1);
    }

    #[test]
    fn test_meta_operations() {
        let db = Ip2GeoDatabase::open_in_memory().unwrap();
        db.set_meta("test_key", "test_value").unwrap();
        assert_eq!(
            db.get_meta("test_key").unwrap(),
            Some("test_value".to_string())
        );
        assert_eq!(db.get_meta("missing").unwrap(), None);
    }

    #[tokio::test]
    async fn test_registry_cache_follows_writes() {
        let db = Ip2GeoDatabase::open_in_memory().unwrap();
        let cache = db.registry_cache();
        let repo = db.datasources();

        let geo = Datasource::new("geo", "https://example.com")
            .with_state(DatasourceState::Available)
            .with_current_index("geo-v1")
            .with_valid_for_in_days(Some(3))
            .with_last_succeeded_at(Utc::now());
        repo.put_datasource(&geo).unwrap();
        assert_eq!(cache.len(), 1);

        repo.put_datasource(&geo.clone().with_current_index("geo-v2"))
            .unwrap();
        assert_eq!(
            cache.index_name("geo").await.unwrap().as_deref(),
            Some("geo-v2")
        );

        repo.delete_datasource("geo").unwrap();
        assert!(cache.is_empty());
        assert!(!cache.has("geo").await.unwrap());
    }

    #[tokio::test]
    async fn test_geo_data_shares_connection() {
        let db = Ip2GeoDatabase::open_in_memory().unwrap();
        db.geo_data()
            .store_rows(
                "geo-v1",
                &[GeoDataRow::new(
                    "8.8.8.0/24",
                    json!({"country": "US"}).as_object().unwrap().clone(),
                )],
            )
            .unwrap();

        let found = db.geo_data().fetch_one("geo-v1", "8.8.8.8").await.unwrap();
        assert_eq!(found.get("country"), Some(&json!("US")));
    }
}
