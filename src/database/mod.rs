//! Database module
//!
//! This module provides all persistent storage for ip2geo, organized into:
//!
//! - **core**: Core database infrastructure (SQLite connections, schema management)
//! - **ip2geo**: Datasource records, geo data indexes, locks and the registry cache
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/               # Foundation
//! │   ├── connection      # SQLite DatabaseConn wrapper and SharedConn
//! │   └── schema          # SQLite schema definitions and management
//! │
//! └── ip2geo/             # Persistent storage
//!     ├── datasource      # Datasource records (SQLite, JSON bodies)
//!     ├── events          # Write events published by the datasource repository
//!     ├── geo_data        # Geo data indexes (SQLite, range blobs)
//!     ├── lock            # Datasource locks (SQLite)
//!     └── registry_cache  # In-memory datasource registry
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ip2geo::database::Ip2GeoDatabase;
//!
//! let db = Ip2GeoDatabase::open_in_dir("~/.ip2geo")?;
//! let cache = db.registry_cache();
//!
//! db.datasources().put_datasource(&datasource)?;
//! let index = cache.index_name("geo").await?;
//! ```

pub mod core;
pub mod ip2geo;

// SQLite connection and schema management
pub use core::{
    DatabaseConn, SchemaDefinitions, SchemaManager, SchemaStatus, SharedConn, SCHEMA_VERSION,
};

// ip2geo database (main entry point)
pub use ip2geo::Ip2GeoDatabase;

// Datasource records
pub use ip2geo::{
    DatabaseInfo, Datasource, DatasourceRepository, DatasourceState, DatasourceStore, UpdateStats,
};

// Write events and the registry cache
pub use ip2geo::{
    CacheEntry, DatasourceRegistryCache, WriteEvent, WriteEventBus, WriteListener, WriteOutcome,
};

// Geo data and locks
pub use ip2geo::{
    GeoData, GeoDataRepository, GeoDataRow, GeoDataStore, LockBackend, LockModel, LockRepository,
};

/// Ensure the data directory exists
pub fn ensure_data_dir(data_dir: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))
}
