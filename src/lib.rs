#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! ip2geo - IP geolocation enrichment runtime
//!
//! ip2geo enriches records carrying IP addresses with geolocation attributes
//! looked up against versioned, periodically refreshed geo datasources. Each
//! datasource is served by a storage index that a background job rotates; the
//! runtime follows the rotation through write events instead of re-reading
//! datasource records on every request.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - **[`database`]**: All persistent storage
//!   - `core`: SQLite connection management and schema definitions
//!   - `ip2geo`: Datasource records, geo data indexes, locks, write events and
//!     the datasource registry cache
//!
//! - **[`lens`]**: High-level business logic
//!   - `lookup`: Deduplicated, concurrency-bounded bundle lookups
//!   - `processor`: Per-record enrichment, its factory and registry
//!   - `lock`: Datasource locks for the refresh job
//!
//! - **[`config`]**: Configuration management
//!
//! - **[`error`]**: Errors returned by processors
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ip2geo::{CreateMode, Document, Ip2GeoConfig, Ip2GeoDatabase, Ip2GeoProcessorFactory};
//! use serde_json::json;
//!
//! let config = Ip2GeoConfig::new(&None)?;
//! let db = Ip2GeoDatabase::open_in_dir(&config.data_dir)?;
//!
//! let factory = Ip2GeoProcessorFactory::from_database(&db, config.batch_settings());
//! let processor = factory.create(
//!     Some("enrich-src"),
//!     None,
//!     &json!({"field": "src_ip", "datasource": "geo", "properties": ["country", "ip"]}),
//!     CreateMode::Validate,
//! )?;
//!
//! let record = Document::from_value(json!({"src_ip": "8.8.8.8"})).unwrap();
//! let enriched = processor.execute(record).await?;
//! // {"src_ip": "8.8.8.8", "ip2geo": {"country": "US", "ip": "8.8.8.8"}}
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod lens;

// =============================================================================
// Configuration
// =============================================================================

pub use config::{BatchSettings, Ip2GeoConfig};

// =============================================================================
// Database Module - Re-export commonly used types
// =============================================================================

// Primary database type (SQLite)
pub use database::Ip2GeoDatabase;

// Core database types
pub use database::{DatabaseConn, SchemaDefinitions, SchemaManager, SchemaStatus, SCHEMA_VERSION};

// Datasources and the registry cache
pub use database::{
    CacheEntry, Datasource, DatasourceRegistryCache, DatasourceRepository, DatasourceState,
    DatasourceStore, WriteEvent, WriteEventBus, WriteListener, WriteOutcome,
};

// Geo data and locks
pub use database::{
    GeoData, GeoDataRepository, GeoDataRow, GeoDataStore, LockBackend, LockModel, LockRepository,
};

// =============================================================================
// Errors
// =============================================================================

pub use error::Ip2GeoError;

// =============================================================================
// Lens Module - Re-export lens types
// =============================================================================

pub use lens::lock::Ip2GeoLockService;
pub use lens::lookup::{BatchLookupArgs, LookupBatcher};
pub use lens::processor::{
    data_expired_marker, CreateMode, Document, Ip2GeoProcessor, Ip2GeoProcessorArgs,
    Ip2GeoProcessorFactory, ProcessorRegistry, PROCESSOR_TYPE, PROPERTY_IP,
};
