//! Database schema management
//!
//! Schema definitions for the metadata tables of the ip2geo database. Geo data
//! index tables are created on demand by the geo data repository and are not
//! part of the versioned schema.

use anyhow::{anyhow, Result};
use rusqlite::Connection;

/// Current schema version
/// Increment this when making breaking schema changes
pub const SCHEMA_VERSION: u32 = 1;

/// Schema definitions for the metadata tables
pub struct SchemaDefinitions;

impl SchemaDefinitions {
    /// SQL for creating the meta table (tracks schema version)
    pub const META_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS ip2geo_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
    "#;

    /// SQL for creating the datasource metadata table
    ///
    /// One row per datasource, keyed by name, holding the JSON document.
    pub const DATASOURCE_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS ip2geo_datasource (
            name TEXT PRIMARY KEY,
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
    "#;

    /// SQL for creating the refresh job lock table
    pub const LOCK_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS ip2geo_lock (
            job_id TEXT PRIMARY KEY,
            lock_id TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            lock_duration_secs INTEGER NOT NULL,
            released INTEGER NOT NULL DEFAULT 0
        );
    "#;
}

/// Schema manager for the ip2geo database
///
/// Handles schema initialization and version checking.
pub struct SchemaManager<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaManager<'a> {
    /// Create a new schema manager for the given connection
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Initialize the database schema
    pub fn initialize(&self) -> Result<()> {
        self.conn
            .execute(SchemaDefinitions::META_TABLE, [])
            .map_err(|e| anyhow!("Failed to create meta table: {}", e))?;

        self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;

        self.conn
            .execute(SchemaDefinitions::DATASOURCE_TABLE, [])
            .map_err(|e| anyhow!("Failed to create ip2geo_datasource table: {}", e))?;

        self.conn
            .execute(SchemaDefinitions::LOCK_TABLE, [])
            .map_err(|e| anyhow!("Failed to create ip2geo_lock table: {}", e))?;

        Ok(())
    }

    /// Check the current schema status
    pub fn check_status(&self) -> Result<SchemaStatus> {
        let meta_exists: i32 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='ip2geo_meta'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if meta_exists == 0 {
            return Ok(SchemaStatus::NotInitialized);
        }

        let current_version = self.get_schema_version()?;

        if current_version == SCHEMA_VERSION {
            if self.verify_integrity()? {
                Ok(SchemaStatus::Current)
            } else {
                Ok(SchemaStatus::Corrupted)
            }
        } else if current_version < SCHEMA_VERSION {
            Ok(SchemaStatus::NeedsMigration {
                from: current_version,
                to: SCHEMA_VERSION,
            })
        } else {
            Ok(SchemaStatus::Incompatible {
                database_version: current_version,
                required_version: SCHEMA_VERSION,
            })
        }
    }

    fn get_schema_version(&self) -> Result<u32> {
        let version = self.get_meta("schema_version")?.unwrap_or_else(|| "0".to_string());

        version
            .parse()
            .map_err(|e| anyhow!("Invalid schema version: {}", e))
    }

    fn verify_integrity(&self) -> Result<bool> {
        for table in ["ip2geo_meta", "ip2geo_datasource", "ip2geo_lock"] {
            if !super::connection::table_exists(self.conn, table)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Set a metadata value
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO ip2geo_meta (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))",
                [key, value],
            )
            .map_err(|e| anyhow!("Failed to set meta value: {}", e))?;
        Ok(())
    }

    /// Get a metadata value
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let result: Result<String, _> = self.conn.query_row(
            "SELECT value FROM ip2geo_meta WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(anyhow!("Failed to get meta value: {}", e)),
        }
    }

    /// Reset the database by dropping the metadata tables
    pub fn reset(&self) -> Result<()> {
        self.conn.execute("DROP TABLE IF EXISTS ip2geo_lock", [])?;
        self.conn
            .execute("DROP TABLE IF EXISTS ip2geo_datasource", [])?;
        self.conn.execute("DROP TABLE IF EXISTS ip2geo_meta", [])?;
        Ok(())
    }
}

/// Status of the database schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Database is not initialized (fresh database)
    NotInitialized,

    /// Schema is current and valid
    Current,

    /// Schema needs migration from an older version
    NeedsMigration { from: u32, to: u32 },

    /// Database is from a newer version (incompatible)
    Incompatible {
        database_version: u32,
        required_version: u32,
    },

    /// Schema is corrupted (missing tables)
    Corrupted,
}
