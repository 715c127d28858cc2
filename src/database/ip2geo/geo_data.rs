//! Geo data storage indexes
//!
//! A storage index holds one build of a datasource: IP ranges, each carrying a
//! JSON object of geo attributes. Datasources rotate between indexes as the
//! refresh job builds new ones, so every lookup names the index explicitly.
//!
//! # IP Address Storage
//!
//! Ranges are stored as two 16-byte blob columns (first and last address).
//! IPv4 addresses are converted to IPv6-mapped format (::ffff:x.x.x.x) and
//! their prefix length shifted by 96 so both families order uniformly. A
//! lookup returns the most specific range covering the address.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::info;

use crate::database::core::{table_exists, SharedConn};

/// Geo attributes of one IP; empty when the IP has no match
pub type GeoData = Map<String, Value>;

/// Table name prefix for geo data indexes
const INDEX_TABLE_PREFIX: &str = "ip2geo_data_";

/// One IP range and its geo attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoDataRow {
    /// CIDR network, e.g. "8.8.8.0/24"
    pub cidr: String,
    pub data: GeoData,
}

impl GeoDataRow {
    pub fn new(cidr: impl Into<String>, data: GeoData) -> Self {
        Self {
            cidr: cidr.into(),
            data,
        }
    }
}

// =============================================================================
// Store trait
// =============================================================================

/// Lookup access to geo data indexes
#[async_trait]
pub trait GeoDataStore: Send + Sync {
    /// Attributes for `ip` in `index_name`; empty if nothing covers it
    async fn fetch_one(&self, index_name: &str, ip: &str) -> Result<GeoData>;

    /// Attributes for a bundle of IPs resolved in one round trip
    ///
    /// IPs without a match may be absent from the returned map.
    async fn fetch_bundle(
        &self,
        index_name: &str,
        ips: Vec<String>,
    ) -> Result<HashMap<String, GeoData>>;
}

// =============================================================================
// Repository
// =============================================================================

/// SQLite repository for geo data indexes
#[derive(Clone)]
pub struct GeoDataRepository {
    conn: SharedConn,
}

impl GeoDataRepository {
    pub fn new(conn: SharedConn) -> Self {
        Self { conn }
    }

    /// Create an empty index (no-op if it exists)
    pub fn create_index(&self, index_name: &str) -> Result<()> {
        let table = table_name(index_name)?;
        self.conn.with(|conn| create_index_table(conn, &table))
    }

    /// Append rows to an index, creating it if needed
    ///
    /// Returns the number of rows stored. Rows with an unparseable CIDR are
    /// rejected as a whole batch.
    pub fn store_rows(&self, index_name: &str, rows: &[GeoDataRow]) -> Result<usize> {
        let table = table_name(index_name)?;

        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let (start, end, prefix_len) = parse_cidr_to_range(&row.cidr)?;
            let data = serde_json::to_string(&row.data)
                .map_err(|e| anyhow!("Failed to serialize geo data for '{}': {}", row.cidr, e))?;
            prepared.push((start, end, prefix_len, row.cidr.as_str(), data));
        }

        let stored = self.conn.with(|conn| {
            create_index_table(conn, &table)?;

            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO \"{}\" (range_start, range_end, prefix_length, cidr, data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    table
                ))?;
                for (start, end, prefix_len, cidr, data) in &prepared {
                    stmt.execute(params![
                        start.as_slice(),
                        end.as_slice(),
                        prefix_len,
                        cidr,
                        data
                    ])?;
                }
            }
            tx.commit()?;
            Ok(prepared.len())
        })?;

        info!(index = index_name, rows = stored, "Stored geo data rows");
        Ok(stored)
    }

    /// Drop an index; returns whether it existed
    pub fn delete_index(&self, index_name: &str) -> Result<bool> {
        let table = table_name(index_name)?;
        self.conn.with(|conn| {
            let existed = table_exists(conn, &table)?;
            conn.execute(&format!("DROP TABLE IF EXISTS \"{}\"", table), [])
                .map_err(|e| anyhow!("Failed to drop index '{}': {}", index_name, e))?;
            Ok(existed)
        })
    }

    /// Names of all existing indexes
    pub fn list_indices(&self) -> Result<Vec<String>> {
        self.conn.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE ?1 ORDER BY name",
            )?;
            let rows = stmt.query_map([format!("{}%", INDEX_TABLE_PREFIX)], |row| {
                row.get::<_, String>(0)
            })?;

            let mut results = Vec::new();
            for row in rows {
                let table = row?;
                if let Some(index) = table.strip_prefix(INDEX_TABLE_PREFIX) {
                    results.push(index.to_string());
                }
            }
            Ok(results)
        })
    }

    /// Number of rows in an index (0 if it does not exist)
    pub fn row_count(&self, index_name: &str) -> Result<u64> {
        let table = table_name(index_name)?;
        self.conn.with(|conn| {
            if !table_exists(conn, &table)? {
                return Ok(0);
            }
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| {
                    row.get(0)
                })?;
            Ok(count as u64)
        })
    }

    /// Synchronous single-IP lookup
    pub fn lookup(&self, index_name: &str, ip: &str) -> Result<GeoData> {
        let table = table_name(index_name)?;
        let addr = parse_ip(ip)?;
        self.conn.with(|conn| lookup_in_table(conn, &table, addr))
    }
}

#[async_trait]
impl GeoDataStore for GeoDataRepository {
    async fn fetch_one(&self, index_name: &str, ip: &str) -> Result<GeoData> {
        let table = table_name(index_name)?;
        let addr = parse_ip(ip)?;
        self.conn
            .with_blocking(move |conn| lookup_in_table(conn, &table, addr))
            .await
    }

    async fn fetch_bundle(
        &self,
        index_name: &str,
        ips: Vec<String>,
    ) -> Result<HashMap<String, GeoData>> {
        let table = table_name(index_name)?;
        let mut addrs = Vec::with_capacity(ips.len());
        for ip in ips {
            let addr = parse_ip(&ip)?;
            addrs.push((ip, addr));
        }

        self.conn
            .with_blocking(move |conn| {
                let mut results = HashMap::with_capacity(addrs.len());
                for (ip, addr) in addrs {
                    let data = lookup_in_table(conn, &table, addr)?;
                    if !data.is_empty() {
                        results.insert(ip, data);
                    }
                }
                Ok(results)
            })
            .await
    }
}

// =============================================================================
// Helper functions
// =============================================================================

/// Map an index name to its table, rejecting names unsafe as identifiers
fn table_name(index_name: &str) -> Result<String> {
    let valid = !index_name.is_empty()
        && index_name.len() <= 128
        && index_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(anyhow!("Invalid index name '{}'", index_name));
    }
    Ok(format!("{}{}", INDEX_TABLE_PREFIX, index_name))
}

fn create_index_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                range_start BLOB NOT NULL,
                range_end BLOB NOT NULL,
                prefix_length INTEGER NOT NULL,
                cidr TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            table
        ),
        [],
    )
    .map_err(|e| anyhow!("Failed to create table '{}': {}", table, e))?;

    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{}_range\" ON \"{}\"(range_start, range_end)",
            table, table
        ),
        [],
    )
    .map_err(|e| anyhow!("Failed to create range index on '{}': {}", table, e))?;

    Ok(())
}

fn lookup_in_table(conn: &Connection, table: &str, addr: IpAddr) -> Result<GeoData> {
    if !table_exists(conn, table)? {
        return Err(anyhow!("Geo data index '{}' does not exist", index_of(table)));
    }

    let key = ip_to_bytes(addr);
    let body: Option<String> = conn
        .query_row(
            &format!(
                "SELECT data FROM \"{}\"
                 WHERE range_start <= ?1 AND range_end >= ?1
                 ORDER BY prefix_length DESC LIMIT 1",
                table
            ),
            [key.as_slice()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| anyhow!("Failed to look up {} in '{}': {}", addr, table, e))?;

    match body {
        Some(body) => serde_json::from_str(&body)
            .map_err(|e| anyhow!("Corrupted geo data in '{}': {}", table, e)),
        None => Ok(GeoData::new()),
    }
}

fn index_of(table: &str) -> &str {
    table.strip_prefix(INDEX_TABLE_PREFIX).unwrap_or(table)
}

fn parse_ip(ip: &str) -> Result<IpAddr> {
    IpAddr::from_str(ip.trim()).map_err(|_| anyhow!("'{}' is not an IP string literal", ip))
}

/// Convert an IP address to 16-byte representation
fn ip_to_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Parse a CIDR string and return (start_bytes, end_bytes, normalized_prefix_length)
fn parse_cidr_to_range(cidr: &str) -> Result<([u8; 16], [u8; 16], u8)> {
    let net = IpNet::from_str(cidr.trim()).map_err(|e| anyhow!("Invalid CIDR '{}': {}", cidr, e))?;

    let start = ip_to_bytes(net.network());
    let end = ip_to_bytes(net.broadcast());
    let prefix_len = match net {
        IpNet::V4(v4) => v4.prefix_len() + 96,
        IpNet::V6(v6) => v6.prefix_len(),
    };

    Ok((start, end, prefix_len))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::DatabaseConn;
    use serde_json::json;

    fn create_test_repo() -> GeoDataRepository {
        GeoDataRepository::new(SharedConn::new(DatabaseConn::open_in_memory().unwrap()))
    }

    fn data(value: Value) -> GeoData {
        value.as_object().unwrap().clone()
    }

    fn seed(repo: &GeoDataRepository, index: &str) {
        repo.store_rows(
            index,
            &[
                GeoDataRow::new("8.0.0.0/8", data(json!({"country": "US"}))),
                GeoDataRow::new(
                    "8.8.8.0/24",
                    data(json!({"country": "US", "city": "Mountain View"})),
                ),
                GeoDataRow::new("1.1.1.0/24", data(json!({"country": "AU"}))),
                GeoDataRow::new("2001:db8::/32", data(json!({"country": "ZZ"}))),
            ],
        )
        .unwrap();
    }

    #[test]
    fn test_table_name_validation() {
        assert_eq!(table_name("geo-v3").unwrap(), "ip2geo_data_geo-v3");
        assert!(table_name("").is_err());
        assert!(table_name("geo\"; DROP TABLE x; --").is_err());
        assert!(table_name("geo v3").is_err());
    }

    #[test]
    fn test_store_and_lookup_longest_match() {
        let repo = create_test_repo();
        seed(&repo, "geo-v1");

        assert_eq!(repo.row_count("geo-v1").unwrap(), 4);

        let result = repo.lookup("geo-v1", "8.8.8.8").unwrap();
        assert_eq!(result.get("city"), Some(&json!("Mountain View")));

        let result = repo.lookup("geo-v1", "8.1.2.3").unwrap();
        assert_eq!(result, data(json!({"country": "US"})));

        let result = repo.lookup("geo-v1", "2001:db8::1").unwrap();
        assert_eq!(result.get("country"), Some(&json!("ZZ")));

        assert!(repo.lookup("geo-v1", "9.9.9.9").unwrap().is_empty());
    }

    #[test]
    fn test_lookup_rejects_non_ip() {
        let repo = create_test_repo();
        seed(&repo, "geo-v1");

        let err = repo.lookup("geo-v1", "not-an-ip").unwrap_err();
        assert!(err.to_string().contains("not an IP string literal"));
    }

    #[test]
    fn test_store_rejects_bad_cidr() {
        let repo = create_test_repo();
        let rows = vec![
            GeoDataRow::new("1.1.1.0/24", GeoData::new()),
            GeoDataRow::new("1.1.1.0/99", GeoData::new()),
        ];
        assert!(repo.store_rows("geo-v1", &rows).is_err());
        assert_eq!(repo.row_count("geo-v1").unwrap(), 0);
    }

    #[test]
    fn test_missing_index_fails_lookup() {
        let repo = create_test_repo();
        let err = repo.lookup("nope", "8.8.8.8").unwrap_err();
        assert!(err.to_string().contains("'nope' does not exist"));
        assert_eq!(repo.row_count("nope").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fetch_from_dropped_index_fails() {
        let repo = create_test_repo();
        seed(&repo, "geo-v1");
        assert!(repo.delete_index("geo-v1").unwrap());

        assert!(repo.fetch_one("geo-v1", "8.8.8.8").await.is_err());
        assert!(repo
            .fetch_bundle("geo-v1", vec!["8.8.8.8".to_string()])
            .await
            .is_err());
    }

    #[test]
    fn test_list_and_delete_indices() {
        let repo = create_test_repo();
        seed(&repo, "geo-v1");
        repo.create_index("geo-v2").unwrap();

        assert_eq!(
            repo.list_indices().unwrap(),
            vec!["geo-v1".to_string(), "geo-v2".to_string()]
        );

        assert!(repo.delete_index("geo-v1").unwrap());
        assert!(!repo.delete_index("geo-v1").unwrap());
        assert_eq!(repo.list_indices().unwrap(), vec!["geo-v2".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_one_and_bundle() {
        let repo = create_test_repo();
        seed(&repo, "geo-v1");

        let one = repo.fetch_one("geo-v1", "1.1.1.1").await.unwrap();
        assert_eq!(one.get("country"), Some(&json!("AU")));

        let bundle = repo
            .fetch_bundle(
                "geo-v1",
                vec!["1.1.1.1".to_string(), "9.9.9.9".to_string(), "8.8.8.8".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(bundle.len(), 2);
        assert!(bundle.contains_key("1.1.1.1"));
        assert!(bundle.contains_key("8.8.8.8"));
        assert!(!bundle.contains_key("9.9.9.9"));
    }

    #[tokio::test]
    async fn test_fetch_bundle_fails_on_bad_ip() {
        let repo = create_test_repo();
        seed(&repo, "geo-v1");

        let result = repo
            .fetch_bundle("geo-v1", vec!["1.1.1.1".to_string(), "garbage".to_string()])
            .await;
        assert!(result.is_err());
    }
}
