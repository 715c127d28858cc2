use anyhow::{anyhow, Result};
use config::Config;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default number of IPs fetched together in one storage round trip
pub const DEFAULT_MAX_BUNDLE_SIZE: usize = 100;

/// Default number of bundle fetches allowed in flight for one request
pub const DEFAULT_MAX_CONCURRENT_SEARCHES: usize = 4;

/// Default timeout for synchronous storage/lock calls, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default lock duration used by the refresh job, in seconds
pub const DEFAULT_LOCK_DURATION_SECS: u64 = 3600;

pub struct Ip2GeoConfig {
    /// Path to the directory holding ip2geo's data
    pub data_dir: String,

    /// Maximum number of IPs per bundle in a multi-IP lookup
    pub max_bundle_size: usize,

    /// Maximum number of bundle fetches in flight per multi-IP lookup
    pub max_concurrent_searches: usize,

    /// Timeout for synchronous calls (lock renewal) in seconds
    pub timeout_secs: u64,

    /// Duration of the datasource lock taken by the refresh job in seconds
    pub lock_duration_secs: u64,
}

const EMPTY_CONFIG: &str = r#"### ip2geo configuration file

### directory for datasource metadata and geo data
# data_dir = "~/.ip2geo"

### multi-IP lookup settings
# max_bundle_size = 100
# max_concurrent_searches = 4

### synchronous call timeout and refresh lock duration (in seconds)
# timeout_secs = 30
# lock_duration_secs = 3600
"#;

impl Default for Ip2GeoConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self {
            data_dir: format!("{}/.ip2geo", home_dir),
            max_bundle_size: DEFAULT_MAX_BUNDLE_SIZE,
            max_concurrent_searches: DEFAULT_MAX_CONCURRENT_SEARCHES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            lock_duration_secs: DEFAULT_LOCK_DURATION_SECS,
        }
    }
}

impl Ip2GeoConfig {
    /// Load configuration from a TOML file overlaid with `IP2GEO_*` environment variables
    ///
    /// When `path` is `None`, `$HOME/.ip2geo/ip2geo.toml` is used. A commented
    /// template is written if the file does not exist yet.
    pub fn new(path: &Option<String>) -> Result<Ip2GeoConfig> {
        let mut builder = Config::builder();

        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .to_str()
            .ok_or_else(|| anyhow!("Could not convert home directory path to string"))?
            .to_owned();

        let ip2geo_dir = format!("{}/.ip2geo", home_dir.as_str());

        match path {
            Some(p) => {
                let path = Path::new(p.as_str());
                if path.exists() {
                    let path_str = path
                        .to_str()
                        .ok_or_else(|| anyhow!("Could not convert path to string"))?;
                    builder = builder.add_source(config::File::with_name(path_str));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                std::fs::create_dir_all(ip2geo_dir.as_str())
                    .map_err(|e| anyhow!("Unable to create ip2geo directory: {}", e))?;
                let p = format!("{}/ip2geo.toml", ip2geo_dir.as_str());
                if Path::new(p.as_str()).exists() {
                    builder = builder.add_source(config::File::with_name(p.as_str()));
                } else {
                    std::fs::write(p.as_str(), EMPTY_CONFIG).map_err(|e| {
                        anyhow!("Unable to create config file {}: {}", p.as_str(), e)
                    })?;
                }
            }
        }

        // E.g., `IP2GEO_MAX_BUNDLE_SIZE=50` overrides the bundle size
        builder = builder.add_source(config::Environment::with_prefix("IP2GEO"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let config = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        Self::from_map(&config, &ip2geo_dir)
    }

    /// Build a configuration from already-flattened key/value settings
    fn from_map(config: &HashMap<String, String>, default_data_dir: &str) -> Result<Ip2GeoConfig> {
        let data_dir = match config.get("data_dir") {
            Some(p) => p.clone(),
            None => {
                std::fs::create_dir_all(default_data_dir)
                    .map_err(|e| anyhow!("Unable to create data directory: {}", e))?;
                default_data_dir.to_string()
            }
        };

        Ok(Ip2GeoConfig {
            data_dir,
            max_bundle_size: parse_setting(config, "max_bundle_size", DEFAULT_MAX_BUNDLE_SIZE)?,
            max_concurrent_searches: parse_setting(
                config,
                "max_concurrent_searches",
                DEFAULT_MAX_CONCURRENT_SEARCHES,
            )?,
            timeout_secs: parse_setting(config, "timeout_secs", DEFAULT_TIMEOUT_SECS)?,
            lock_duration_secs: parse_setting(
                config,
                "lock_duration_secs",
                DEFAULT_LOCK_DURATION_SECS,
            )?,
        })
    }

    /// Get the path to the SQLite database file
    pub fn sqlite_path(&self) -> String {
        let data_dir = self.data_dir.trim_end_matches('/');
        format!("{}/ip2geo-data.sqlite3", data_dir)
    }

    /// Timeout for synchronous calls as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Multi-IP lookup settings derived from this configuration
    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings::new(self.max_bundle_size, self.max_concurrent_searches)
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        [
            format!("Data Directory:          {}", self.data_dir),
            format!("SQLite Path:             {}", self.sqlite_path()),
            format!("Max Bundle Size:         {}", self.max_bundle_size),
            format!("Max Concurrent Searches: {}", self.max_concurrent_searches),
            format!("Timeout:                 {} seconds", self.timeout_secs),
            format!("Lock Duration:           {} seconds", self.lock_duration_secs),
        ]
        .join("\n")
    }

    /// Get the config file path
    pub fn config_file_path() -> String {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/.ip2geo/ip2geo.toml", home_dir)
    }
}

fn parse_setting<T>(config: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match config.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value '{}' for {}: {}", raw, key, e)),
        None => Ok(default),
    }
}

/// Bundle size and concurrency ceiling for multi-IP lookups
///
/// Both values are clamped to at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_bundle_size: usize,
    pub max_concurrent_searches: usize,
}

impl BatchSettings {
    pub fn new(max_bundle_size: usize, max_concurrent_searches: usize) -> Self {
        Self {
            max_bundle_size: max_bundle_size.max(1),
            max_concurrent_searches: max_concurrent_searches.max(1),
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUNDLE_SIZE, DEFAULT_MAX_CONCURRENT_SEARCHES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Ip2GeoConfig::default();
        assert_eq!(config.max_bundle_size, 100);
        assert_eq!(config.max_concurrent_searches, 4);
        assert_eq!(config.timeout_secs, 30);
        assert!(config.data_dir.ends_with("/.ip2geo"));
    }

    #[test]
    fn test_paths() {
        let config = Ip2GeoConfig {
            data_dir: "/test/dir/".to_string(),
            ..Default::default()
        };

        assert_eq!(config.sqlite_path(), "/test/dir/ip2geo-data.sqlite3");
    }

    #[test]
    fn test_from_map_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = HashMap::new();
        map.insert("max_bundle_size".to_string(), "25".to_string());
        map.insert("max_concurrent_searches".to_string(), "2".to_string());
        map.insert("timeout_secs".to_string(), "5".to_string());

        let config = Ip2GeoConfig::from_map(&map, dir.path().to_str().unwrap()).unwrap();
        assert_eq!(config.max_bundle_size, 25);
        assert_eq!(config.max_concurrent_searches, 2);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.lock_duration_secs, DEFAULT_LOCK_DURATION_SECS);
        assert_eq!(config.data_dir, dir.path().to_str().unwrap());
    }

    #[test]
    fn test_from_map_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = HashMap::new();
        map.insert("max_bundle_size".to_string(), "lots".to_string());

        let err = Ip2GeoConfig::from_map(&map, dir.path().to_str().unwrap())
            .err()
            .unwrap();
        assert!(err.to_string().contains("max_bundle_size"));
    }

    #[test]
    fn test_new_with_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip2geo.toml");
        std::fs::write(
            &path,
            format!(
                "data_dir = \"{}\"\nmax_bundle_size = 10\n",
                dir.path().display()
            ),
        )
        .unwrap();

        let config = Ip2GeoConfig::new(&Some(path.to_string_lossy().to_string())).unwrap();
        assert_eq!(config.max_bundle_size, 10);
        assert_eq!(config.data_dir, dir.path().display().to_string());
    }

    #[test]
    fn test_batch_settings_clamped() {
        let settings = BatchSettings::new(0, 0);
        assert_eq!(settings.max_bundle_size, 1);
        assert_eq!(settings.max_concurrent_searches, 1);

        let config = Ip2GeoConfig {
            max_bundle_size: 7,
            max_concurrent_searches: 3,
            ..Default::default()
        };
        assert_eq!(config.batch_settings(), BatchSettings::new(7, 3));
    }
}
