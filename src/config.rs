//! Proxy Configuration
//!
//! Loaded from the TOML file named by `EDGE_LOG_CONFIG` (all sections
//! optional), then overridden by environment variables:
//!
//! | Variable                     | Field                  |
//! |------------------------------|------------------------|
//! | `EDGE_LOG_LISTEN`            | `server.listen_addr`   |
//! | `EDGE_LOG_ORIGIN`            | `origin.url`           |
//! | `EDGE_LOG_FLUSH_THRESHOLD`   | `flush.threshold`      |
//! | `EDGE_LOG_FLUSH_INTERVAL_MS` | `flush.interval_ms`    |
//! | `EDGE_LOG_STORE`             | `storage.bulk`         |
//! | `EDGE_LOG_DATA_PATH`         | `storage.path`         |
//! | `RUST_LOG`                   | `logging.level`        |

use crate::buffer::policy::{FlushOrdering, FlushPolicy, DEFAULT_INTERVAL, DEFAULT_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_PATH_ENV: &str = "EDGE_LOG_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub origin: OriginConfig,
    pub flush: FlushConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Largest request body forwarded to the origin
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_body_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL requests are forwarded to; path and query are appended
    pub url: String,
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        OriginConfig {
            url: "http://127.0.0.1:8081".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Lines that force an immediate flush (default: 100)
    pub threshold: usize,
    /// Maximum time between flushes (default: 5 minutes)
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,
    pub ordering: FlushOrdering,
    /// Flush every live actor after the server stops
    pub flush_on_shutdown: bool,
}

impl Default for FlushConfig {
    fn default() -> Self {
        FlushConfig {
            threshold: DEFAULT_THRESHOLD,
            interval: DEFAULT_INTERVAL,
            ordering: FlushOrdering::default(),
            flush_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStoreKind {
    Memory,
    #[default]
    LocalFs,
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateStoreKind {
    Memory,
    #[default]
    LocalFs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bulk: BulkStoreKind,
    pub state: StateStoreKind,
    /// Root for the local-filesystem stores (`objects/` and `state/` below it)
    pub path: PathBuf,
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            bulk: BulkStoreKind::LocalFs,
            state: StateStoreKind::LocalFs,
            path: PathBuf::from("./data"),
            s3: None,
        }
    }
}

impl StorageConfig {
    pub fn objects_path(&self) -> PathBuf {
        self.path.join("objects")
    }

    pub fn state_path(&self) -> PathBuf {
        self.path.join("state")
    }
}

/// S3 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Key prefix within bucket
    #[serde(default)]
    pub prefix: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// File named by `EDGE_LOG_CONFIG` (defaults when unset), environment
    /// overrides, then validation
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Config::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("EDGE_LOG_LISTEN") {
            self.server.listen_addr = parse_var("EDGE_LOG_LISTEN", &addr)?;
        }
        if let Some(url) = lookup("EDGE_LOG_ORIGIN") {
            self.origin.url = url;
        }
        if let Some(threshold) = lookup("EDGE_LOG_FLUSH_THRESHOLD") {
            self.flush.threshold = parse_var("EDGE_LOG_FLUSH_THRESHOLD", &threshold)?;
        }
        if let Some(ms) = lookup("EDGE_LOG_FLUSH_INTERVAL_MS") {
            self.flush.interval = Duration::from_millis(parse_var("EDGE_LOG_FLUSH_INTERVAL_MS", &ms)?);
        }
        if let Some(store) = lookup("EDGE_LOG_STORE") {
            self.storage.bulk = match store.to_ascii_lowercase().as_str() {
                "memory" => BulkStoreKind::Memory,
                "localfs" => BulkStoreKind::LocalFs,
                "s3" => BulkStoreKind::S3,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "EDGE_LOG_STORE: unknown store {:?}",
                        other
                    )))
                }
            };
        }
        if let Some(path) = lookup("EDGE_LOG_DATA_PATH") {
            self.storage.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("RUST_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush.threshold == 0 {
            return Err(ConfigError::Invalid("flush.threshold must be at least 1".into()));
        }
        if self.flush.interval.is_zero() {
            return Err(ConfigError::Invalid("flush.interval_ms must be positive".into()));
        }

        let origin = url::Url::parse(&self.origin.url)
            .map_err(|e| ConfigError::Invalid(format!("origin.url {:?}: {}", self.origin.url, e)))?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "origin.url must be http or https, got {}",
                origin.scheme()
            )));
        }

        if self.storage.bulk == BulkStoreKind::S3 {
            if !cfg!(feature = "s3") {
                return Err(ConfigError::Invalid(
                    "storage.bulk = \"s3\" requires the `s3` feature".into(),
                ));
            }
            if self.storage.s3.is_none() {
                return Err(ConfigError::Invalid(
                    "storage.bulk = \"s3\" requires a [storage.s3] section".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn to_policy(&self) -> FlushPolicy {
        FlushPolicy::new(self.flush.threshold, self.flush.interval).with_ordering(self.flush.ordering)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}={:?}: {}", name, value, e)))
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.flush.threshold, 100);
        assert_eq!(config.flush.interval, Duration::from_secs(300));
        assert_eq!(config.flush.ordering, FlushOrdering::ClearThenWrite);
        assert!(config.flush.flush_on_shutdown);
        assert_eq!(config.storage.bulk, BulkStoreKind::LocalFs);
        assert!(config.validate().is_ok());
        assert_eq!(config.to_policy(), FlushPolicy::default());
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_toml_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:9000"

            [origin]
            url = "https://origin.internal"
            timeout_ms = 5000

            [flush]
            threshold = 50
            interval_ms = 60000
            ordering = { mode = "write_then_clear", max_retries = 3, backoff_ms = 200 }

            [storage]
            bulk = "memory"
            state = "memory"

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.max_body_bytes, 2 * 1024 * 1024);
        assert_eq!(config.origin.timeout, Duration::from_secs(5));
        assert_eq!(config.storage.bulk, BulkStoreKind::Memory);
        assert!(config.logging.json);

        let policy = config.to_policy();
        assert_eq!(policy.threshold, 50);
        assert_eq!(policy.interval, Duration::from_secs(60));
        assert_eq!(
            policy.ordering,
            FlushOrdering::WriteThenClear {
                max_retries: 3,
                backoff: Duration::from_millis(200)
            }
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml_str("[flush]\nthreshold = 10\n").unwrap();
        config
            .apply_overrides(env(&[
                ("EDGE_LOG_FLUSH_THRESHOLD", "25"),
                ("EDGE_LOG_FLUSH_INTERVAL_MS", "1500"),
                ("EDGE_LOG_STORE", "memory"),
                ("EDGE_LOG_DATA_PATH", "/var/lib/edge-log"),
                ("RUST_LOG", "warn"),
            ]))
            .unwrap();

        assert_eq!(config.flush.threshold, 25);
        assert_eq!(config.flush.interval, Duration::from_millis(1500));
        assert_eq!(config.storage.bulk, BulkStoreKind::Memory);
        assert_eq!(config.storage.state_path(), PathBuf::from("/var/lib/edge-log/state"));
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_bad_override_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("EDGE_LOG_FLUSH_THRESHOLD", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = config
            .apply_overrides(env(&[("EDGE_LOG_STORE", "tape")]))
            .unwrap_err();
        assert!(err.to_string().contains("tape"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.flush.threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.flush.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.origin.url = "ftp://origin".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.bulk = BulkStoreKind::S3;
        assert!(config.validate().is_err(), "s3 without a section");
    }

    #[test]
    fn test_parse_error() {
        let err = Config::from_toml_str("[flush]\nthreshold = \"ten\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/edge-log.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
