// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration: TOML file, then `PG_EXPORTER_` environment variables
// (`__` separates nesting, e.g. `PG_EXPORTER_HTTP__LISTEN_ADDRESS`).
// ============================================================================

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::db::ConnectionDescriptor;
use crate::error::ConfigError;
use crate::pool::RetryPolicy;
use crate::{
    DEFAULT_CONNECT_RETRY_ATTEMPTS, DEFAULT_CONNECT_RETRY_BACKOFF, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_LISTEN_ADDRESS,
    DEFAULT_MAX_CONCURRENT_SCRAPES, DEFAULT_METRIC_PREFIX, DEFAULT_STATEMENT_TIMEOUT_SECS, DEFAULT_TELEMETRY_PATH,
    MAX_CONCURRENT_SCRAPES, SERVER_LABEL,
};

static METRIC_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("metric name regex is valid"));

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExporterConfig {
    #[serde(default)]
    pub exporter: ScrapeConfig,

    /// Servers to scrape
    #[serde(default)]
    pub endpoints: Vec<ConnectionDescriptor>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PG_EXPORTER_").split("__"))
            .extract()
            .map_err(ConfigError::parse)?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Figment::from(figment::providers::Serialized::defaults(Self::default()))
            .merge(Env::prefixed("PG_EXPORTER_").split("__"))
            .extract()
            .map_err(ConfigError::parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(ConfigError::parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = &self.exporter.metric_prefix;
        if !prefix.is_empty() && !METRIC_NAME_RE.is_match(prefix) {
            return Err(ConfigError::invalid_value(
                "exporter.metric_prefix",
                format!("'{}' is not a valid metric name prefix", self.exporter.metric_prefix),
            ));
        }

        for name in self.exporter.constant_labels.keys() {
            if name == SERVER_LABEL {
                return Err(ConfigError::invalid_value(
                    "exporter.constant_labels",
                    format!("'{}' is reserved", SERVER_LABEL),
                ));
            }
            if !METRIC_NAME_RE.is_match(name) || name.starts_with("__") {
                return Err(ConfigError::invalid_value(
                    "exporter.constant_labels",
                    format!("'{}' is not a valid label name", name),
                ));
            }
        }

        if !(1..=MAX_CONCURRENT_SCRAPES).contains(&self.exporter.max_concurrent_scrapes) {
            return Err(ConfigError::invalid_value(
                "exporter.max_concurrent_scrapes",
                format!("must be between 1 and {}", MAX_CONCURRENT_SCRAPES),
            ));
        }

        if self.pool.retry_attempts == 0 {
            return Err(ConfigError::invalid_value("pool.retry_attempts", "must be at least 1"));
        }

        if !self.http.telemetry_path.starts_with('/') {
            return Err(ConfigError::invalid_value("http.telemetry_path", "must start with '/'"));
        }

        if self.http.listen_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "http.listen_address",
                format!("'{}' is not a socket address", self.http.listen_address),
            ));
        }

        let mut seen = HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.host.trim().is_empty() {
                return Err(ConfigError::missing_field(format!("endpoints[{}].host", i)));
            }
            if !seen.insert(endpoint.fingerprint()) {
                return Err(ConfigError::invalid_value(
                    format!("endpoints[{}]", i),
                    format!("duplicate endpoint {}", endpoint.fingerprint()),
                ));
            }
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let mut config = Self::default();
        config.endpoints.push(ConnectionDescriptor::default());
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Scrape Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Prefix for exported metric names
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,

    /// Labels added to every metric
    #[serde(default)]
    pub constant_labels: BTreeMap<String, String>,

    /// Skip the built-in namespaces; user queries still apply
    #[serde(default)]
    pub disable_default_metrics: bool,

    /// Skip `pg_settings`
    #[serde(default)]
    pub disable_settings_metrics: bool,

    /// Optional YAML file of extra namespaces
    #[serde(default)]
    pub user_queries_path: Option<PathBuf>,

    /// Endpoints scraped in parallel
    #[serde(default = "default_max_concurrent_scrapes")]
    pub max_concurrent_scrapes: usize,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            metric_prefix: default_metric_prefix(),
            constant_labels: BTreeMap::new(),
            disable_default_metrics: false,
            disable_settings_metrics: false,
            user_queries_path: None,
            max_concurrent_scrapes: default_max_concurrent_scrapes(),
        }
    }
}

fn default_metric_prefix() -> String {
    DEFAULT_METRIC_PREFIX.into()
}

fn default_max_concurrent_scrapes() -> usize {
    DEFAULT_MAX_CONCURRENT_SCRAPES
}

// ----------------------------------------------------------------------------
// Connection Pool Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff step between attempts (milliseconds)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Server-side statement timeout, 0 disables
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

impl PoolConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            backoff_step: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            statement_timeout_secs: default_statement_timeout_secs(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    DEFAULT_CONNECT_RETRY_ATTEMPTS
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_CONNECT_RETRY_BACKOFF.as_millis() as u64
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_statement_timeout_secs() -> u64 {
    DEFAULT_STATEMENT_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// HTTP Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_telemetry_path")]
    pub telemetry_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            telemetry_path: default_telemetry_path(),
        }
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.into()
}

fn default_telemetry_path() -> String {
    DEFAULT_TELEMETRY_PATH.into()
}

// ----------------------------------------------------------------------------
// Logging Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}
