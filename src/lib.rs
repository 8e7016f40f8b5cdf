//! # pg-exporter engine
//!
//! Polls one or more PostgreSQL servers, translates their statistics views into
//! typed metrics and serves the latest values to a pull-based collector.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              PG EXPORTER ENGINE                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  REGISTRY → VERSION CHECK → METRIC MAP / OVERRIDES → CACHE → ROW CONVERT │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`version`] extracts a semantic version from the server banner
//! - [`mapping`] compiles declarative column tables into per-version mappings
//! - [`overrides`] picks the version-appropriate SQL for each namespace
//! - [`pool`] owns one connection per server fingerprint
//! - [`cache`] replays recent namespace results without re-querying
//! - [`scrape`] and [`settings`] turn rows into metrics
//! - [`exporter`] drives a collection pass and owns the status gauges

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod exporter;
pub mod logging;
pub mod mapping;
pub mod metrics;
pub mod overrides;
pub mod pool;
pub mod scrape;
pub mod server;
pub mod settings;
pub mod version;

pub use config::ExporterConfig;
pub use error::{ExporterError, ExporterResult};
pub use exporter::Exporter;
pub use metrics::{Metric, MetricDesc, ValueType};
pub use version::{Version, VersionRange};

use std::time::Duration;

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "pg-exporter";
pub const ENGINE_FULL_NAME: &str = "PostgreSQL Statistics Exporter";

// ----------------------------------------------------------------------------
// Metric Naming
// ----------------------------------------------------------------------------

/// Prefix applied to every exported metric name
pub const DEFAULT_METRIC_PREFIX: &str = "pg";

/// Label carrying the host:port fingerprint of the scraped server
pub const SERVER_LABEL: &str = "server";

/// Name of the static version info metric
pub const STATIC_METRIC_NAME: &str = "static";

/// Lowest server version the built-in maps are tested against
pub const LOWEST_SUPPORTED_VERSION: version::Version = version::Version::new(9, 1, 0);

// ----------------------------------------------------------------------------
// Connection Pool
// ----------------------------------------------------------------------------

/// Attempts made by the registry before reporting an endpoint unreachable
pub const DEFAULT_CONNECT_RETRY_ATTEMPTS: u32 = 3;

/// Backoff step; attempt `n` sleeps `n * step`
pub const DEFAULT_CONNECT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Default driver connect timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default server-side statement timeout (seconds, 0 = disabled)
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 0;

/// Default PostgreSQL port
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;

// ----------------------------------------------------------------------------
// Scraping
// ----------------------------------------------------------------------------

/// Endpoints scraped in parallel during one collection pass
pub const DEFAULT_MAX_CONCURRENT_SCRAPES: usize = 4;

/// Upper bound for `max_concurrent_scrapes`
pub const MAX_CONCURRENT_SCRAPES: usize = 64;

/// Collection passes slower than this are logged at warn level (milliseconds)
pub const SLOW_SCRAPE_THRESHOLD_MS: u64 = 5_000;

// ----------------------------------------------------------------------------
// HTTP
// ----------------------------------------------------------------------------

/// Default listen address for the metrics endpoint
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9187";

/// Default path the metrics are served on
pub const DEFAULT_TELEMETRY_PATH: &str = "/metrics";

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 10;
