// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error type per subsystem, all convertible into `ExporterError`.
// The split mirrors the failure taxonomy of a collection pass:
// - connection errors make an endpoint unreachable for the pass
// - query errors are fatal to one namespace only
// - conversion errors skip a single value
// - configuration errors are static defects and fail fast
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Top-level Error
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Version error: {0}")]
    Version(#[from] VersionParseError),

    #[error("Metrics registry error: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Connection(_) => true,
            ExporterError::Query(_) => true,
            ExporterError::Settings(e) => !e.is_configuration_defect(),
            ExporterError::Version(_) => true,
            ExporterError::Registry(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Connection(_) => "connection",
            ExporterError::Query(_) => "query",
            ExporterError::Settings(_) => "settings",
            ExporterError::Version(_) => "version",
            ExporterError::Registry(_) => "registry",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ExporterError::Config(_) | ExporterError::Registry(_) => RecoveryHint::FixConfiguration,
            ExporterError::Connection(_) => RecoveryHint::Reconnect,
            ExporterError::Settings(e) if e.is_configuration_defect() => RecoveryHint::FixConfiguration,
            ExporterError::Query(_) | ExporterError::Settings(_) => RecoveryHint::Skip,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with linear backoff
    RetryWithBackoff,
    /// Drop the connection and open a new one
    Reconnect,
    /// Fix the static tables or configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors in configuration files and static mapping tables
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Unknown column usage '{usage}'")]
    UnknownUsage { usage: String },

    #[error("Invalid version range '{range}': {message}")]
    InvalidVersionRange { range: String, message: String },

    #[error("Override queries for '{namespace}' overlap: '{first}' and '{second}'")]
    OverlappingOverrides {
        namespace: String,
        first: String,
        second: String,
    },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn parse(message: impl ToString) -> Self {
        ConfigError::ParseError {
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Driver Errors
// ----------------------------------------------------------------------------

/// Errors reported by a database handle
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DbError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("column introspection failed: {0}")]
    Columns(String),

    #[error("failed to decode column '{column}': {message}")]
    Decode { column: String, message: String },

    #[error("connection is closed")]
    Closed,
}

// ----------------------------------------------------------------------------
// Connection Errors
// ----------------------------------------------------------------------------

/// Errors obtaining a live server handle
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Error opening connection to database ({server}): {source}")]
    Open {
        server: String,
        #[source]
        source: DbError,
    },

    #[error("Ping to {server} failed: {source}")]
    Ping {
        server: String,
        #[source]
        source: DbError,
    },

    #[error("Giving up on {server} after {attempts} attempts: {last}")]
    RetriesExhausted {
        server: String,
        attempts: u32,
        last: Box<ConnectionError>,
    },
}

impl ConnectionError {
    /// Server fingerprint the error refers to
    pub fn server(&self) -> &str {
        match self {
            ConnectionError::Open { server, .. }
            | ConnectionError::Ping { server, .. }
            | ConnectionError::RetriesExhausted { server, .. } => server,
        }
    }
}

// ----------------------------------------------------------------------------
// Query Errors
// ----------------------------------------------------------------------------

/// Errors fatal to one namespace on one server
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("Error running query on database {server}: {namespace}: {source}")]
    Execution {
        server: String,
        namespace: String,
        #[source]
        source: DbError,
    },

    #[error("Error retrieving column list for {namespace} on {server}: {source}")]
    Introspection {
        server: String,
        namespace: String,
        #[source]
        source: DbError,
    },

    #[error("Error determining server version of {server}: {message}")]
    Version { server: String, message: String },
}

impl QueryError {
    /// Classify a driver error raised while running a namespace query
    pub fn from_db(server: &str, namespace: &str, source: DbError) -> Self {
        match source {
            DbError::Columns(_) => QueryError::Introspection {
                server: server.to_string(),
                namespace: namespace.to_string(),
                source,
            },
            _ => QueryError::Execution {
                server: server.to_string(),
                namespace: namespace.to_string(),
                source,
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Conversion Errors (non-fatal)
// ----------------------------------------------------------------------------

/// A single value that could not be turned into a metric
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("Unexpected error parsing column: {namespace} {column} {value}")]
    Unparseable {
        namespace: String,
        column: String,
        value: String,
    },

    #[error("Unparseable column type - discarding: {namespace} {column} {value}")]
    UnknownColumn {
        namespace: String,
        column: String,
        value: String,
    },

    #[error("Missing column: {namespace} {column}")]
    MissingColumn { namespace: String, column: String },

    #[error("Histogram {namespace} {column} has {keys} bucket bounds but {counts} bucket counts")]
    BucketMismatch {
        namespace: String,
        column: String,
        keys: usize,
        counts: usize,
    },
}

// ----------------------------------------------------------------------------
// Runtime Settings Errors
// ----------------------------------------------------------------------------

/// Errors reading `pg_settings`
#[derive(Error, Debug, Clone)]
pub enum SettingsError {
    #[error("Error retrieving settings: {0}")]
    Query(#[from] QueryError),

    #[error("Unknown unit for runtime variable {name:?}: {unit:?}")]
    UnknownUnit { name: String, unit: String },

    #[error("Unsupported vartype {vartype:?} for setting {name:?}")]
    UnsupportedVartype { name: String, vartype: String },

    #[error("Error converting setting {name:?} value {value:?} to float: {message}")]
    InvalidValue {
        name: String,
        value: String,
        message: String,
    },
}

impl SettingsError {
    /// Unknown units mean the conversion table itself is incomplete.
    pub fn is_configuration_defect(&self) -> bool {
        matches!(self, SettingsError::UnknownUnit { .. })
    }
}

// ----------------------------------------------------------------------------
// Version Errors
// ----------------------------------------------------------------------------

/// No recognizable version in a server banner
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Could not find a postgres version in string: {banner:?}")]
pub struct VersionParseError {
    pub banner: String,
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for driver operations
pub type DbResult<T> = Result<T, DbError>;
