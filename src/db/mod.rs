// ============================================================================
// DATABASE ABSTRACTION
// ============================================================================
// The scrape engine talks to servers only through the `Database` and
// `Connector` traits. Values are decoded into `SqlValue` at the driver
// boundary so that conversion rules live in one place.
// ============================================================================

pub mod postgres;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbResult;
use crate::DEFAULT_POSTGRES_PORT;

pub use self::postgres::PgConnector;

// ----------------------------------------------------------------------------
// Values
// ----------------------------------------------------------------------------

/// A single decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    FloatArray(Vec<f64>),
    IntArray(Vec<i64>),
    /// A type the driver cannot decode; carries the type name
    Other(String),
}

impl SqlValue {
    /// Numeric reading of a value.
    ///
    /// NULL reads as NaN. Text and bytes are parsed; timestamps become unix
    /// seconds. `None` means the value has no numeric reading.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Null => Some(f64::NAN),
            SqlValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            SqlValue::Int(i) => Some(*i as f64),
            SqlValue::Float(f) => Some(*f),
            SqlValue::Timestamp(ts) => Some(ts.timestamp() as f64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok().and_then(|s| s.trim().parse().ok()),
            SqlValue::FloatArray(_) | SqlValue::IntArray(_) | SqlValue::Other(_) => None,
        }
    }

    /// Unsigned reading used for histogram counts. NULL reads as 0.
    pub fn to_u64(&self) -> Option<u64> {
        match self {
            SqlValue::Null => Some(0),
            SqlValue::Int(i) => u64::try_from(*i).ok(),
            SqlValue::Float(f) if *f >= 0.0 && f.is_finite() => Some(*f as u64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok().and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    /// Text used as a label value. NULL is the empty string, timestamps are
    /// unix nanoseconds.
    pub fn to_label(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            SqlValue::Timestamp(ts) => ts
                .timestamp_nanos_opt()
                .map(|n| n.to_string())
                .unwrap_or_default(),
            SqlValue::FloatArray(v) => array_literal(v),
            SqlValue::IntArray(v) => array_literal(v),
            SqlValue::Other(_) => String::new(),
        }
    }

    /// Borrowed text, for lookup-style conversions
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            SqlValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Float array reading; also accepts array literals such as `{1,2.5,5}`
    pub fn to_f64_array(&self) -> Option<Vec<f64>> {
        match self {
            SqlValue::FloatArray(v) => Some(v.clone()),
            SqlValue::IntArray(v) => Some(v.iter().map(|i| *i as f64).collect()),
            SqlValue::Text(s) => parse_array_literal(s),
            _ => None,
        }
    }

    /// Integer array reading; also accepts array literals such as `{3,7,9}`
    pub fn to_i64_array(&self) -> Option<Vec<i64>> {
        match self {
            SqlValue::IntArray(v) => Some(v.clone()),
            SqlValue::Text(s) => parse_array_literal(s),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Other(type_name) => write!(f, "<{}>", type_name),
            other => write!(f, "{}", other.to_label()),
        }
    }
}

fn array_literal<T: ToString>(values: &[T]) -> String {
    let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("{{{}}}", parts.join(","))
}

fn parse_array_literal<T: std::str::FromStr>(s: &str) -> Option<Vec<T>> {
    let inner = s.trim().strip_prefix('{')?.strip_suffix('}')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner.split(',').map(|p| p.trim().parse().ok()).collect()
}

// ----------------------------------------------------------------------------
// Result Sets
// ----------------------------------------------------------------------------

/// Column names and fully materialized rows of one query
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Connection Descriptors
// ----------------------------------------------------------------------------

/// Structured description of one endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    #[serde(default = "default_database")]
    pub database: String,

    /// libpq style ssl mode (`disable`, `prefer`, `require`, ...)
    #[serde(default = "default_sslmode")]
    pub sslmode: String,

    /// Whether this endpoint is a primary; non-master servers skip
    /// master-only namespaces and runtime settings
    #[serde(default = "default_true")]
    pub master: bool,
}

fn default_port() -> u16 {
    DEFAULT_POSTGRES_PORT
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_sslmode() -> String {
    "prefer".to_string()
}

fn default_true() -> bool {
    true
}

impl ConnectionDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: default_user(),
            password: None,
            database: default_database(),
            sslmode: default_sslmode(),
            master: true,
        }
    }

    /// `host:port`; identifies the server in the registry and in the
    /// `server` label
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionDescriptor {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_POSTGRES_PORT)
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("sslmode", &self.sslmode)
            .field("master", &self.master)
            .finish()
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "postgresql://{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

// ----------------------------------------------------------------------------
// Driver Traits
// ----------------------------------------------------------------------------

/// An open handle to one server
#[async_trait]
pub trait Database: Send + Sync + fmt::Debug {
    /// Run a query and materialize every row
    async fn query(&self, sql: &str) -> DbResult<QueryResult>;

    /// Check the server is reachable
    async fn ping(&self) -> DbResult<()>;

    /// Release the underlying connection
    async fn close(&self);
}

/// Opens `Database` handles from descriptors
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> DbResult<Arc<dyn Database>>;
}
