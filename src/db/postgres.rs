// ============================================================================
// POSTGRES DRIVER
// ============================================================================

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::types::BigDecimal;
use sqlx::{Column, Connection, Executor, Row, TypeInfo, ValueRef};
use tracing::{debug, trace};

use super::{ConnectionDescriptor, Connector, Database, QueryResult, SqlValue};
use crate::error::{DbError, DbResult};
use crate::ENGINE_NAME;

/// Opens sqlx pools capped at a single connection per server.
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_timeout: Duration,
    statement_timeout: Duration,
}

impl PgConnector {
    /// A zero `statement_timeout` leaves the server default in place.
    pub fn new(connect_timeout: Duration, statement_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            statement_timeout,
        }
    }

    fn options(&self, descriptor: &ConnectionDescriptor) -> DbResult<PgConnectOptions> {
        let ssl_mode = PgSslMode::from_str(&descriptor.sslmode)
            .map_err(|e| DbError::Connect(format!("invalid sslmode {:?}: {}", descriptor.sslmode, e)))?;

        let mut options = PgConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .username(&descriptor.user)
            .database(&descriptor.database)
            .ssl_mode(ssl_mode)
            .application_name(ENGINE_NAME);

        if let Some(password) = &descriptor.password {
            options = options.password(password);
        }
        if !self.statement_timeout.is_zero() {
            options = options.options([("statement_timeout", self.statement_timeout.as_millis())]);
        }
        Ok(options)
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> DbResult<Arc<dyn Database>> {
        let options = self.options(descriptor)?;
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .min_connections(0)
            .acquire_timeout(self.connect_timeout)
            .connect_lazy_with(options);

        debug!(
            target: "pg_exporter::db",
            server = %descriptor.fingerprint(),
            "Opened lazy connection pool"
        );
        Ok(Arc::new(PgDatabase { pool }))
    }
}

/// A single-connection pool for one server
#[derive(Debug)]
pub struct PgDatabase {
    pool: PgPool,
}

#[async_trait]
impl Database for PgDatabase {
    async fn query(&self, sql: &str) -> DbResult<QueryResult> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;

        let columns: Vec<String> = match rows.first() {
            Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            None => self
                .pool
                .describe(sql)
                .await
                .map_err(|e| DbError::Columns(e.to_string()))?
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
        };

        let rows = rows.iter().map(decode_row).collect::<DbResult<Vec<_>>>()?;
        trace!(target: "pg_exporter::db", rows = rows.len(), "Query returned");
        Ok(QueryResult::new(columns, rows))
    }

    async fn ping(&self) -> DbResult<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?;
        conn.ping().await.map_err(|e| DbError::Connect(e.to_string()))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

// ----------------------------------------------------------------------------
// Row Decoding
// ----------------------------------------------------------------------------

fn decode_row(row: &PgRow) -> DbResult<Vec<SqlValue>> {
    (0..row.columns().len()).map(|i| decode_column(row, i)).collect()
}

fn decode_column(row: &PgRow, index: usize) -> DbResult<SqlValue> {
    let column = &row.columns()[index];
    let type_name = column.type_info().name().to_string();
    let decode_err = |e: sqlx::Error| DbError::Decode {
        column: column.name().to_string(),
        message: e.to_string(),
    };

    let value = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index).map_err(decode_err)?.map(SqlValue::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)
            .map_err(decode_err)?
            .map(|v| SqlValue::Int(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)
            .map_err(decode_err)?
            .map(|v| SqlValue::Int(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(index).map_err(decode_err)?.map(SqlValue::Int),
        "OID" => row
            .try_get::<Option<sqlx::postgres::types::Oid>, _>(index)
            .map_err(decode_err)?
            .map(|v| SqlValue::Int(v.0.into())),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)
            .map_err(decode_err)?
            .map(|v| SqlValue::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index).map_err(decode_err)?.map(SqlValue::Float),
        "NUMERIC" => row
            .try_get::<Option<BigDecimal>, _>(index)
            .map_err(decode_err)?
            .map(|v| v.to_string().parse().map(SqlValue::Float).unwrap_or(SqlValue::Text(v.to_string()))),
        "TEXT" | "VARCHAR" | "NAME" | "BPCHAR" | "CHAR" => {
            row.try_get::<Option<String>, _>(index).map_err(decode_err)?.map(SqlValue::Text)
        }
        "BYTEA" => row.try_get::<Option<Vec<u8>>, _>(index).map_err(decode_err)?.map(SqlValue::Bytes),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map_err(decode_err)?
            .map(SqlValue::Timestamp),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map_err(decode_err)?
            .map(|v| SqlValue::Timestamp(v.and_utc())),
        "FLOAT8[]" => row
            .try_get::<Option<Vec<f64>>, _>(index)
            .map_err(decode_err)?
            .map(SqlValue::FloatArray),
        "FLOAT4[]" => row
            .try_get::<Option<Vec<f32>>, _>(index)
            .map_err(decode_err)?
            .map(|v| SqlValue::FloatArray(v.into_iter().map(f64::from).collect())),
        "INT8[]" => row
            .try_get::<Option<Vec<i64>>, _>(index)
            .map_err(decode_err)?
            .map(SqlValue::IntArray),
        "INT4[]" => row
            .try_get::<Option<Vec<i32>>, _>(index)
            .map_err(decode_err)?
            .map(|v| SqlValue::IntArray(v.into_iter().map(i64::from).collect())),
        "INET" | "CIDR" => {
            let raw = row.try_get_raw(index).map_err(decode_err)?;
            if raw.is_null() {
                None
            } else {
                let malformed = |message: String| DbError::Decode {
                    column: column.name().to_string(),
                    message,
                };
                let bytes = raw.as_bytes().map_err(|e| malformed(e.to_string()))?;
                let text = format_inet(bytes, type_name == "CIDR")
                    .ok_or_else(|| malformed(format!("malformed {} value", type_name)))?;
                Some(SqlValue::Text(text))
            }
        }
        _ => return Ok(SqlValue::Other(type_name)),
    };

    Ok(value.unwrap_or(SqlValue::Null))
}

/// Text form of a binary `inet`/`cidr` value.
///
/// Layout: family (2 = IPv4, 3 = IPv6), mask bits, is_cidr flag, address
/// length, address bytes. Host addresses print without a mask, as psql does.
fn format_inet(bytes: &[u8], cidr: bool) -> Option<String> {
    let [family, bits, _, len, addr @ ..] = bytes else {
        return None;
    };
    let (addr, full_mask): (IpAddr, u8) = match (*family, usize::from(*len)) {
        (2, 4) => (<[u8; 4]>::try_from(addr).ok()?.into(), 32),
        (3, 16) => (<[u8; 16]>::try_from(addr).ok()?.into(), 128),
        _ => return None,
    };
    if cidr || *bits != full_mask {
        Some(format!("{}/{}", addr, bits))
    } else {
        Some(addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inet_values_keep_their_address() {
        assert_eq!(format_inet(&[2, 32, 0, 4, 10, 0, 0, 7], false).as_deref(), Some("10.0.0.7"));
        assert_eq!(format_inet(&[2, 24, 1, 4, 192, 168, 1, 0], true).as_deref(), Some("192.168.1.0/24"));

        let mut v6 = vec![3, 128, 0, 16];
        v6.extend_from_slice(&[0; 15]);
        v6.push(1);
        assert_eq!(format_inet(&v6, false).as_deref(), Some("::1"));

        assert_eq!(format_inet(&[2, 32, 0, 4, 10, 0], false), None);
        assert_eq!(format_inet(&[9, 32, 0, 4, 10, 0, 0, 7], false), None);
    }

    #[test]
    fn test_invalid_sslmode_is_rejected() {
        let connector = PgConnector::new(Duration::from_secs(1), Duration::ZERO);
        let mut descriptor = ConnectionDescriptor::new("localhost", 5432);
        descriptor.sslmode = "sometimes".into();
        assert!(matches!(connector.options(&descriptor), Err(DbError::Connect(_))));
    }

    #[test]
    fn test_options_accept_libpq_sslmodes() {
        let connector = PgConnector::new(Duration::from_secs(1), Duration::from_secs(5));
        for mode in ["disable", "prefer", "require", "verify-full"] {
            let mut descriptor = ConnectionDescriptor::new("localhost", 5432);
            descriptor.sslmode = mode.into();
            assert!(connector.options(&descriptor).is_ok(), "mode {}", mode);
        }
    }
}
