// ============================================================================
// SCRAPE ENGINE
// ============================================================================
// Executes namespace queries against one server and converts rows into
// metrics using the server's compiled mapping state.
//
// Failure scopes:
// - a query or column introspection error drops its namespace only
// - a conversion error drops one value
// - an unknown settings unit aborts the whole collection pass
// ============================================================================

use std::collections::BTreeMap;

use chrono::Utc;
use ordered_float::OrderedFloat;
use tracing::{debug, error, trace, warn};

use crate::cache::CacheDecision;
use crate::db::{QueryResult, SqlValue};
use crate::error::{ConversionError, QueryError, SettingsError};
use crate::mapping::{CompiledMapping, Converted, MappingState, MetricMapNamespace};
use crate::metrics::{HistogramValue, LabelValues, Metric, ValueType};
use crate::overrides::{self, ResolvedQuery};
use crate::server::Server;
use crate::settings;

/// Per-pass switches taken from the exporter configuration
#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub metric_prefix: String,
    pub disable_settings_metrics: bool,
}

/// Everything one server produced during a pass
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub metrics: Vec<Metric>,
    /// Namespaces that produced nothing because their query failed
    pub namespace_errors: Vec<QueryError>,
    /// Values skipped during conversion
    pub conversion_errors: Vec<ConversionError>,
    pub settings_errors: Vec<SettingsError>,
}

impl ScrapeReport {
    pub fn has_errors(&self) -> bool {
        !(self.namespace_errors.is_empty() && self.conversion_errors.is_empty() && self.settings_errors.is_empty())
    }
}

// ----------------------------------------------------------------------------
// Server Scrape
// ----------------------------------------------------------------------------

/// Scrape settings and every namespace of one server.
///
/// Only an unknown settings unit is returned as `Err`.
pub async fn scrape_server(server: &Server, options: &ScrapeOptions) -> Result<ScrapeReport, SettingsError> {
    let state = server.mappings().await;
    let mut report = ScrapeReport::default();

    if !options.disable_settings_metrics && server.is_master() {
        match settings::query_settings(server, &options.metric_prefix).await {
            Ok(scrape) => {
                report.metrics.extend(scrape.metrics);
                report.settings_errors.extend(scrape.skipped);
            }
            Err(e) if e.is_configuration_defect() => return Err(e),
            Err(e) => {
                error!(
                    target: "pg_exporter::scrape",
                    server = %server.fingerprint(),
                    error = %e,
                    "Error retrieving settings"
                );
                report.settings_errors.push(e);
            }
        }
    }

    scrape_namespaces(server, &state, &mut report).await;
    Ok(report)
}

/// Scrape every namespace in `state`, in name order.
pub async fn scrape_namespaces(server: &Server, state: &MappingState, report: &mut ScrapeReport) {
    let started = Utc::now();
    let mut namespaces: Vec<(&String, &MetricMapNamespace)> = state.metric_map.iter().collect();
    namespaces.sort_by(|a, b| a.0.cmp(b.0));

    for (namespace, mapping) in namespaces {
        if mapping.master_only && !server.is_master() {
            trace!(
                target: "pg_exporter::scrape",
                server = %server.fingerprint(),
                namespace = %namespace,
                "Skipping master-only namespace on non-master server"
            );
            continue;
        }

        if let CacheDecision::Replay(metrics) =
            server.cache().should_scrape(namespace, mapping.cache_seconds, started)
        {
            trace!(
                target: "pg_exporter::scrape",
                server = %server.fingerprint(),
                namespace = %namespace,
                metrics = metrics.len(),
                "Replaying cached namespace"
            );
            report.metrics.extend(metrics);
            continue;
        }

        let resolved = overrides::resolve(&state.query_overrides, namespace);
        match scrape_namespace(server, namespace, mapping, resolved).await {
            Ok((metrics, conversion_errors)) => {
                for e in &conversion_errors {
                    warn!(
                        target: "pg_exporter::scrape",
                        server = %server.fingerprint(),
                        namespace = %namespace,
                        error = %e,
                        "Skipped value"
                    );
                }
                server.cache().store(namespace, mapping.cache_seconds, &metrics, started);
                report.metrics.extend(metrics);
                report.conversion_errors.extend(conversion_errors);
            }
            Err(e) => {
                error!(
                    target: "pg_exporter::scrape",
                    server = %server.fingerprint(),
                    namespace = %namespace,
                    error = %e,
                    "Error scraping namespace"
                );
                report.namespace_errors.push(e);
            }
        }
    }
}

/// Run one namespace query and convert its rows.
///
/// A disabled namespace yields no metrics and no error.
pub async fn scrape_namespace(
    server: &Server,
    namespace: &str,
    mapping: &MetricMapNamespace,
    resolved: ResolvedQuery<'_>,
) -> Result<(Vec<Metric>, Vec<ConversionError>), QueryError> {
    let Some(sql) = resolved.sql(namespace) else {
        debug!(
            target: "pg_exporter::scrape",
            server = %server.fingerprint(),
            namespace = %namespace,
            "Namespace disabled for this server version"
        );
        return Ok((Vec::new(), Vec::new()));
    };

    let result = server
        .query(&sql)
        .await
        .map_err(|e| QueryError::from_db(server.fingerprint(), namespace, e))?;

    Ok(convert_rows(namespace, mapping, &result))
}

// ----------------------------------------------------------------------------
// Row Conversion
// ----------------------------------------------------------------------------

/// Convert a full result set. Conversion failures are collected, never fatal.
pub fn convert_rows(
    namespace: &str,
    mapping: &MetricMapNamespace,
    result: &QueryResult,
) -> (Vec<Metric>, Vec<ConversionError>) {
    let mut metrics = Vec::new();
    let mut errors = Vec::new();

    let label_indices: Vec<Option<usize>> = mapping.labels.iter().map(|l| result.column_index(l)).collect();

    for row in &result.rows {
        let label_values: LabelValues = label_indices
            .iter()
            .map(|idx| idx.and_then(|i| row.get(i)).map(SqlValue::to_label).unwrap_or_default())
            .collect();

        for (idx, column) in result.columns.iter().enumerate() {
            let Some(value) = row.get(idx) else {
                continue;
            };

            let outcome = match mapping.columns.get(column) {
                Some(compiled) if compiled.discard => continue,
                Some(compiled) if compiled.histogram => {
                    convert_histogram(namespace, column, compiled, value, result, row, &label_values)
                }
                Some(compiled) => convert_scalar(namespace, column, compiled, value, &label_values),
                None => convert_unknown(namespace, column, mapping, value, &label_values),
            };

            match outcome {
                Ok(Some(metric)) => metrics.push(metric),
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
    }

    (metrics, errors)
}

fn convert_scalar(
    namespace: &str,
    column: &str,
    compiled: &CompiledMapping,
    value: &SqlValue,
    label_values: &LabelValues,
) -> Result<Option<Metric>, ConversionError> {
    let Some(desc) = &compiled.desc else {
        return Ok(None);
    };
    match compiled.conversion.convert(value) {
        Converted::Value(v) => Ok(Some(Metric::scalar(
            desc.clone(),
            compiled.value_type,
            v,
            label_values.clone(),
        ))),
        Converted::Skip => Ok(None),
        Converted::Failed(rendered) => Err(ConversionError::Unparseable {
            namespace: namespace.to_string(),
            column: column.to_string(),
            value: rendered,
        }),
    }
}

fn convert_unknown(
    namespace: &str,
    column: &str,
    mapping: &MetricMapNamespace,
    value: &SqlValue,
    label_values: &LabelValues,
) -> Result<Option<Metric>, ConversionError> {
    match value.to_f64() {
        Some(v) => Ok(Some(Metric::scalar(
            mapping.untyped_desc(namespace, column),
            ValueType::Untyped,
            v,
            label_values.clone(),
        ))),
        None => Err(ConversionError::UnknownColumn {
            namespace: namespace.to_string(),
            column: column.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Rebuild a histogram from the base column (upper bounds), `_bucket`
/// (cumulative counts), `_sum` and `_count`.
fn convert_histogram(
    namespace: &str,
    column: &str,
    compiled: &CompiledMapping,
    keys_value: &SqlValue,
    result: &QueryResult,
    row: &[SqlValue],
    label_values: &LabelValues,
) -> Result<Option<Metric>, ConversionError> {
    let Some(desc) = &compiled.desc else {
        return Ok(None);
    };

    let sub_column = |suffix: &str| {
        let name = format!("{}{}", column, suffix);
        result
            .column_index(&name)
            .and_then(|i| row.get(i))
            .map(|v| (name.clone(), v))
            .ok_or(ConversionError::MissingColumn {
                namespace: namespace.to_string(),
                column: name,
            })
    };
    let unparseable = |name: &str, value: &SqlValue| ConversionError::Unparseable {
        namespace: namespace.to_string(),
        column: name.to_string(),
        value: value.to_string(),
    };

    let keys = keys_value.to_f64_array().ok_or_else(|| unparseable(column, keys_value))?;

    let (bucket_name, bucket_value) = sub_column("_bucket")?;
    let counts = bucket_value
        .to_i64_array()
        .ok_or_else(|| unparseable(&bucket_name, bucket_value))?;

    let (sum_name, sum_value) = sub_column("_sum")?;
    let sum = sum_value.to_f64().ok_or_else(|| unparseable(&sum_name, sum_value))?;

    let (count_name, count_value) = sub_column("_count")?;
    let count = count_value.to_u64().ok_or_else(|| unparseable(&count_name, count_value))?;

    if keys.len() != counts.len() {
        return Err(ConversionError::BucketMismatch {
            namespace: namespace.to_string(),
            column: column.to_string(),
            keys: keys.len(),
            counts: counts.len(),
        });
    }
    let buckets = keys
        .iter()
        .zip(counts.iter())
        .map(|(k, c)| u64::try_from(*c).map(|c| (OrderedFloat(*k), c)))
        .collect::<Result<BTreeMap<OrderedFloat<f64>, u64>, _>>()
        .map_err(|_| unparseable(&bucket_name, bucket_value))?;

    Ok(Some(Metric::histogram(
        desc.clone(),
        HistogramValue { buckets, sum, count },
        label_values.clone(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDatabase;
    use crate::db::ConnectionDescriptor;
    use crate::error::DbError;
    use crate::mapping::{
        build_metric_map, ColumnMapping, ColumnUsage, MappingCatalog, MappingTable, NamespaceMapping,
    };
    use crate::metrics::MetricValue;
    use crate::overrides::ResolvedOverrides;
    use crate::version::{Version, VersionRange};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn labels() -> BTreeMap<String, String> {
        let mut l = BTreeMap::new();
        l.insert("server".to_string(), "db:5432".to_string());
        l
    }

    fn namespace(columns: Vec<(&str, ColumnMapping)>, cache_seconds: u64) -> NamespaceMapping {
        NamespaceMapping {
            columns: columns.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            master_only: false,
            cache_seconds,
        }
    }

    fn compile(table: &MappingTable, version: Version) -> crate::mapping::MetricMap {
        build_metric_map(&version, table, "pg", &labels())
    }

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    #[test]
    fn test_histogram_reconstruction() {
        let mut table = MappingTable::new();
        table.insert(
            "pg_latency".into(),
            namespace(vec![("latency", ColumnMapping::new(ColumnUsage::Histogram, "latency"))], 0),
        );
        let map = compile(&table, Version::new(12, 0, 0));
        let result = QueryResult::new(
            vec!["latency".into(), "latency_bucket".into(), "latency_sum".into(), "latency_count".into()],
            vec![vec![
                SqlValue::FloatArray(vec![1.0, 2.0, 5.0]),
                SqlValue::IntArray(vec![3, 7, 9]),
                SqlValue::Float(42.0),
                SqlValue::Int(9),
            ]],
        );

        let (metrics, errors) = convert_rows("pg_latency", &map["pg_latency"], &result);
        assert!(errors.is_empty());
        assert_eq!(metrics.len(), 1);
        match &metrics[0].value {
            MetricValue::Histogram(h) => {
                let buckets: Vec<(f64, u64)> = h.buckets.iter().map(|(k, v)| (k.into_inner(), *v)).collect();
                assert_eq!(buckets, vec![(1.0, 3), (2.0, 7), (5.0, 9)]);
                assert_eq!(h.sum, 42.0);
                assert_eq!(h.count, 9);
            }
            other => panic!("expected histogram, got {:?}", other),
        }
        assert_eq!(metrics[0].name(), "pg_latency_latency");
    }

    #[test]
    fn test_histogram_missing_sub_column_is_non_fatal() {
        let mut table = MappingTable::new();
        table.insert(
            "pg_latency".into(),
            namespace(
                vec![
                    ("latency", ColumnMapping::new(ColumnUsage::Histogram, "latency")),
                    ("calls", ColumnMapping::new(ColumnUsage::Counter, "calls")),
                ],
                0,
            ),
        );
        let map = compile(&table, Version::new(12, 0, 0));
        let result = QueryResult::new(
            vec!["latency".into(), "latency_bucket".into(), "calls".into()],
            vec![vec![text("{1,2}"), text("{1,2}"), SqlValue::Int(4)]],
        );

        let (metrics, errors) = convert_rows("pg_latency", &map["pg_latency"], &result);
        assert_eq!(metrics.len(), 1);
        assert_eq!(
            errors,
            vec![ConversionError::MissingColumn {
                namespace: "pg_latency".into(),
                column: "latency_sum".into(),
            }]
        );
    }

    #[test]
    fn test_histogram_rejects_short_or_negative_buckets() {
        let mut table = MappingTable::new();
        table.insert(
            "pg_latency".into(),
            namespace(vec![("latency", ColumnMapping::new(ColumnUsage::Histogram, "latency"))], 0),
        );
        let map = compile(&table, Version::new(12, 0, 0));
        let columns = vec![
            "latency".to_string(),
            "latency_bucket".to_string(),
            "latency_sum".to_string(),
            "latency_count".to_string(),
        ];
        let row = |counts: Vec<i64>| {
            vec![
                SqlValue::FloatArray(vec![1.0, 2.0, 5.0]),
                SqlValue::IntArray(counts),
                SqlValue::Float(42.0),
                SqlValue::Int(9),
            ]
        };

        let short = QueryResult::new(columns.clone(), vec![row(vec![3, 7])]);
        let (metrics, errors) = convert_rows("pg_latency", &map["pg_latency"], &short);
        assert!(metrics.is_empty());
        assert_eq!(
            errors,
            vec![ConversionError::BucketMismatch {
                namespace: "pg_latency".into(),
                column: "latency".into(),
                keys: 3,
                counts: 2,
            }]
        );

        let negative = QueryResult::new(columns, vec![row(vec![3, -7, 9])]);
        let (metrics, errors) = convert_rows("pg_latency", &map["pg_latency"], &negative);
        assert!(metrics.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], ConversionError::Unparseable { column, .. } if column == "latency_bucket"));
    }

    #[test]
    fn test_row_conversion() {
        let mut table = MappingTable::new();
        table.insert(
            "pg_stat_things".into(),
            namespace(
                vec![
                    ("datname", ColumnMapping::new(ColumnUsage::Label, "db")),
                    ("state", ColumnMapping::new(ColumnUsage::Label, "state")),
                    ("commits", ColumnMapping::new(ColumnUsage::Counter, "commits")),
                    ("broken", ColumnMapping::new(ColumnUsage::Gauge, "broken")),
                    (
                        "future",
                        ColumnMapping::new(ColumnUsage::Gauge, "future")
                            .versions(VersionRange::at_least(Version::new(13, 0, 0))),
                    ),
                ],
                0,
            ),
        );
        let map = compile(&table, Version::new(9, 6, 1));
        let result = QueryResult::new(
            vec!["datname".into(), "commits".into(), "broken".into(), "future".into(), "extra".into()],
            vec![vec![text("postgres"), SqlValue::Int(10), text("n/a"), SqlValue::Int(1), text("abc")]],
        );

        let (metrics, errors) = convert_rows("pg_stat_things", &map["pg_stat_things"], &result);

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name(), "pg_stat_things_commits");
        assert_eq!(metrics[0].label("datname"), Some("postgres"));
        assert_eq!(metrics[0].label("state"), Some(""));
        assert_eq!(metrics[0].label("server"), Some("db:5432"));

        assert_eq!(errors.len(), 2);
        assert!(matches!(&errors[0], ConversionError::Unparseable { column, .. } if column == "broken"));
        assert!(matches!(&errors[1], ConversionError::UnknownColumn { column, .. } if column == "extra"));
    }

    #[test]
    fn test_unknown_numeric_column_is_untyped() {
        let mut table = MappingTable::new();
        table.insert("pg_custom".into(), namespace(vec![], 0));
        let map = compile(&table, Version::new(12, 0, 0));
        let result = QueryResult::new(vec!["extra".into()], vec![vec![SqlValue::Float(1.5)]]);

        let (metrics, errors) = convert_rows("pg_custom", &map["pg_custom"], &result);
        assert!(errors.is_empty());
        assert_eq!(metrics[0].name(), "pg_custom_extra");
        assert_eq!(metrics[0].desc.help, "Unknown metric from pg_custom");
        assert_eq!(
            metrics[0].value,
            MetricValue::Scalar {
                value_type: ValueType::Untyped,
                value: 1.5
            }
        );
    }

    fn fake_server(banner: &str) -> (Arc<FakeDatabase>, Server) {
        let db = FakeDatabase::new(banner);
        let server = Server::new(&ConnectionDescriptor::new("db", 5432), db.clone(), &BTreeMap::new());
        (db, server)
    }

    #[tokio::test]
    async fn test_disabled_namespace_emits_nothing() {
        let (db, server) = fake_server("PostgreSQL 9.3.0");
        let map = compile(&crate::mapping::builtin::BUILTIN_METRIC_MAPS, Version::new(9, 3, 0));
        let mut overrides = ResolvedOverrides::new();
        overrides.insert("pg_replication_slots".into(), String::new());

        let resolved = overrides::resolve(&overrides, "pg_replication_slots");
        let (metrics, errors) = scrape_namespace(&server, "pg_replication_slots", &map["pg_replication_slots"], resolved)
            .await
            .unwrap();
        assert!(metrics.is_empty());
        assert!(errors.is_empty());
        assert!(db.executed().is_empty());
    }

    #[tokio::test]
    async fn test_cached_namespace_is_not_requeried() {
        let (db, server) = fake_server("PostgreSQL 12.0");
        db.respond("SELECT * FROM pg_cached;", &["value"], vec![vec![SqlValue::Int(5)]]);

        let mut table = MappingTable::new();
        table.insert(
            "pg_cached".into(),
            namespace(vec![("value", ColumnMapping::new(ColumnUsage::Gauge, "v"))], 60),
        );
        let state = MappingState {
            version: Some(Version::new(12, 0, 0)),
            metric_map: compile(&table, Version::new(12, 0, 0)),
            query_overrides: ResolvedOverrides::new(),
        };

        let mut first = ScrapeReport::default();
        scrape_namespaces(&server, &state, &mut first).await;
        let mut second = ScrapeReport::default();
        scrape_namespaces(&server, &state, &mut second).await;

        assert_eq!(db.query_count("SELECT * FROM pg_cached;"), 1);
        assert_eq!(first.metrics, second.metrics);
        assert_eq!(second.metrics[0].as_f64(), Some(5.0));
    }

    #[tokio::test]
    async fn test_failing_namespace_is_isolated() {
        let (db, server) = fake_server("PostgreSQL 12.0");
        db.fail("SELECT * FROM pg_bad;", DbError::Columns("driver lost column metadata".into()));
        db.respond("SELECT * FROM pg_good;", &["value"], vec![vec![SqlValue::Int(1)]]);

        let mut table = MappingTable::new();
        for ns in ["pg_bad", "pg_good"] {
            table.insert(
                ns.into(),
                namespace(vec![("value", ColumnMapping::new(ColumnUsage::Gauge, "v"))], 0),
            );
        }
        let state = MappingState {
            version: Some(Version::new(12, 0, 0)),
            metric_map: compile(&table, Version::new(12, 0, 0)),
            query_overrides: ResolvedOverrides::new(),
        };

        let mut report = ScrapeReport::default();
        scrape_namespaces(&server, &state, &mut report).await;

        assert_eq!(report.metrics.len(), 1);
        assert_eq!(report.metrics[0].name(), "pg_good_value");
        assert_eq!(report.namespace_errors.len(), 1);
        assert!(matches!(
            &report.namespace_errors[0],
            QueryError::Introspection { namespace, .. } if namespace == "pg_bad"
        ));
        assert!(report.has_errors());
    }

    #[tokio::test]
    async fn test_master_only_skipped_on_replica() {
        let db = FakeDatabase::new("PostgreSQL 12.0");
        let mut descriptor = ConnectionDescriptor::new("replica", 5432);
        descriptor.master = false;
        let server = Server::new(&descriptor, db.clone(), &BTreeMap::new());

        let catalog = MappingCatalog::new(true, None, "pg").unwrap();
        server.refresh_mappings(&catalog, true).await.unwrap();

        let options = ScrapeOptions {
            metric_prefix: "pg".into(),
            disable_settings_metrics: false,
        };
        let report = scrape_server(&server, &options).await.unwrap();
        assert!(report.metrics.is_empty());
        assert!(!report.has_errors());
        assert_eq!(db.executed(), vec!["SELECT version();".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_settings_unit_aborts_server_scrape() {
        let (db, server) = fake_server("PostgreSQL 12.0");
        db.respond(
            settings::SETTINGS_QUERY,
            &["name", "setting", "unit", "short_desc", "vartype"],
            vec![vec![text("odd"), text("3"), text("furlongs"), text(""), text("integer")]],
        );
        let options = ScrapeOptions {
            metric_prefix: "pg".into(),
            disable_settings_metrics: false,
        };
        let err = scrape_server(&server, &options).await.unwrap_err();
        assert!(err.is_configuration_defect());
    }
}
