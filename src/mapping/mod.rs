// ============================================================================
// METRIC MAP BUILDER
// ============================================================================
// Declarative column tables (built-in or user supplied) are compiled, for one
// resolved server version, into executable per-column mappings. The compiled
// map and the resolved query overrides are always produced together from the
// same version by `MappingCatalog::compile`.
// ============================================================================

pub mod builtin;
pub mod user;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::db::SqlValue;
use crate::error::{ConfigError, ConfigResult};
use crate::metrics::{MetricDesc, ValueType};
use crate::overrides::{self, OverrideTable, ResolvedOverrides};
use crate::version::{Version, VersionRange};

use self::user::UserQueries;

// ----------------------------------------------------------------------------
// Declarative Tables
// ----------------------------------------------------------------------------

/// How a result column is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnUsage {
    /// Ignore this column
    Discard,
    /// Use this column as a label
    Label,
    /// Use this column as a counter
    Counter,
    /// Use this column as a gauge
    Gauge,
    /// Map text values onto numbers through a lookup table
    MappedMetric,
    /// Parse a duration string into milliseconds
    Duration,
    /// Bucket boundaries of a histogram spread over four columns
    Histogram,
}

impl FromStr for ColumnUsage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DISCARD" => Ok(ColumnUsage::Discard),
            "LABEL" => Ok(ColumnUsage::Label),
            "COUNTER" => Ok(ColumnUsage::Counter),
            "GAUGE" => Ok(ColumnUsage::Gauge),
            "MAPPEDMETRIC" => Ok(ColumnUsage::MappedMetric),
            "DURATION" => Ok(ColumnUsage::Duration),
            "HISTOGRAM" => Ok(ColumnUsage::Histogram),
            _ => Err(ConfigError::UnknownUsage { usage: s.to_string() }),
        }
    }
}

impl fmt::Display for ColumnUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnUsage::Discard => "DISCARD",
            ColumnUsage::Label => "LABEL",
            ColumnUsage::Counter => "COUNTER",
            ColumnUsage::Gauge => "GAUGE",
            ColumnUsage::MappedMetric => "MAPPEDMETRIC",
            ColumnUsage::Duration => "DURATION",
            ColumnUsage::Histogram => "HISTOGRAM",
        };
        f.write_str(s)
    }
}

/// Declared handling of one result column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    pub usage: ColumnUsage,
    pub description: String,
    /// Text → number lookup for `MappedMetric`
    pub value_mapping: Option<BTreeMap<String, f64>>,
    /// Versions the column exists on; `None` means all
    pub supported_versions: Option<VersionRange>,
}

impl ColumnMapping {
    pub fn new(usage: ColumnUsage, description: impl Into<String>) -> Self {
        Self {
            usage,
            description: description.into(),
            value_mapping: None,
            supported_versions: None,
        }
    }

    pub fn versions(mut self, range: VersionRange) -> Self {
        self.supported_versions = Some(range);
        self
    }

    pub fn value_mapping(mut self, mapping: BTreeMap<String, f64>) -> Self {
        self.value_mapping = Some(mapping);
        self
    }

    fn is_supported(&self, version: &Version) -> bool {
        self.supported_versions
            .as_ref()
            .map_or(true, |range| range.matches(version))
    }
}

/// Columns of one namespace plus scheduling flags
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NamespaceMapping {
    pub columns: BTreeMap<String, ColumnMapping>,
    /// Only scraped on master servers
    pub master_only: bool,
    /// Result reuse window; 0 disables caching
    pub cache_seconds: u64,
}

/// Namespace → declared columns
pub type MappingTable = BTreeMap<String, NamespaceMapping>;

/// Later tables replace whole namespaces of earlier ones.
pub fn merge_tables(base: &MappingTable, overlay: &MappingTable) -> MappingTable {
    let mut merged = base.clone();
    for (namespace, mapping) in overlay {
        if merged.insert(namespace.clone(), mapping.clone()).is_some() {
            debug!(
                target: "pg_exporter::mapping",
                namespace = %namespace,
                "User query mapping replaces built-in namespace"
            );
        }
    }
    merged
}

// ----------------------------------------------------------------------------
// Compiled Mappings
// ----------------------------------------------------------------------------

/// Conversion applied to a column value
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    /// Column is consumed but never emitted; reads as NaN
    Discard,
    /// Numeric reading, NULL as NaN
    Numeric,
    /// Text lookup; unknown text fails
    Mapped(BTreeMap<String, f64>),
    /// Duration text to milliseconds; `-1` means unset
    DurationMillis,
    /// Bucket boundaries; handled together with the sub-columns
    Histogram,
}

/// Result of converting one value
#[derive(Debug, Clone, PartialEq)]
pub enum Converted {
    Value(f64),
    /// Nothing to emit and nothing wrong
    Skip,
    /// The value could not be converted; carries its rendering
    Failed(String),
}

impl Conversion {
    pub fn convert(&self, value: &SqlValue) -> Converted {
        match self {
            Conversion::Discard => Converted::Value(f64::NAN),
            Conversion::Numeric => match value.to_f64() {
                Some(v) => Converted::Value(v),
                None => Converted::Failed(value.to_string()),
            },
            Conversion::Mapped(lookup) => value
                .as_text()
                .and_then(|text| lookup.get(text))
                .map(|v| Converted::Value(*v))
                .unwrap_or_else(|| Converted::Failed(value.to_string())),
            Conversion::DurationMillis => {
                let text = value.to_label();
                if text == "-1" {
                    return Converted::Skip;
                }
                match humantime::parse_duration(&text) {
                    Ok(d) => Converted::Value(d.as_secs_f64() * 1000.0),
                    Err(_) => Converted::Failed(text),
                }
            }
            Conversion::Histogram => Converted::Failed(value.to_string()),
        }
    }
}

/// Executable mapping of one column for a resolved version
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    pub discard: bool,
    pub histogram: bool,
    pub value_type: ValueType,
    pub desc: Option<Arc<MetricDesc>>,
    pub conversion: Conversion,
}

impl CompiledMapping {
    fn discarded() -> Self {
        Self {
            discard: true,
            histogram: false,
            value_type: ValueType::Untyped,
            desc: None,
            conversion: Conversion::Discard,
        }
    }
}

/// Compiled namespace
#[derive(Debug, Clone)]
pub struct MetricMapNamespace {
    /// Label columns, sorted by name
    pub labels: Vec<String>,
    pub columns: HashMap<String, CompiledMapping>,
    pub master_only: bool,
    pub cache_seconds: u64,
    prefix: String,
    const_labels: BTreeMap<String, String>,
}

impl MetricMapNamespace {
    /// Descriptor for a column the map does not know
    pub fn untyped_desc(&self, namespace: &str, column: &str) -> Arc<MetricDesc> {
        Arc::new(MetricDesc::new(
            metric_name(&self.prefix, namespace, column),
            format!("Unknown metric from {}", namespace),
            self.labels.clone(),
            self.const_labels.clone(),
        ))
    }
}

/// Resolved version → compiled namespaces
pub type MetricMap = HashMap<String, MetricMapNamespace>;

/// Exported name of a column.
///
/// Namespaces already carrying the prefix (`pg_stat_database`) are not
/// prefixed twice; an empty prefix leaves `<namespace>_<column>`.
pub fn metric_name(prefix: &str, namespace: &str, column: &str) -> String {
    let already_prefixed = namespace
        .strip_prefix(prefix)
        .map_or(false, |rest| rest.starts_with('_'));
    if prefix.is_empty() || already_prefixed {
        format!("{}_{}", namespace, column)
    } else {
        format!("{}_{}_{}", prefix, namespace, column)
    }
}

/// Compile every namespace of `table` for `version`.
///
/// `const_labels` is attached to every descriptor, normally the `server`
/// label plus configured constant labels.
pub fn build_metric_map(
    version: &Version,
    table: &MappingTable,
    prefix: &str,
    const_labels: &BTreeMap<String, String>,
) -> MetricMap {
    table
        .iter()
        .map(|(namespace, mapping)| {
            let compiled = compile_namespace(version, namespace, mapping, prefix, const_labels);
            (namespace.clone(), compiled)
        })
        .collect()
}

fn compile_namespace(
    version: &Version,
    namespace: &str,
    mapping: &NamespaceMapping,
    prefix: &str,
    const_labels: &BTreeMap<String, String>,
) -> MetricMapNamespace {
    let labels: Vec<String> = mapping
        .columns
        .iter()
        .filter(|(_, c)| c.usage == ColumnUsage::Label && c.is_supported(version))
        .map(|(name, _)| name.clone())
        .collect();

    let desc = |name: String, help: &str| {
        Some(Arc::new(MetricDesc::new(name, help, labels.clone(), const_labels.clone())))
    };

    let mut columns = HashMap::with_capacity(mapping.columns.len());
    for (column, cm) in &mapping.columns {
        if !cm.is_supported(version) {
            trace!(
                target: "pg_exporter::mapping",
                namespace = %namespace,
                column = %column,
                version = %version,
                "Column not supported on this version"
            );
            if cm.usage == ColumnUsage::Histogram {
                for suffix in HISTOGRAM_SUFFIXES {
                    columns.insert(format!("{}{}", column, suffix), CompiledMapping::discarded());
                }
            }
            columns.insert(column.clone(), CompiledMapping::discarded());
            continue;
        }

        let compiled = match cm.usage {
            ColumnUsage::Discard | ColumnUsage::Label => CompiledMapping::discarded(),
            ColumnUsage::Counter | ColumnUsage::Gauge => {
                let value_type = if cm.usage == ColumnUsage::Counter {
                    ValueType::Counter
                } else {
                    ValueType::Gauge
                };
                CompiledMapping {
                    discard: false,
                    histogram: false,
                    value_type,
                    desc: desc(metric_name(prefix, namespace, column), &cm.description),
                    conversion: Conversion::Numeric,
                }
            }
            ColumnUsage::MappedMetric => CompiledMapping {
                discard: false,
                histogram: false,
                value_type: ValueType::Gauge,
                desc: desc(metric_name(prefix, namespace, column), &cm.description),
                conversion: Conversion::Mapped(cm.value_mapping.clone().unwrap_or_default()),
            },
            ColumnUsage::Duration => CompiledMapping {
                discard: false,
                histogram: false,
                value_type: ValueType::Gauge,
                desc: desc(
                    metric_name(prefix, namespace, &format!("{}_milliseconds", column)),
                    &cm.description,
                ),
                conversion: Conversion::DurationMillis,
            },
            ColumnUsage::Histogram => {
                for suffix in HISTOGRAM_SUFFIXES {
                    columns.insert(format!("{}{}", column, suffix), CompiledMapping::discarded());
                }
                CompiledMapping {
                    discard: false,
                    histogram: true,
                    value_type: ValueType::Untyped,
                    desc: desc(metric_name(prefix, namespace, column), &cm.description),
                    conversion: Conversion::Histogram,
                }
            }
        };
        columns.insert(column.clone(), compiled);
    }

    MetricMapNamespace {
        labels,
        columns,
        master_only: mapping.master_only,
        cache_seconds: mapping.cache_seconds,
        prefix: prefix.to_string(),
        const_labels: const_labels.clone(),
    }
}

/// Sub-columns feeding a histogram named after its base column
pub const HISTOGRAM_SUFFIXES: [&str; 3] = ["_bucket", "_sum", "_count"];

// ----------------------------------------------------------------------------
// Catalog
// ----------------------------------------------------------------------------

/// Mapping and override state compiled for one server version
#[derive(Debug, Clone, Default)]
pub struct MappingState {
    /// `None` until the first successful version check
    pub version: Option<Version>,
    pub metric_map: MetricMap,
    pub query_overrides: ResolvedOverrides,
}

/// The declarative tables in effect for the process.
#[derive(Debug, Clone)]
pub struct MappingCatalog {
    metric_maps: MappingTable,
    query_overrides: OverrideTable,
    prefix: String,
}

impl MappingCatalog {
    /// Combine the built-in tables (unless disabled) with user queries.
    ///
    /// Fails if the combined override table has overlapping ranges.
    pub fn new(include_builtin: bool, user: Option<&UserQueries>, prefix: impl Into<String>) -> ConfigResult<Self> {
        let (mut metric_maps, mut query_overrides) = if include_builtin {
            (builtin::BUILTIN_METRIC_MAPS.clone(), builtin::BUILTIN_QUERY_OVERRIDES.clone())
        } else {
            (MappingTable::new(), OverrideTable::new())
        };

        if let Some(user) = user {
            metric_maps = merge_tables(&metric_maps, &user.metric_maps);
            query_overrides = overrides::merge_overrides(&query_overrides, &user.query_overrides);
        }

        overrides::validate_overrides(&query_overrides)?;

        Ok(Self {
            metric_maps,
            query_overrides,
            prefix: prefix.into(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.metric_maps.keys().map(String::as_str)
    }

    /// Compile metric map and overrides for `version` in one step
    pub fn compile(&self, version: Version, const_labels: &BTreeMap<String, String>) -> MappingState {
        MappingState {
            version: Some(version),
            metric_map: build_metric_map(&version, &self.metric_maps, &self.prefix, const_labels),
            query_overrides: overrides::build_query_overrides(&version, &self.query_overrides),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels() -> BTreeMap<String, String> {
        let mut l = BTreeMap::new();
        l.insert("server".to_string(), "db:5432".to_string());
        l
    }

    fn table() -> MappingTable {
        let mut columns = BTreeMap::new();
        columns.insert("datname".into(), ColumnMapping::new(ColumnUsage::Label, "db"));
        columns.insert("mode".into(), ColumnMapping::new(ColumnUsage::Label, "mode"));
        columns.insert("count".into(), ColumnMapping::new(ColumnUsage::Gauge, "locks"));
        columns.insert(
            "new_col".into(),
            ColumnMapping::new(ColumnUsage::Counter, "only on 10+")
                .versions(VersionRange::at_least(Version::new(10, 0, 0))),
        );
        columns.insert("timeout".into(), ColumnMapping::new(ColumnUsage::Duration, "timeout"));
        columns.insert("latency".into(), ColumnMapping::new(ColumnUsage::Histogram, "latency"));

        let mut t = MappingTable::new();
        t.insert(
            "pg_test".into(),
            NamespaceMapping {
                columns,
                master_only: true,
                cache_seconds: 0,
            },
        );
        t
    }

    #[test]
    fn test_usage_parsing() {
        assert_eq!("gauge".parse::<ColumnUsage>().unwrap(), ColumnUsage::Gauge);
        assert_eq!("MAPPEDMETRIC".parse::<ColumnUsage>().unwrap(), ColumnUsage::MappedMetric);
        assert!(matches!(
            "SUMMARY".parse::<ColumnUsage>(),
            Err(ConfigError::UnknownUsage { .. })
        ));
    }

    #[test]
    fn test_labels_are_sorted() {
        let map = build_metric_map(&Version::new(9, 6, 1), &table(), "pg", &labels());
        assert_eq!(map["pg_test"].labels, vec!["datname".to_string(), "mode".to_string()]);
    }

    #[test]
    fn test_unsupported_column_is_discarded() {
        let map = build_metric_map(&Version::new(9, 6, 1), &table(), "pg", &labels());
        let col = &map["pg_test"].columns["new_col"];
        assert!(col.discard);
        assert!(col.desc.is_none());
        assert!(matches!(col.conversion.convert(&SqlValue::Int(3)), Converted::Value(v) if v.is_nan()));

        let map = build_metric_map(&Version::new(10, 1, 0), &table(), "pg", &labels());
        assert!(!map["pg_test"].columns["new_col"].discard);
    }

    #[test]
    fn test_histogram_expands_to_four_entries() {
        let map = build_metric_map(&Version::new(9, 6, 1), &table(), "pg", &labels());
        let ns = &map["pg_test"];
        assert!(ns.columns["latency"].histogram);
        for suffix in HISTOGRAM_SUFFIXES {
            assert!(ns.columns[&format!("latency{}", suffix)].discard);
        }
    }

    #[test]
    fn test_metric_names() {
        let map = build_metric_map(&Version::new(9, 6, 1), &table(), "pg", &labels());
        let ns = &map["pg_test"];
        let name = |c: &str| ns.columns[c].desc.as_ref().unwrap().name.clone();
        assert_eq!(name("count"), "pg_test_count");
        assert_eq!(name("timeout"), "pg_test_timeout_milliseconds");
        assert_eq!(metric_name("pg", "postmaster", "start_time"), "pg_postmaster_start_time");
        assert_eq!(metric_name("pg", "pgbouncer", "x"), "pg_pgbouncer_x");
        assert_eq!(metric_name("", "custom", "x"), "custom_x");
        assert_eq!(ns.untyped_desc("pg_test", "extra").help, "Unknown metric from pg_test");
    }

    #[test]
    fn test_conversions() {
        assert!(matches!(Conversion::Numeric.convert(&SqlValue::Null), Converted::Value(v) if v.is_nan()));
        assert!(matches!(
            Conversion::Numeric.convert(&SqlValue::Text("abc".into())),
            Converted::Failed(_)
        ));

        let mut lookup = BTreeMap::new();
        lookup.insert("streaming".to_string(), 1.0);
        let mapped = Conversion::Mapped(lookup);
        assert_eq!(mapped.convert(&SqlValue::Text("streaming".into())), Converted::Value(1.0));
        assert!(matches!(mapped.convert(&SqlValue::Text("catchup".into())), Converted::Failed(_)));

        let d = Conversion::DurationMillis;
        assert_eq!(d.convert(&SqlValue::Text("1h30m".into())), Converted::Value(5_400_000.0));
        assert_eq!(d.convert(&SqlValue::Text("-1".into())), Converted::Skip);
        assert!(matches!(d.convert(&SqlValue::Text("soon".into())), Converted::Failed(_)));
    }

    #[test]
    fn test_catalog_compiles_maps_and_overrides_together() {
        let catalog = MappingCatalog::new(true, None, "pg").unwrap();
        let state = catalog.compile(Version::new(9, 3, 0), &labels());
        assert_eq!(state.version, Some(Version::new(9, 3, 0)));
        assert!(state.metric_map.contains_key("pg_replication_slots"));
        assert_eq!(state.query_overrides["pg_replication_slots"], "");

        let catalog = MappingCatalog::new(false, None, "pg").unwrap();
        assert_eq!(catalog.namespaces().count(), 0);
    }
}
