//! User supplied namespaces.
//!
//! The queries file is YAML shaped like
//!
//! ```yaml
//! pg_postmaster:
//!   query: "SELECT pg_postmaster_start_time AS start_time_seconds FROM pg_postmaster_start_time()"
//!   master: true
//!   cache_seconds: 30
//!   metrics:
//!     - start_time_seconds:
//!         usage: "GAUGE"
//!         description: "Time at which postmaster started"
//! ```
//!
//! Each query applies to every server version. Version ranges and value
//! mappings are not read from the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use super::{ColumnMapping, ColumnUsage, MappingTable, NamespaceMapping};
use crate::error::{ConfigError, ConfigResult};
use crate::overrides::{OverrideQuery, OverrideTable};
use crate::version::VersionRange;

#[derive(Debug, Deserialize)]
struct RawNamespace {
    query: String,
    #[serde(default)]
    master: bool,
    #[serde(default)]
    cache_seconds: u64,
    #[serde(default)]
    metrics: Vec<BTreeMap<String, RawColumn>>,
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    usage: String,
    #[serde(default)]
    description: String,
}

/// A parsed user queries file
#[derive(Debug, Clone, Default)]
pub struct UserQueries {
    pub path: PathBuf,
    /// xxh3 of the file contents, lowercase hex
    pub hashsum: String,
    pub metric_maps: MappingTable,
    pub query_overrides: OverrideTable,
}

/// Read and parse a queries file
pub fn load_user_queries(path: impl AsRef<Path>) -> ConfigResult<UserQueries> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => ConfigError::parse(format!("{}: {}", path.display(), e)),
    })?;

    let (metric_maps, query_overrides) = parse_user_queries(&content)?;
    let hashsum = content_hash(content.as_bytes());

    info!(
        target: "pg_exporter::mapping",
        path = %path.display(),
        namespaces = metric_maps.len(),
        hashsum = %hashsum,
        "Loaded user queries"
    );

    Ok(UserQueries {
        path: path.to_path_buf(),
        hashsum,
        metric_maps,
        query_overrides,
    })
}

/// Parse queries YAML into column tables and overrides
pub fn parse_user_queries(content: &str) -> ConfigResult<(MappingTable, OverrideTable)> {
    let raw: BTreeMap<String, RawNamespace> = serde_yaml::from_str(content).map_err(ConfigError::parse)?;

    let mut metric_maps = MappingTable::new();
    let mut query_overrides = OverrideTable::new();

    for (namespace, ns) in raw {
        if ns.query.trim().is_empty() {
            return Err(ConfigError::missing_field(format!("{}.query", namespace)));
        }

        let mut columns = BTreeMap::new();
        for entry in ns.metrics {
            for (column, raw_column) in entry {
                let usage = ColumnUsage::from_str(&raw_column.usage)?;
                columns.insert(column, ColumnMapping::new(usage, raw_column.description));
            }
        }

        debug!(
            target: "pg_exporter::mapping",
            namespace = %namespace,
            columns = columns.len(),
            master_only = ns.master,
            cache_seconds = ns.cache_seconds,
            "Parsed user namespace"
        );

        query_overrides.insert(
            namespace.clone(),
            vec![OverrideQuery::new(VersionRange::any(), ns.query)],
        );
        metric_maps.insert(
            namespace,
            NamespaceMapping {
                columns,
                master_only: ns.master,
                cache_seconds: ns.cache_seconds,
            },
        );
    }

    Ok((metric_maps, query_overrides))
}

/// Hash reported alongside the load-error status metric
pub fn content_hash(content: &[u8]) -> String {
    format!("{:016x}", xxh3_64(content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const QUERIES: &str = r#"
pg_postmaster:
  query: "SELECT pg_postmaster_start_time AS start_time_seconds FROM pg_postmaster_start_time()"
  master: true
  cache_seconds: 30
  metrics:
    - start_time_seconds:
        usage: "GAUGE"
        description: "Time at which postmaster started"

pg_stat_user_tables:
  query: "SELECT schemaname, relname, seq_scan FROM pg_stat_user_tables"
  metrics:
    - schemaname:
        usage: "LABEL"
        description: "Name of the schema"
    - relname:
        usage: "LABEL"
        description: "Name of the table"
    - seq_scan:
        usage: "COUNTER"
        description: "Sequential scans"
        metric_mapping: {}
"#;

    #[test]
    fn test_parse_queries_file() {
        let (maps, overrides) = parse_user_queries(QUERIES).unwrap();
        assert_eq!(maps.len(), 2);

        let postmaster = &maps["pg_postmaster"];
        assert!(postmaster.master_only);
        assert_eq!(postmaster.cache_seconds, 30);
        assert_eq!(postmaster.columns["start_time_seconds"].usage, ColumnUsage::Gauge);

        let tables = &maps["pg_stat_user_tables"];
        assert!(!tables.master_only);
        assert_eq!(tables.columns["relname"].usage, ColumnUsage::Label);
        assert!(tables.columns["seq_scan"].value_mapping.is_none());

        assert_eq!(overrides["pg_postmaster"].len(), 1);
        assert_eq!(overrides["pg_postmaster"][0].versions, VersionRange::any());
    }

    #[test]
    fn test_unknown_usage_is_rejected() {
        let yaml = r#"
pg_custom:
  query: "SELECT 1 AS one"
  metrics:
    - one:
        usage: "SUMMARY"
"#;
        let err = parse_user_queries(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownUsage { ref usage } if usage == "SUMMARY"));
    }

    #[test]
    fn test_missing_query_is_rejected() {
        assert!(matches!(
            parse_user_queries("pg_custom:\n  master: true\n"),
            Err(ConfigError::ParseError { .. })
        ));
        assert!(matches!(
            parse_user_queries("pg_custom:\n  query: \"\"\n"),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_load_reports_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(QUERIES.as_bytes()).unwrap();

        let loaded = load_user_queries(file.path()).unwrap();
        assert_eq!(loaded.hashsum, content_hash(QUERIES.as_bytes()));
        assert_eq!(loaded.hashsum.len(), 16);
        assert_eq!(loaded.path, file.path());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_user_queries("/nonexistent/queries.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
