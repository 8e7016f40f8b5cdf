// ============================================================================
// QUERY OVERRIDE RESOLVER
// ============================================================================
// Each namespace may carry version-ranged SQL. For a resolved server version
// the table collapses to one query text per namespace; the empty string marks
// a namespace whose overrides exist but none apply.
// ============================================================================

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::version::{Version, VersionRange};

/// SQL text valid for a range of server versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideQuery {
    pub versions: VersionRange,
    pub query: String,
}

impl OverrideQuery {
    pub fn new(versions: VersionRange, query: impl Into<String>) -> Self {
        Self {
            versions,
            query: query.into(),
        }
    }
}

/// Namespace → candidate queries
pub type OverrideTable = BTreeMap<String, Vec<OverrideQuery>>;

/// Namespace → resolved query text, `""` when disabled
pub type ResolvedOverrides = HashMap<String, String>;

/// Reject tables where two ranges of one namespace can match the same version.
pub fn validate_overrides(table: &OverrideTable) -> ConfigResult<()> {
    for (namespace, candidates) in table {
        for (i, first) in candidates.iter().enumerate() {
            for second in &candidates[i + 1..] {
                if first.versions.overlaps(&second.versions) {
                    return Err(ConfigError::OverlappingOverrides {
                        namespace: namespace.clone(),
                        first: first.versions.to_string(),
                        second: second.versions.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Collapse the table for one server version.
///
/// Every namespace in the table gets an entry. Namespaces where no range
/// matches map to the empty string.
pub fn build_query_overrides(version: &Version, table: &OverrideTable) -> ResolvedOverrides {
    table
        .iter()
        .map(|(namespace, candidates)| {
            let query = candidates
                .iter()
                .find(|c| c.versions.matches(version))
                .map(|c| c.query.clone())
                .unwrap_or_else(|| {
                    debug!(
                        target: "pg_exporter::overrides",
                        namespace = %namespace,
                        version = %version,
                        "No override matches version, namespace disabled"
                    );
                    String::new()
                });
            (namespace.clone(), query)
        })
        .collect()
}

/// Later tables replace whole namespaces of earlier ones.
pub fn merge_overrides(base: &OverrideTable, overlay: &OverrideTable) -> OverrideTable {
    let mut merged = base.clone();
    for (namespace, candidates) in overlay {
        if merged.insert(namespace.clone(), candidates.clone()).is_some() {
            debug!(
                target: "pg_exporter::overrides",
                namespace = %namespace,
                "User query replaces built-in override"
            );
        }
    }
    merged
}

// ----------------------------------------------------------------------------
// Resolution
// ----------------------------------------------------------------------------

/// Outcome of looking a namespace up in resolved overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedQuery<'a> {
    /// A version-appropriate override
    Override(&'a str),
    /// Overrides exist but none match this version
    Disabled,
    /// No overrides exist; the fallback query applies
    NotConfigured,
}

impl<'a> ResolvedQuery<'a> {
    /// SQL to execute, `None` when disabled
    pub fn sql(&self, namespace: &str) -> Option<Cow<'a, str>> {
        match self {
            ResolvedQuery::Override(text) => Some(Cow::Borrowed(*text)),
            ResolvedQuery::Disabled => None,
            ResolvedQuery::NotConfigured => Some(Cow::Owned(fallback_query(namespace))),
        }
    }
}

pub fn resolve<'a>(overrides: &'a ResolvedOverrides, namespace: &str) -> ResolvedQuery<'a> {
    match overrides.get(namespace) {
        Some(text) if text.is_empty() => ResolvedQuery::Disabled,
        Some(text) => ResolvedQuery::Override(text),
        None => ResolvedQuery::NotConfigured,
    }
}

pub fn fallback_query(namespace: &str) -> String {
    format!("SELECT * FROM {};", namespace)
}
