// ============================================================================
// RUNTIME SETTINGS
// ============================================================================
// Numeric and boolean `pg_settings` rows exported as gauges, with time units
// normalised to seconds and size units to bytes.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{QueryError, SettingsError};
use crate::mapping::metric_name;
use crate::metrics::{LabelValues, Metric, MetricDesc, ValueType};
use crate::server::Server;

pub const SETTINGS_QUERY: &str = "SELECT name, setting, COALESCE(unit, ''), short_desc, vartype \
     FROM pg_settings WHERE vartype IN ('bool', 'integer', 'real') AND name != 'sync_commit_cancel_wait';";

const SETTINGS_NAMESPACE: &str = "pg_settings";

/// One row of `pg_settings`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSetting {
    pub name: String,
    pub setting: String,
    pub unit: String,
    pub short_desc: String,
    pub vartype: String,
}

impl PgSetting {
    /// Build from a positional row: name, setting, unit, short_desc, vartype
    pub fn from_row(row: &[crate::db::SqlValue]) -> Option<Self> {
        match row {
            [name, setting, unit, short_desc, vartype, ..] => Some(Self {
                name: name.to_label(),
                setting: setting.to_label(),
                unit: unit.to_label(),
                short_desc: short_desc.to_label(),
                vartype: vartype.to_label(),
            }),
            _ => None,
        }
    }

    /// Value in base units plus the base unit name.
    ///
    /// `-1` conventionally means "disabled" and is passed through unscaled.
    pub fn normalise_unit(&self) -> Result<(f64, Option<&'static str>), SettingsError> {
        let value: f64 = self.setting.trim().parse().map_err(|e: std::num::ParseFloatError| {
            SettingsError::InvalidValue {
                name: self.name.clone(),
                value: self.setting.clone(),
                message: e.to_string(),
            }
        })?;

        let (unit, factor) = match self.unit.as_str() {
            "" => return Ok((value, None)),
            "ms" => ("seconds", 1.0 / 1000.0),
            "s" => ("seconds", 1.0),
            "min" => ("seconds", 60.0),
            "h" => ("seconds", 60.0 * 60.0),
            "d" => ("seconds", 60.0 * 60.0 * 24.0),
            "B" => ("bytes", 1.0),
            "kB" | "1kB" => ("bytes", 2f64.powi(10)),
            "2kB" => ("bytes", 2f64.powi(11)),
            "4kB" => ("bytes", 2f64.powi(12)),
            "8kB" => ("bytes", 2f64.powi(13)),
            "16kB" => ("bytes", 2f64.powi(14)),
            "32kB" => ("bytes", 2f64.powi(15)),
            "64kB" => ("bytes", 2f64.powi(16)),
            "MB" => ("bytes", 2f64.powi(20)),
            "16MB" => ("bytes", 2f64.powi(24)),
            "32MB" => ("bytes", 2f64.powi(25)),
            "64MB" => ("bytes", 2f64.powi(26)),
            "GB" => ("bytes", 2f64.powi(30)),
            "TB" => ("bytes", 2f64.powi(40)),
            other => {
                return Err(SettingsError::UnknownUnit {
                    name: self.name.clone(),
                    unit: other.to_string(),
                })
            }
        };

        if value == -1.0 {
            return Ok((value, Some(unit)));
        }
        Ok((value * factor, Some(unit)))
    }

    /// Gauge named `<prefix>_settings_<name>[_<unit>]`
    pub fn metric(&self, prefix: &str, labels: &BTreeMap<String, String>) -> Result<Metric, SettingsError> {
        let mut name = self.name.replace(['.', '-'], "_");
        let mut help = format!("Server Parameter: {}", self.name);

        let value = match self.vartype.as_str() {
            "bool" => {
                if self.setting == "on" {
                    1.0
                } else {
                    0.0
                }
            }
            "integer" | "real" => {
                let (value, unit) = self.normalise_unit()?;
                if let Some(unit) = unit {
                    name = format!("{}_{}", name, unit);
                    help = format!("{} [Units converted to {}.]", help, unit);
                }
                value
            }
            other => {
                return Err(SettingsError::UnsupportedVartype {
                    name: self.name.clone(),
                    vartype: other.to_string(),
                })
            }
        };

        let desc = MetricDesc::new(metric_name(prefix, "settings", &name), help, Vec::new(), labels.clone());
        Ok(Metric::scalar(Arc::new(desc), ValueType::Gauge, value, LabelValues::new()))
    }
}

/// Settings metrics and the rows that were skipped
#[derive(Debug, Default)]
pub struct SettingsScrape {
    pub metrics: Vec<Metric>,
    pub skipped: Vec<SettingsError>,
}

/// Read `pg_settings` from a server.
///
/// A failed query or an unknown unit is returned as `Err`; other bad rows
/// are skipped and reported in `SettingsScrape::skipped`.
pub async fn query_settings(server: &Server, prefix: &str) -> Result<SettingsScrape, SettingsError> {
    let result = server
        .query(SETTINGS_QUERY)
        .await
        .map_err(|e| QueryError::from_db(server.fingerprint(), SETTINGS_NAMESPACE, e))?;

    let mut scrape = SettingsScrape::default();
    for row in &result.rows {
        let Some(setting) = PgSetting::from_row(row) else {
            continue;
        };
        match setting.metric(prefix, server.labels()) {
            Ok(metric) => scrape.metrics.push(metric),
            Err(e) if e.is_configuration_defect() => return Err(e),
            Err(e) => {
                warn!(
                    target: "pg_exporter::settings",
                    server = %server.fingerprint(),
                    error = %e,
                    "Skipping runtime setting"
                );
                scrape.skipped.push(e);
            }
        }
    }

    debug!(
        target: "pg_exporter::settings",
        server = %server.fingerprint(),
        settings = scrape.metrics.len(),
        "Collected runtime settings"
    );
    Ok(scrape)
}
