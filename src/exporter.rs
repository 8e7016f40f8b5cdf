// ============================================================================
// EXPORTER
// ============================================================================
// Drives one collection pass over every configured endpoint and owns the
// exporter's own status gauges. Passes are serialized so status gauges always
// describe a complete pass.
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use futures::future::BoxFuture;
use futures::FutureExt;
use prometheus::proto::MetricFamily;
use prometheus::{Counter, Gauge, GaugeVec, Opts, Registry};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::config::ExporterConfig;
use crate::db::{ConnectionDescriptor, Connector};
use crate::error::{ExporterResult, SettingsError};
use crate::logging::PerfTimer;
use crate::mapping::user::{content_hash, load_user_queries, UserQueries};
use crate::mapping::MappingCatalog;
use crate::metrics::{render_text, to_metric_families, Metric, MetricDesc, ValueType};
use crate::pool::ServerRegistry;
use crate::scrape::{self, ScrapeOptions};
use crate::server::{Server, VersionInfo};
use crate::{SERVER_LABEL, SLOW_SCRAPE_THRESHOLD_MS, STATIC_METRIC_NAME};

// ----------------------------------------------------------------------------
// Status Metrics
// ----------------------------------------------------------------------------

/// The exporter's own gauges, kept in a dedicated registry
pub struct StatusMetrics {
    registry: Registry,
    up: GaugeVec,
    last_scrape_error: Gauge,
    last_scrape_duration: Gauge,
    scrapes_total: Counter,
    user_queries_load_error: GaugeVec,
}

impl StatusMetrics {
    pub fn new(prefix: &str, const_labels: &BTreeMap<String, String>) -> ExporterResult<Self> {
        let const_labels: HashMap<String, String> = const_labels.clone().into_iter().collect();
        let name = |suffix: &str| prefixed(prefix, suffix);
        let opts = |name: &str, help: &str| Opts::new(name, help).const_labels(const_labels.clone());

        let up = GaugeVec::new(
            opts(&name("up"), "Whether the last scrape of the server was able to connect"),
            &[SERVER_LABEL],
        )?;
        let last_scrape_error = Gauge::with_opts(opts(
            &name("exporter_last_scrape_error"),
            "Whether the last scrape of metrics from PostgreSQL resulted in an error (1 for error, 0 for success)",
        ))?;
        let last_scrape_duration = Gauge::with_opts(opts(
            &name("exporter_last_scrape_duration_seconds"),
            "Duration of the last scrape of metrics from PostgreSQL",
        ))?;
        let scrapes_total = Counter::with_opts(opts(
            &name("exporter_scrapes_total"),
            "Total number of times PostgreSQL was scraped for metrics",
        ))?;
        let user_queries_load_error = GaugeVec::new(
            opts(
                &name("exporter_user_queries_load_error"),
                "Whether the user queries file was loaded and parsed successfully (1 for error, 0 for success)",
            ),
            &["filename", "hashsum"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(up.clone()))?;
        registry.register(Box::new(last_scrape_error.clone()))?;
        registry.register(Box::new(last_scrape_duration.clone()))?;
        registry.register(Box::new(scrapes_total.clone()))?;
        registry.register(Box::new(user_queries_load_error.clone()))?;

        Ok(Self {
            registry,
            up,
            last_scrape_error,
            last_scrape_duration,
            scrapes_total,
            user_queries_load_error,
        })
    }

    pub fn up(&self, server: &str) -> f64 {
        self.up.with_label_values(&[server]).get()
    }

    pub fn last_scrape_error(&self) -> f64 {
        self.last_scrape_error.get()
    }

    pub fn last_scrape_duration(&self) -> f64 {
        self.last_scrape_duration.get()
    }

    pub fn scrapes_total(&self) -> f64 {
        self.scrapes_total.get()
    }

    pub fn user_queries_load_error(&self, filename: &str, hashsum: &str) -> f64 {
        self.user_queries_load_error.with_label_values(&[filename, hashsum]).get()
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}

impl std::fmt::Debug for StatusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusMetrics")
            .field("last_scrape_error", &self.last_scrape_error.get())
            .field("scrapes_total", &self.scrapes_total.get())
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Exporter
// ----------------------------------------------------------------------------

/// Outcome of one endpoint within a pass
#[derive(Debug, Default)]
struct EndpointScrape {
    metrics: Vec<Metric>,
    had_errors: bool,
}

#[derive(Debug)]
pub struct Exporter {
    endpoints: Vec<ConnectionDescriptor>,
    catalog: MappingCatalog,
    registry: ServerRegistry,
    status: StatusMetrics,
    options: ScrapeOptions,
    disable_default_metrics: bool,
    max_concurrent_scrapes: usize,
    pass: Mutex<()>,
}

impl Exporter {
    /// Build an exporter from validated configuration.
    ///
    /// A user queries file that fails to load is reported through the
    /// load-error gauge and otherwise ignored.
    pub fn new(config: ExporterConfig, connector: Arc<dyn Connector>) -> ExporterResult<Self> {
        let scrape_config = &config.exporter;
        let status = StatusMetrics::new(&scrape_config.metric_prefix, &scrape_config.constant_labels)?;

        let user_queries = scrape_config
            .user_queries_path
            .as_ref()
            .and_then(|path| load_user_queries_reporting(path, &status));

        let catalog = MappingCatalog::new(
            !scrape_config.disable_default_metrics,
            user_queries.as_ref(),
            scrape_config.metric_prefix.clone(),
        )?;

        let registry = ServerRegistry::new(
            connector,
            config.pool.retry_policy(),
            scrape_config.constant_labels.clone(),
        );

        info!(
            target: "pg_exporter::exporter",
            endpoints = config.endpoints.len(),
            namespaces = catalog.namespaces().count(),
            default_metrics = !scrape_config.disable_default_metrics,
            settings_metrics = !scrape_config.disable_settings_metrics,
            "Exporter initialized"
        );

        Ok(Self {
            options: ScrapeOptions {
                metric_prefix: scrape_config.metric_prefix.clone(),
                disable_settings_metrics: scrape_config.disable_settings_metrics,
            },
            disable_default_metrics: scrape_config.disable_default_metrics,
            max_concurrent_scrapes: scrape_config.max_concurrent_scrapes.max(1),
            endpoints: config.endpoints,
            catalog,
            registry,
            status,
            pass: Mutex::new(()),
        })
    }

    pub fn status(&self) -> &StatusMetrics {
        &self.status
    }

    pub fn endpoints(&self) -> &[ConnectionDescriptor] {
        &self.endpoints
    }

    /// Run a collection pass over every endpoint.
    ///
    /// Unreachable endpoints and failing namespaces are reported through the
    /// status gauges. Only an unknown settings unit fails the pass.
    #[instrument(skip(self), target = "pg_exporter::exporter")]
    pub async fn collect(&self) -> ExporterResult<Vec<Metric>> {
        let _pass = self.pass.lock().await;
        let timer = PerfTimer::with_threshold("collect", SLOW_SCRAPE_THRESHOLD_MS);
        self.status.scrapes_total.inc();

        let scrapes: Vec<BoxFuture<'_, Result<EndpointScrape, SettingsError>>> = self
            .endpoints
            .iter()
            .map(|descriptor| self.scrape_endpoint(descriptor).boxed())
            .collect();
        let outcomes: Vec<Result<EndpointScrape, SettingsError>> = stream::iter(scrapes)
            .buffer_unordered(self.max_concurrent_scrapes)
            .collect()
            .await;

        let mut metrics = Vec::new();
        let mut had_errors = false;
        let mut fatal = None;
        for outcome in outcomes {
            match outcome {
                Ok(scrape) => {
                    had_errors |= scrape.had_errors;
                    metrics.extend(scrape.metrics);
                }
                Err(e) => {
                    had_errors = true;
                    fatal.get_or_insert(e);
                }
            }
        }

        self.status.last_scrape_duration.set(timer.stop());
        self.status.last_scrape_error.set(if had_errors { 1.0 } else { 0.0 });

        if let Some(e) = fatal {
            error!(target: "pg_exporter::exporter", error = %e, "Collection pass aborted");
            return Err(e.into());
        }
        Ok(metrics)
    }

    async fn scrape_endpoint(&self, descriptor: &ConnectionDescriptor) -> Result<EndpointScrape, SettingsError> {
        let fingerprint = descriptor.fingerprint();

        let server = match self.registry.acquire(descriptor).await {
            Ok(server) => server,
            Err(e) => {
                error!(
                    target: "pg_exporter::exporter",
                    server = %fingerprint,
                    error = %e,
                    "Error opening connection to database"
                );
                self.status.up.with_label_values(&[&fingerprint]).set(0.0);
                return Ok(EndpointScrape {
                    metrics: Vec::new(),
                    had_errors: true,
                });
            }
        };
        self.status.up.with_label_values(&[&fingerprint]).set(1.0);

        let mut scrape = EndpointScrape::default();
        match server.refresh_mappings(&self.catalog, !self.disable_default_metrics).await {
            Ok(info) => {
                if server.is_master() && !self.disable_default_metrics {
                    scrape.metrics.push(self.static_metric(&server, &info));
                }
            }
            Err(e) => {
                warn!(
                    target: "pg_exporter::exporter",
                    server = %fingerprint,
                    error = %e,
                    "Proceeding with outdated query maps, the server version could not be determined"
                );
                scrape.had_errors = true;
            }
        }

        let report = scrape::scrape_server(&server, &self.options).await?;
        scrape.had_errors |= report.has_errors();
        scrape.metrics.extend(report.metrics);
        Ok(scrape)
    }

    fn static_metric(&self, server: &Server, info: &VersionInfo) -> Metric {
        let desc = MetricDesc::new(
            prefixed(self.catalog.prefix(), STATIC_METRIC_NAME),
            "Version string as reported by postgres",
            vec!["short_version".to_string(), "version".to_string()],
            server.labels().clone(),
        );
        Metric::scalar(
            Arc::new(desc),
            ValueType::Gauge,
            1.0,
            [info.version.to_string(), info.banner.clone()].into_iter().collect(),
        )
    }

    /// Collection pass plus status gauges, grouped into families
    pub async fn gather(&self) -> ExporterResult<Vec<MetricFamily>> {
        let metrics = self.collect().await?;
        let mut families = to_metric_families(&metrics);
        families.extend(self.status.gather());
        families.sort_by(|a, b| a.get_name().cmp(b.get_name()));
        Ok(families)
    }

    /// Collection pass rendered in the text exposition format
    pub async fn render(&self) -> ExporterResult<String> {
        let families = self.gather().await?;
        Ok(render_text(&families)?)
    }

    /// Close every server connection
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        info!(target: "pg_exporter::exporter", "All connections closed");
    }
}

/// `<prefix>_<name>`, or `name` alone for an empty prefix
fn prefixed(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

fn load_user_queries_reporting(path: &std::path::Path, status: &StatusMetrics) -> Option<UserQueries> {
    let filename = path.display().to_string();
    match load_user_queries(path) {
        Ok(queries) => {
            status
                .user_queries_load_error
                .with_label_values(&[&filename, &queries.hashsum])
                .set(0.0);
            Some(queries)
        }
        Err(e) => {
            error!(
                target: "pg_exporter::exporter",
                path = %filename,
                error = %e,
                "Failed to reload user queries"
            );
            // Identifies the rejected revision
            let hashsum = std::fs::read(path).map(|bytes| content_hash(&bytes)).unwrap_or_default();
            status
                .user_queries_load_error
                .with_label_values(&[&filename, &hashsum])
                .set(1.0);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::{FakeConnector, FakeDatabase};
    use crate::db::SqlValue;
    use crate::settings::SETTINGS_QUERY;
    use std::io::Write;

    const QUERIES: &str = r#"
pg_custom:
  query: "SELECT 'app' AS name, 7 AS value"
  metrics:
    - name:
        usage: "LABEL"
        description: "Name"
    - value:
        usage: "GAUGE"
        description: "Value"
"#;

    fn queries_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(QUERIES.as_bytes()).unwrap();
        file
    }

    fn config(file: &tempfile::NamedTempFile, hosts: &[&str]) -> ExporterConfig {
        let mut config = ExporterConfig::default();
        config.exporter.disable_default_metrics = true;
        config.exporter.disable_settings_metrics = true;
        config.exporter.user_queries_path = Some(file.path().to_path_buf());
        config.pool.retry_backoff_ms = 0;
        config.endpoints = hosts.iter().map(|h| ConnectionDescriptor::new(*h, 5432)).collect();
        config
    }

    fn healthy_db() -> Arc<FakeDatabase> {
        let db = FakeDatabase::new("PostgreSQL 12.4 on x86_64");
        db.respond(
            "SELECT 'app' AS name, 7 AS value",
            &["name", "value"],
            vec![vec![SqlValue::Text("app".into()), SqlValue::Int(7)]],
        );
        db
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_does_not_stop_others() {
        let file = queries_file();
        let connector = FakeConnector::new();
        connector.register("good:5432", healthy_db());
        let exporter = Exporter::new(config(&file, &["good", "bad"]), connector).unwrap();

        let metrics = exporter.collect().await.unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name(), "pg_custom_value");
        assert_eq!(metrics[0].label("name"), Some("app"));
        assert_eq!(metrics[0].as_f64(), Some(7.0));

        let status = exporter.status();
        assert_eq!(status.up("good:5432"), 1.0);
        assert_eq!(status.up("bad:5432"), 0.0);
        assert_eq!(status.last_scrape_error(), 1.0);
        assert_eq!(status.scrapes_total(), 1.0);
    }

    #[tokio::test]
    async fn test_clean_pass_clears_error_gauge() {
        let file = queries_file();
        let connector = FakeConnector::new();
        connector.register("good:5432", healthy_db());
        let exporter = Exporter::new(config(&file, &["good"]), connector).unwrap();

        exporter.collect().await.unwrap();
        assert_eq!(exporter.status().last_scrape_error(), 0.0);
        let filename = file.path().display().to_string();
        assert_eq!(
            exporter
                .status()
                .user_queries_load_error(&filename, &content_hash(QUERIES.as_bytes())),
            0.0
        );
    }

    #[tokio::test]
    async fn test_user_queries_load_error_is_reported() {
        let file = queries_file();
        let mut config = config(&file, &[]);
        config.exporter.user_queries_path = Some("/nonexistent/queries.yaml".into());

        let exporter = Exporter::new(config, FakeConnector::new()).unwrap();
        assert_eq!(
            exporter.status().user_queries_load_error("/nonexistent/queries.yaml", ""),
            1.0
        );
        assert!(exporter.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collection_runs_on_spawned_task() {
        let file = queries_file();
        let connector = FakeConnector::new();
        connector.register("good:5432", healthy_db());
        let exporter = Arc::new(Exporter::new(config(&file, &["good", "bad"]), connector).unwrap());

        let collect = tokio::spawn({
            let exporter = exporter.clone();
            async move { exporter.collect().await.map(|metrics| metrics.len()) }
        });
        assert_eq!(collect.await.unwrap().unwrap(), 1);

        let render = tokio::spawn({
            let exporter = exporter.clone();
            async move { exporter.render().await }
        });
        assert!(render.await.unwrap().unwrap().contains("pg_custom_value"));
        assert_eq!(exporter.status().scrapes_total(), 2.0);
    }

    #[tokio::test]
    async fn test_unparseable_user_queries_report_their_hash() {
        let content = "pg_custom:\n  query: \"SELECT 1\"\n  metrics:\n    - value:\n        usage: \"SPEEDOMETER\"\n";
        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(content.as_bytes()).unwrap();

        let file = queries_file();
        let mut config = config(&file, &[]);
        config.exporter.user_queries_path = Some(broken.path().to_path_buf());

        let exporter = Exporter::new(config, FakeConnector::new()).unwrap();
        let filename = broken.path().display().to_string();
        assert_eq!(
            exporter
                .status()
                .user_queries_load_error(&filename, &content_hash(content.as_bytes())),
            1.0
        );
    }

    #[tokio::test]
    async fn test_empty_prefix_drops_the_separator() {
        let file = queries_file();
        let connector = FakeConnector::new();
        connector.register("good:5432", healthy_db());
        let mut config = config(&file, &["good"]);
        config.exporter.metric_prefix = String::new();
        config.exporter.disable_default_metrics = false;

        let exporter = Exporter::new(config, connector).unwrap();
        let text = exporter.render().await.unwrap();
        assert!(text.contains("\nstatic{"));
        assert!(text.contains("\nexporter_scrapes_total 1"));
    }

    #[tokio::test]
    async fn test_static_metric_for_master() {
        let file = queries_file();
        let connector = FakeConnector::new();
        connector.register("good:5432", healthy_db());
        let mut config = config(&file, &["good"]);
        config.exporter.disable_default_metrics = false;

        let exporter = Exporter::new(config, connector).unwrap();
        let metrics = exporter.collect().await.unwrap();
        let static_metric = metrics.iter().find(|m| m.name() == "pg_static").unwrap();
        assert_eq!(static_metric.label("short_version"), Some("12.4.0"));
        assert_eq!(static_metric.label("version"), Some("PostgreSQL 12.4 on x86_64"));
        assert_eq!(static_metric.label("server"), Some("good:5432"));
    }

    #[tokio::test]
    async fn test_unknown_settings_unit_fails_pass() {
        let file = queries_file();
        let db = healthy_db();
        db.respond(
            SETTINGS_QUERY,
            &["name", "setting", "unit", "short_desc", "vartype"],
            vec![["odd", "3", "furlongs", "", "integer"]
                .iter()
                .map(|s| SqlValue::Text(s.to_string()))
                .collect()],
        );
        let connector = FakeConnector::new();
        connector.register("good:5432", db);
        let mut config = config(&file, &["good"]);
        config.exporter.disable_settings_metrics = false;

        let exporter = Exporter::new(config, connector).unwrap();
        let err = exporter.collect().await.unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(exporter.status().last_scrape_error(), 1.0);
    }

    #[tokio::test]
    async fn test_render_and_shutdown() {
        let file = queries_file();
        let db = healthy_db();
        let connector = FakeConnector::new();
        connector.register("good:5432", db.clone());
        let exporter = Exporter::new(config(&file, &["good"]), connector).unwrap();

        let text = exporter.render().await.unwrap();
        assert!(text.contains(r#"pg_custom_value{name="app",server="good:5432"} 7"#));
        assert!(text.contains(r#"pg_up{server="good:5432"} 1"#));
        assert!(text.contains("pg_exporter_scrapes_total 1"));

        exporter.shutdown().await;
        assert!(db.is_closed());
    }
}
