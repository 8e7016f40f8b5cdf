// ============================================================================
// PG EXPORTER - COMMAND LINE ENTRY POINT
// ============================================================================

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};

use pg_exporter::config::ExporterConfig;
use pg_exporter::db::PgConnector;
use pg_exporter::error::{ExporterError, ExporterResult};
use pg_exporter::logging::init_logging;
use pg_exporter::mapping::user::load_user_queries;
use pg_exporter::mapping::MappingCatalog;
use pg_exporter::{Exporter, ENGINE_FULL_NAME, ENGINE_VERSION, SHUTDOWN_GRACE_PERIOD_SECS};

// ============================================================================
// CLI
// ============================================================================

/// pg-exporter CLI
#[derive(Parser, Debug)]
#[command(
    name = "pg_exporter",
    author = "AIOps Team",
    version,
    about = "Version-aware PostgreSQL statistics exporter",
    long_about = "Polls PostgreSQL servers, maps their statistics views onto typed \
                  metrics according to the server version, and serves them over HTTP \
                  in the Prometheus text format."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pg_exporter.toml", env = "PG_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PG_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "PG_EXPORTER_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve metrics over HTTP
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse a user queries file and report its namespaces
    CheckQueries {
        /// Queries file (default: the configured one)
        file: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ExporterConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("\nParsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\nConfiguration Summary:");
            println!("  - Metric prefix: {}", config.exporter.metric_prefix);
            println!("  - Endpoints: {}", config.endpoints.len());
            for endpoint in &config.endpoints {
                println!("    - {} (master: {})", endpoint, endpoint.master);
            }
            println!("  - Default metrics: {}", !config.exporter.disable_default_metrics);
            println!("  - Settings metrics: {}", !config.exporter.disable_settings_metrics);
            if let Some(path) = &config.exporter.user_queries_path {
                println!("  - User queries: {}", path.display());
            }
            println!("  - Listening on: {}{}", config.http.listen_address, config.http.telemetry_path);

            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed");
            println!("Error: {}", e);
            Err(ExporterError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct QueriesSummary {
    path: PathBuf,
    hashsum: String,
    namespaces: Vec<NamespaceSummary>,
}

#[derive(Debug, Serialize)]
struct NamespaceSummary {
    name: String,
    columns: usize,
    master_only: bool,
    cache_seconds: u64,
}

fn handle_check_queries(path: &Path, json: bool) -> ExporterResult<()> {
    let queries = load_user_queries(path)?;
    // Same validation the exporter applies at startup
    MappingCatalog::new(false, Some(&queries), "")?;

    let summary = QueriesSummary {
        path: queries.path.clone(),
        hashsum: queries.hashsum.clone(),
        namespaces: queries
            .metric_maps
            .iter()
            .map(|(name, mapping)| NamespaceSummary {
                name: name.clone(),
                columns: mapping.columns.len(),
                master_only: mapping.master_only,
                cache_seconds: mapping.cache_seconds,
            })
            .collect(),
    };

    if json {
        let out = serde_json::to_string_pretty(&summary)
            .map_err(|e| ExporterError::Internal(format!("Failed to serialize summary: {}", e)))?;
        println!("{}", out);
        return Ok(());
    }

    println!("Queries file: {}", summary.path.display());
    println!("Hash: {}", summary.hashsum);
    for ns in &summary.namespaces {
        println!(
            "  - {} ({} columns, master_only: {}, cache: {}s)",
            ns.name, ns.columns, ns.master_only, ns.cache_seconds
        );
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  - Target: {}", std::env::consts::ARCH);
    println!("  - OS: {}", std::env::consts::OS);
}

// ============================================================================
// HTTP
// ============================================================================

async fn metrics_handler(State(exporter): State<Arc<Exporter>>) -> Response {
    match exporter.render().await {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(target: "pg_exporter::http", error = %e, "Collection failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("collection failed: {}\n", e)).into_response()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn run(config: ExporterConfig) -> AnyhowResult<()> {
    config.validate().context("Invalid configuration")?;

    let connector = Arc::new(PgConnector::new(
        config.pool.connect_timeout(),
        config.pool.statement_timeout(),
    ));
    let addr: SocketAddr = config
        .http
        .listen_address
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.http.listen_address))?;
    let path = config.http.telemetry_path.clone();

    let exporter = Arc::new(Exporter::new(config, connector)?);
    let app = Router::new()
        .route(&path, get(metrics_handler))
        .with_state(exporter.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(target: "pg_exporter::http", address = %addr, path = %path, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down, closing connections");
    if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS), exporter.shutdown())
        .await
        .is_err()
    {
        warn!("Connections did not close within the grace period");
    }
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        ExporterConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        ExporterConfig::from_env().context("Failed to load config from environment")?
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!("Config file not found at {}, using defaults and environment", cli.config.display());
    }

    match cli.command {
        Some(Commands::CheckQueries { file, json }) => {
            let path = file
                .or_else(|| config.exporter.user_queries_path.clone())
                .context("No queries file given and none configured")?;
            handle_check_queries(&path, json)?;
        }
        Some(Commands::Run) | None => {
            info!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            run(config).await?;
        }
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) | Some(Commands::Validate { .. }) => {}
    }

    Ok(())
}
