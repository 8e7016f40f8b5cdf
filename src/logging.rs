// ============================================================================
// LOGGING & TRACING
// ============================================================================

use std::time::Instant;

use tracing::{trace, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ExporterError, ExporterResult};

/// Initialize the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format.as_str() {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
        "compact" => registry
            .with(fmt::layer().compact().with_ansi(config.colors).with_target(true))
            .try_init(),
        _ => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            )
            .try_init(),
    };

    result.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))
}

// ----------------------------------------------------------------------------
// Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it runs over a threshold
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Stop the timer and log if above threshold; returns elapsed seconds
    pub fn stop(self) -> f64 {
        let elapsed = self.elapsed_secs();
        let elapsed_ms = (elapsed * 1000.0) as u64;

        if let Some(threshold) = self.threshold_ms {
            if elapsed_ms > threshold {
                warn!(
                    target: "pg_exporter::perf",
                    operation = self.name,
                    elapsed_ms,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        trace!(
            target: "pg_exporter::perf",
            operation = self.name,
            elapsed_ms,
            "Operation completed"
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_reports_elapsed() {
        let timer = PerfTimer::with_threshold("test", 10_000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let elapsed = timer.stop();
        assert!(elapsed >= 0.005);
        assert!(PerfTimer::new("noop").stop() >= 0.0);
    }
}
