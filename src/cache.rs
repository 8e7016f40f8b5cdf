// ============================================================================
// RESULT CACHE
// ============================================================================
// Per-server, per-namespace replay of the last successful scrape. Entries are
// overwritten by the next successful scrape and never expire on their own.
// ============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::metrics::Metric;

/// Metrics captured by one namespace scrape
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub metrics: Vec<Metric>,
    pub captured_at: DateTime<Utc>,
}

impl CachedResult {
    /// Fresh while `now - captured_at <= cache_seconds`
    pub fn is_fresh(&self, cache_seconds: u64, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.captured_at);
        age.num_milliseconds() <= i64::try_from(cache_seconds).unwrap_or(i64::MAX).saturating_mul(1000)
    }
}

/// Whether to query or replay
#[derive(Debug, Clone)]
pub enum CacheDecision {
    Scrape,
    Replay(Vec<Metric>),
}

#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, CachedResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide for one namespace; `cache_seconds == 0` always scrapes.
    pub fn should_scrape(&self, namespace: &str, cache_seconds: u64, now: DateTime<Utc>) -> CacheDecision {
        if cache_seconds == 0 {
            return CacheDecision::Scrape;
        }
        match self.entries.lock().get(namespace) {
            Some(entry) if entry.is_fresh(cache_seconds, now) => CacheDecision::Replay(entry.metrics.clone()),
            _ => CacheDecision::Scrape,
        }
    }

    /// Record a successful scrape. No-op when caching is disabled.
    pub fn store(&self, namespace: &str, cache_seconds: u64, metrics: &[Metric], now: DateTime<Utc>) {
        if cache_seconds == 0 {
            return;
        }
        self.entries.lock().insert(
            namespace.to_string(),
            CachedResult {
                metrics: metrics.to_vec(),
                captured_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
