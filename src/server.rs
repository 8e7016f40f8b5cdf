// ============================================================================
// SERVER HANDLE
// ============================================================================
// One connected PostgreSQL server: its database handle, server labels, the
// mapping state compiled for the last observed version, and its result cache.
// Mapping state sits behind an async RwLock so scrapes read concurrently and
// rebuilds are exclusive; the cache has its own lock.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::db::{ConnectionDescriptor, Database, QueryResult};
use crate::error::{ConnectionError, DbResult, QueryError};
use crate::mapping::{MappingCatalog, MappingState};
use crate::version::{parse_server_version, Version};
use crate::{LOWEST_SUPPORTED_VERSION, SERVER_LABEL};

pub const VERSION_QUERY: &str = "SELECT version();";

/// Version banner and the semantic version parsed from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub banner: String,
    pub version: Version,
}

#[derive(Debug)]
pub struct Server {
    fingerprint: String,
    db: Arc<dyn Database>,
    labels: BTreeMap<String, String>,
    master: AtomicBool,
    mappings: RwLock<MappingState>,
    cache: ResultCache,
}

impl Server {
    /// Wrap an open handle. `constant_labels` are added to the `server` label
    /// on every metric this server produces.
    pub fn new(
        descriptor: &ConnectionDescriptor,
        db: Arc<dyn Database>,
        constant_labels: &BTreeMap<String, String>,
    ) -> Self {
        let fingerprint = descriptor.fingerprint();
        let mut labels = constant_labels.clone();
        labels.insert(SERVER_LABEL.to_string(), fingerprint.clone());

        Self {
            fingerprint,
            db,
            labels,
            master: AtomicBool::new(descriptor.master),
            mappings: RwLock::new(MappingState::default()),
            cache: ResultCache::new(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::Relaxed)
    }

    pub fn set_master(&self, master: bool) {
        self.master.store(master, Ordering::Relaxed);
    }

    /// `server` plus constant labels
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub async fn query(&self, sql: &str) -> DbResult<QueryResult> {
        self.db.query(sql).await
    }

    /// Check the connection; a failed ping closes the handle.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        if let Err(source) = self.db.ping().await {
            self.db.close().await;
            return Err(ConnectionError::Ping {
                server: self.fingerprint.clone(),
                source,
            });
        }
        Ok(())
    }

    pub async fn close(&self) {
        debug!(target: "pg_exporter::server", server = %self.fingerprint, "Closing connection");
        self.db.close().await;
    }

    /// Read the live version banner
    pub async fn detect_version(&self) -> Result<VersionInfo, QueryError> {
        let version_err = |message: String| QueryError::Version {
            server: self.fingerprint.clone(),
            message,
        };

        let result = self.db.query(VERSION_QUERY).await.map_err(|e| version_err(e.to_string()))?;
        let banner = result
            .rows
            .first()
            .and_then(|row| row.first())
            .map(|v| v.to_label())
            .ok_or_else(|| version_err("empty result".into()))?;
        let version = parse_server_version(&banner).map_err(|e| version_err(e.to_string()))?;

        Ok(VersionInfo { banner, version })
    }

    /// Detect the version and rebuild maps and overrides when it differs
    /// from the recorded one (or nothing is recorded yet).
    ///
    /// `warn_unsupported` logs servers older than the lowest tested version.
    pub async fn refresh_mappings(
        &self,
        catalog: &MappingCatalog,
        warn_unsupported: bool,
    ) -> Result<VersionInfo, QueryError> {
        let info = self.detect_version().await?;

        if warn_unsupported && info.version < LOWEST_SUPPORTED_VERSION {
            warn!(
                target: "pg_exporter::server",
                server = %self.fingerprint,
                version = %info.version,
                min_version = %LOWEST_SUPPORTED_VERSION,
                "PostgreSQL version is lower than the lowest supported version"
            );
        }

        if self.mappings.read().await.version == Some(info.version) {
            return Ok(info);
        }

        let mut state = self.mappings.write().await;
        if state.version != Some(info.version) {
            info!(
                target: "pg_exporter::server",
                server = %self.fingerprint,
                from = ?state.version.map(|v| v.to_string()),
                to = %info.version,
                "Semantic version changed, rebuilding metric maps"
            );
            *state = catalog.compile(info.version, &self.labels);
        }
        Ok(info)
    }

    /// Shared view of the current mapping state
    pub async fn mappings(&self) -> RwLockReadGuard<'_, MappingState> {
        self.mappings.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::FakeDatabase;
    use crate::error::DbError;

    fn server(db: Arc<FakeDatabase>) -> Server {
        let mut constant = BTreeMap::new();
        constant.insert("env".to_string(), "test".to_string());
        Server::new(&ConnectionDescriptor::new("db", 5432), db, &constant)
    }

    #[test]
    fn test_labels_include_fingerprint() {
        let s = server(FakeDatabase::new("PostgreSQL 9.6.1 on x86_64"));
        assert_eq!(s.labels()["server"], "db:5432");
        assert_eq!(s.labels()["env"], "test");
        assert!(s.is_master());
    }

    #[tokio::test]
    async fn test_version_detection() {
        let s = server(FakeDatabase::new("PostgreSQL 9.6.1 on x86_64"));
        let info = s.detect_version().await.unwrap();
        assert_eq!(info.version, Version::new(9, 6, 1));
        assert_eq!(info.banner, "PostgreSQL 9.6.1 on x86_64");
    }

    #[tokio::test]
    async fn test_unparseable_banner_is_version_error() {
        let s = server(FakeDatabase::new("garbage"));
        assert!(matches!(s.detect_version().await, Err(QueryError::Version { .. })));
    }

    #[tokio::test]
    async fn test_mappings_rebuilt_only_on_version_change() {
        let db = FakeDatabase::new("PostgreSQL 9.6.1 on x86_64");
        let s = server(db.clone());
        let catalog = MappingCatalog::new(true, None, "pg").unwrap();

        s.refresh_mappings(&catalog, true).await.unwrap();
        {
            let state = s.mappings().await;
            assert_eq!(state.version, Some(Version::new(9, 6, 1)));
            assert!(state.metric_map["pg_stat_replication"].columns["pg_wal_lsn_diff"].discard);
        }

        db.set_banner("PostgreSQL 12.4 on x86_64");
        s.refresh_mappings(&catalog, true).await.unwrap();
        let state = s.mappings().await;
        assert_eq!(state.version, Some(Version::new(12, 4, 0)));
        assert!(!state.metric_map["pg_stat_replication"].columns["pg_wal_lsn_diff"].discard);
    }

    #[tokio::test]
    async fn test_failed_ping_closes() {
        let db = FakeDatabase::new("PostgreSQL 9.6.1 on x86_64");
        db.fail_next_pings(1);
        let s = server(db.clone());
        let err = s.ping().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Ping { source: DbError::Connect(_), .. }));
        assert!(db.is_closed());
    }
}
