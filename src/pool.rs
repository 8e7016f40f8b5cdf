// ============================================================================
// CONNECTION POOL (SERVER REGISTRY)
// ============================================================================
// Fingerprint → live `Server`. Servers are created lazily on first acquire,
// health checked on every acquire and evicted when the check fails. The
// registry keeps ownership; callers receive shared handles.
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::{ConnectionDescriptor, Connector};
use crate::error::{ConnectionError, DbError};
use crate::server::Server;
use crate::{DEFAULT_CONNECT_RETRY_ATTEMPTS, DEFAULT_CONNECT_RETRY_BACKOFF};

/// Attempt budget and linear backoff for `ServerRegistry::acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Attempt `n` is followed by a sleep of `n * backoff_step`
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_CONNECT_RETRY_ATTEMPTS,
            backoff_step: DEFAULT_CONNECT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

#[derive(Debug)]
pub struct ServerRegistry {
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
    constant_labels: BTreeMap<String, String>,
    servers: Mutex<HashMap<String, Arc<Server>>>,
}

impl ServerRegistry {
    pub fn new(connector: Arc<dyn Connector>, retry: RetryPolicy, constant_labels: BTreeMap<String, String>) -> Self {
        Self {
            connector,
            retry,
            constant_labels,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Return a healthy server for `descriptor`, opening one if needed.
    ///
    /// The registry lock is held for the whole sequence, backoff included,
    /// so concurrent acquires for any endpoint wait on a reconnecting one.
    /// No sleep follows the final attempt.
    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<Server>, ConnectionError> {
        let fingerprint = descriptor.fingerprint();
        let mut servers = self.servers.lock().await;
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            let server = match servers.get(&fingerprint) {
                Some(server) => server.clone(),
                None => match self.connector.connect(descriptor).await {
                    Ok(db) => {
                        info!(
                            target: "pg_exporter::pool",
                            server = %fingerprint,
                            "Established new database connection"
                        );
                        let server = Arc::new(Server::new(descriptor, db, &self.constant_labels));
                        servers.insert(fingerprint.clone(), server.clone());
                        server
                    }
                    Err(source) => {
                        warn!(
                            target: "pg_exporter::pool",
                            server = %fingerprint,
                            attempt,
                            error = %source,
                            "Error opening connection to database"
                        );
                        last_error = Some(ConnectionError::Open {
                            server: fingerprint.clone(),
                            source,
                        });
                        self.pause(attempt).await;
                        continue;
                    }
                },
            };

            match server.ping().await {
                Ok(()) => {
                    server.set_master(descriptor.master);
                    return Ok(server);
                }
                Err(e) => {
                    servers.remove(&fingerprint);
                    warn!(
                        target: "pg_exporter::pool",
                        server = %fingerprint,
                        attempt,
                        error = %e,
                        "Health check failed, evicted server"
                    );
                    last_error = Some(e);
                    self.pause(attempt).await;
                }
            }
        }

        Err(match last_error {
            Some(last) => ConnectionError::RetriesExhausted {
                server: fingerprint,
                attempts: self.retry.max_attempts,
                last: Box::new(last),
            },
            None => ConnectionError::Open {
                server: fingerprint,
                source: DbError::Connect("no connection attempts allowed".into()),
            },
        })
    }

    async fn pause(&self, attempt: u32) {
        if attempt < self.retry.max_attempts {
            tokio::time::sleep(self.retry.backoff(attempt)).await;
        }
    }

    /// Drop and close a server. Returns whether it was registered.
    pub async fn evict(&self, fingerprint: &str) -> bool {
        let removed = self.servers.lock().await.remove(fingerprint);
        match removed {
            Some(server) => {
                server.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every server; used at shutdown
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Server>> = self.servers.lock().await.drain().map(|(_, s)| s).collect();
        for server in &drained {
            server.close().await;
        }
        debug!(target: "pg_exporter::pool", closed = drained.len(), "Closed all servers");
    }

    pub async fn len(&self) -> usize {
        self.servers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fake::{FakeConnector, FakeDatabase};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::ZERO,
        }
    }

    fn setup() -> (Arc<FakeConnector>, Arc<FakeDatabase>, ServerRegistry) {
        let connector = FakeConnector::new();
        let db = FakeDatabase::new("PostgreSQL 9.6.1 on x86_64");
        connector.register("db:5432", db.clone());
        let registry = ServerRegistry::new(connector.clone(), fast_retry(), BTreeMap::new());
        (connector, db, registry)
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_acquire_reuses_server() {
        let (connector, _db, registry) = setup();
        let descriptor = ConnectionDescriptor::new("db", 5432);

        let first = registry.acquire(&descriptor).await.unwrap();
        let second = registry.acquire(&descriptor).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_ping_evicts_and_retries() {
        let (connector, db, registry) = setup();
        let descriptor = ConnectionDescriptor::new("db", 5432);

        let first = registry.acquire(&descriptor).await.unwrap();
        db.fail_next_pings(1);
        let second = registry.acquire(&descriptor).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connects(), 2);
        assert!(!db.is_closed());
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let (_connector, db, registry) = setup();
        db.fail_next_pings(5);

        let err = registry.acquire(&ConnectionDescriptor::new("db", 5432)).await.unwrap_err();
        match err {
            ConnectionError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ConnectionError::Ping { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_reports_open_error() {
        let (connector, _db, registry) = setup();
        let err = registry.acquire(&ConnectionDescriptor::new("other", 5432)).await.unwrap_err();
        assert_eq!(err.server(), "other:5432");
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_evict_and_close_all() {
        let (_connector, db, registry) = setup();
        registry.acquire(&ConnectionDescriptor::new("db", 5432)).await.unwrap();

        assert!(registry.evict("db:5432").await);
        assert!(db.is_closed());
        assert!(!registry.evict("db:5432").await);

        registry.acquire(&ConnectionDescriptor::new("db", 5432)).await.unwrap();
        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert!(db.is_closed());
    }
}
