//! Scripted in-memory database used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ConnectionDescriptor, Connector, Database, QueryResult, SqlValue};
use crate::error::{DbError, DbResult};
use crate::server::VERSION_QUERY;

#[derive(Debug)]
pub struct FakeDatabase {
    banner: Mutex<String>,
    responses: Mutex<HashMap<String, DbResult<QueryResult>>>,
    executed: Mutex<Vec<String>>,
    failing_pings: AtomicU32,
    closed: AtomicBool,
}

impl FakeDatabase {
    pub fn new(banner: &str) -> Arc<Self> {
        Arc::new(Self {
            banner: Mutex::new(banner.to_string()),
            responses: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            failing_pings: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn respond(&self, sql: &str, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        let result = QueryResult::new(columns.iter().map(|c| c.to_string()).collect(), rows);
        self.responses.lock().insert(sql.to_string(), Ok(result));
    }

    pub fn fail(&self, sql: &str, error: DbError) {
        self.responses.lock().insert(sql.to_string(), Err(error));
    }

    pub fn set_banner(&self, banner: &str) {
        *self.banner.lock() = banner.to_string();
    }

    pub fn fail_next_pings(&self, n: u32) {
        self.failing_pings.store(n, Ordering::SeqCst);
    }

    pub fn query_count(&self, sql: &str) -> usize {
        self.executed.lock().iter().filter(|q| q.as_str() == sql).count()
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn query(&self, sql: &str) -> DbResult<QueryResult> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        self.executed.lock().push(sql.to_string());

        if sql == VERSION_QUERY {
            let banner = self.banner.lock().clone();
            return Ok(QueryResult::new(vec!["version".into()], vec![vec![SqlValue::Text(banner)]]));
        }

        self.responses
            .lock()
            .get(sql)
            .cloned()
            .unwrap_or_else(|| Err(DbError::Query(format!("no scripted response for {:?}", sql))))
    }

    async fn ping(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        let remaining = self.failing_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(DbError::Connect("connection refused".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out registered fake databases by fingerprint
#[derive(Debug, Default)]
pub struct FakeConnector {
    databases: Mutex<HashMap<String, Arc<FakeDatabase>>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, fingerprint: &str, db: Arc<FakeDatabase>) {
        self.databases.lock().insert(fingerprint.to_string(), db);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> DbResult<Arc<dyn Database>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let db = self
            .databases
            .lock()
            .get(&descriptor.fingerprint())
            .cloned()
            .ok_or_else(|| DbError::Connect(format!("no route to {}", descriptor.fingerprint())))?;
        db.reopen();
        Ok(db)
    }
}
