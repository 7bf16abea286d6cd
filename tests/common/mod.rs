//! In-memory databases for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dbmon::config::TargetConfig;
use dbmon::connection::{ConnectionManager, ConnectionSettings};
use dbmon::error::DbError;
use dbmon::session::{Connector, Lease, Row, Session};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Server-side state shared by every session opened against it
#[derive(Default)]
pub struct FakeDatabase {
    ping: Mutex<Option<DbError>>,
    // Keyed by a substring of the SQL text
    responses: Mutex<Vec<(String, Result<Vec<Row>, DbError>)>>,
    pub pings: AtomicUsize,
    pub fetches: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
}

impl FakeDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_pings(&self, error: DbError) {
        *self.ping.lock().unwrap() = Some(error);
    }

    pub fn heal_pings(&self) {
        *self.ping.lock().unwrap() = None;
    }

    pub fn respond(&self, sql_fragment: &str, rows: Vec<Row>) {
        self.set_response(sql_fragment, Ok(rows));
    }

    pub fn fail_query(&self, sql_fragment: &str, error: DbError) {
        self.set_response(sql_fragment, Err(error));
    }

    fn set_response(&self, sql_fragment: &str, response: Result<Vec<Row>, DbError>) {
        let mut responses = self.responses.lock().unwrap();
        responses.retain(|(fragment, _)| fragment != sql_fragment);
        responses.push((sql_fragment.to_string(), response));
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

struct FakeSession(Arc<FakeDatabase>);

#[async_trait]
impl Session for FakeSession {
    async fn ping(&self) -> Result<(), DbError> {
        self.0.pings.fetch_add(1, Ordering::SeqCst);
        match self.0.ping.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<Row>, DbError> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        self.0.queries.lock().unwrap().push(sql.to_string());
        let responses = self.0.responses.lock().unwrap();
        match responses.iter().find(|(fragment, _)| sql.contains(fragment.as_str())) {
            Some((_, response)) => response.clone(),
            None => Ok(Vec::new()),
        }
    }

    async fn lease(&self) -> Result<Lease, DbError> {
        Ok(Lease::new(()))
    }
}

/// Opens sessions against the fake database registered under the target's name
#[derive(Default)]
pub struct FakeConnector {
    databases: HashMap<String, Arc<FakeDatabase>>,
}

impl FakeConnector {
    pub fn with(mut self, name: &str, database: Arc<FakeDatabase>) -> Self {
        self.databases.insert(name.to_string(), database);
        self
    }
}

impl Connector for FakeConnector {
    fn open(&self, name: &str, _target: &TargetConfig) -> Result<Box<dyn Session>, DbError> {
        match self.databases.get(name) {
            Some(database) => Ok(Box::new(FakeSession(database.clone()))),
            None => Err(DbError::Other(format!("no such database: {}", name))),
        }
    }
}

pub fn target_config(labels: &[(&str, &str)]) -> TargetConfig {
    TargetConfig {
        url: "postgres://monitor@localhost/app".to_string(),
        max_open_conns: 2,
        query_timeout_seconds: 5,
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

pub fn manager(connector: FakeConnector, targets: &[(&str, TargetConfig)]) -> Arc<ConnectionManager> {
    let configs: BTreeMap<String, TargetConfig> = targets
        .iter()
        .map(|(name, config)| (name.to_string(), config.clone()))
        .collect();
    Arc::new(ConnectionManager::new(
        &configs,
        "database",
        Arc::new(connector),
        ConnectionSettings {
            warmup_delay: Duration::from_millis(1),
            ..ConnectionSettings::with_backoff(Duration::from_secs(300))
        },
    ))
}

pub fn write_definitions(dir: &Path, file: &str, contents: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn invalid_credentials() -> DbError {
    DbError::InvalidCredentials {
        code: "28P01".to_string(),
        message: "password authentication failed for user \"monitor\"".to_string(),
    }
}
