//! Scripted stand-ins for sessions and external utilities, used by tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseTarget;
use crate::error::{BackupError, Result};
use crate::orchestrator::SnapshotSignal;
use crate::repair::{IndexChecker, ToolOutput};
use crate::schema::SchemaDumper;
use crate::session::{Connector, Row, Session, SessionRole, CATALOG_QUERY};

/// A target database named `name` whose data directory is never touched.
pub fn database(name: &str) -> DatabaseTarget {
    database_in(name, Path::new("/nonexistent/mysql"))
}

/// A target database whose files live under `data_dir/name`.
pub fn database_in(name: &str, data_dir: &Path) -> DatabaseTarget {
    DatabaseTarget {
        host: "db.test".to_string(),
        port: 3306,
        database: name.to_string(),
        user: "backup".to_string(),
        password: "secret".to_string(),
        data_dir: data_dir.to_path_buf(),
    }
}

/// One statement as the server would have seen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Session id in connect order, starting at 0.
    pub session: usize,
    pub database: String,
    pub statement: String,
}

/// Copy of everything the scripted server received.
#[derive(Debug, Clone)]
pub struct StatementLog {
    entries: Vec<Entry>,
    sessions_opened: usize,
    sessions_closed: usize,
}

impl StatementLog {
    pub fn statements(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.statement.clone()).collect()
    }

    pub fn count(&self, statement: &str) -> usize {
        self.entries.iter().filter(|e| e.statement == statement).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.statement.starts_with(prefix))
            .count()
    }

    pub fn find(&self, statement: &str) -> Option<Entry> {
        self.entries.iter().find(|e| e.statement == statement).cloned()
    }

    /// Index of the first statement starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.statement.starts_with(prefix))
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.sessions_closed
    }
}

#[derive(Default)]
struct Server {
    entries: Vec<Entry>,
    sessions_opened: usize,
    sessions_closed: usize,
    /// Result sets for CATALOG_QUERY per database; the last one repeats.
    catalogs: HashMap<String, VecDeque<Vec<Row>>>,
    fail_on: Vec<String>,
    fail_connect: Vec<String>,
    lose_connection_after: Option<String>,
    connection_lost: bool,
    usability_checks: usize,
    cancel_on_check: Option<(usize, CancellationToken)>,
}

impl Server {
    fn check_usable(&mut self) -> bool {
        self.usability_checks += 1;
        if let Some((at, token)) = &self.cancel_on_check {
            if *at == self.usability_checks {
                token.cancel();
            }
        }
        !self.connection_lost
    }

    fn next_catalog(&mut self, database: &str) -> Vec<Row> {
        match self.catalogs.get_mut(database) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn record(&mut self, session: usize, database: &str, statement: &str) -> Result<()> {
        self.entries.push(Entry {
            session,
            database: database.to_string(),
            statement: statement.to_string(),
        });
        if self
            .lose_connection_after
            .as_deref()
            .is_some_and(|prefix| statement.starts_with(prefix))
        {
            self.connection_lost = true;
        }
        if self.fail_on.iter().any(|prefix| statement.starts_with(prefix)) {
            return Err(BackupError::sql(statement, "scripted failure"));
        }
        Ok(())
    }
}

fn catalog_rows(tables: &[(&str, &str)]) -> Vec<Row> {
    tables
        .iter()
        .map(|(name, engine)| vec![Some(name.to_string()), Some(engine.to_string())])
        .collect()
}

/// A connector whose sessions all log into one shared server.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    server: Arc<Mutex<Server>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn server(&self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap()
    }

    /// Queue a catalog result for `database`; queued results are returned in
    /// order and the last one keeps being returned.
    pub fn with_catalog(self, database: &str, tables: &[(&str, &str)]) -> Self {
        self.server()
            .catalogs
            .entry(database.to_string())
            .or_default()
            .push_back(catalog_rows(tables));
        self
    }

    /// Fail every statement starting with `prefix`.
    pub fn fail_on(self, prefix: &str) -> Self {
        self.server().fail_on.push(prefix.to_string());
        self
    }

    /// Refuse connections to `database`.
    pub fn fail_connect(self, database: &str) -> Self {
        self.server().fail_connect.push(database.to_string());
        self
    }

    /// Every session becomes unusable once a statement starting with
    /// `prefix` has run.
    pub fn lose_connection_after(self, prefix: &str) -> Self {
        self.server().lose_connection_after = Some(prefix.to_string());
        self
    }

    /// Cancel `token` during the `check`-th usability check (1-based,
    /// counted across sessions), as a signal arriving mid-phase would.
    pub fn cancel_on_check(self, check: usize, token: CancellationToken) -> Self {
        self.server().cancel_on_check = Some((check, token));
        self
    }

    pub fn log(&self) -> StatementLog {
        let server = self.server();
        StatementLog {
            entries: server.entries.clone(),
            sessions_opened: server.sessions_opened,
            sessions_closed: server.sessions_closed,
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        target: &DatabaseTarget,
        _role: SessionRole,
    ) -> Result<Box<dyn Session>> {
        let mut server = self.server();
        if server.fail_connect.contains(&target.database) {
            return Err(BackupError::connection(target.label(), "connection refused"));
        }
        let id = server.sessions_opened;
        server.sessions_opened += 1;
        Ok(Box::new(ScriptedSession {
            server: Arc::clone(&self.server),
            id,
            database: target.database.clone(),
            closed: false,
        }))
    }
}

/// A session against the scripted server.
pub struct ScriptedSession {
    server: Arc<Mutex<Server>>,
    id: usize,
    database: String,
    closed: bool,
}

impl ScriptedSession {
    /// A standalone session with its own server.
    pub fn new(database: &str) -> Self {
        let server = Server {
            sessions_opened: 1,
            ..Server::default()
        };
        Self {
            server: Arc::new(Mutex::new(server)),
            id: 0,
            database: database.to_string(),
            closed: false,
        }
    }

    fn server(&self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap()
    }

    pub fn with_catalog(self, tables: &[(&str, &str)]) -> Self {
        self.push_rows(catalog_rows(tables));
        self
    }

    /// Queue a raw catalog result set.
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.server()
            .catalogs
            .entry(self.database.clone())
            .or_default()
            .push_back(rows);
    }

    pub fn fail_on(self, prefix: &str) -> Self {
        self.server().fail_on.push(prefix.to_string());
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.server()
            .entries
            .iter()
            .map(|e| e.statement.clone())
            .collect()
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        if self.closed {
            return Err(BackupError::connection(&self.database, "session already closed"));
        }
        self.server().record(self.id, &self.database, statement)
    }

    async fn query(&mut self, statement: &str) -> Result<Vec<Row>> {
        if self.closed {
            return Err(BackupError::connection(&self.database, "session already closed"));
        }
        let mut server = self.server();
        server.record(self.id, &self.database, statement)?;
        if statement == CATALOG_QUERY {
            Ok(server.next_catalog(&self.database))
        } else {
            Ok(Vec::new())
        }
    }

    async fn is_usable(&mut self) -> bool {
        !self.closed && self.server().check_usable()
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.server().sessions_closed += 1;
        }
        Ok(())
    }
}

/// Schema dumper returning canned output per database.
#[derive(Clone, Default)]
pub struct FakeDumper {
    outputs: HashMap<String, std::result::Result<String, String>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeDumper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, database: &str, ddl: &str) -> Self {
        self.outputs.insert(database.to_string(), Ok(ddl.to_string()));
        self
    }

    pub fn with_failure(mut self, database: &str, diagnostic: &str) -> Self {
        self.outputs
            .insert(database.to_string(), Err(diagnostic.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaDumper for FakeDumper {
    async fn dump_structure(&self, target: &DatabaseTarget) -> Result<String> {
        self.calls.lock().unwrap().push(target.database.clone());
        match self.outputs.get(&target.database) {
            Some(Ok(ddl)) => Ok(ddl.clone()),
            Some(Err(diagnostic)) => Err(BackupError::SchemaExport {
                database: target.database.clone(),
                diagnostic: diagnostic.clone(),
            }),
            None => Ok(format!("CREATE TABLE `{}_placeholder` (id int);\n", target.database)),
        }
    }
}

/// Index checker with fixed check/recover outcomes.
#[derive(Clone)]
pub struct FakeChecker {
    check_ok: bool,
    recover_ok: bool,
    calls: Arc<Mutex<Vec<(String, PathBuf)>>>,
}

impl FakeChecker {
    pub fn new(check_ok: bool, recover_ok: bool) -> Self {
        Self {
            check_ok,
            recover_ok,
            calls: Arc::default(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(true, true)
    }

    /// `(operation, file)` pairs in call order.
    pub fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IndexChecker for FakeChecker {
    async fn check(&self, index_file: &Path) -> Result<ToolOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(("check".to_string(), index_file.to_path_buf()));
        Ok(ToolOutput {
            success: self.check_ok,
            output: if self.check_ok { "ok" } else { "corrupt" }.to_string(),
        })
    }

    async fn recover(&self, index_file: &Path) -> Result<ToolOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(("recover".to_string(), index_file.to_path_buf()));
        Ok(ToolOutput {
            success: self.recover_ok,
            output: if self.recover_ok { "recovered" } else { "cannot recover" }.to_string(),
        })
    }
}

/// Snapshot confirmation that arrives after a delay, or never.
pub struct ManualSignal {
    delay: Option<Duration>,
}

impl ManualSignal {
    pub fn immediate() -> Self {
        Self {
            delay: Some(Duration::ZERO),
        }
    }

    pub fn never() -> Self {
        Self { delay: None }
    }
}

#[async_trait]
impl SnapshotSignal for ManualSignal {
    async fn wait_for_confirmation(&mut self) -> Result<()> {
        match self.delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => std::future::pending().await,
        }
    }

    fn describe(&self) -> String {
        "manual test signal".to_string()
    }
}
