//! Database session interface.
//!
//! Locks taken by the workflows are scoped to the session that issued them,
//! so everything here works on single dedicated sessions rather than pools:
//!
//! - [`Session`]: execute/query/usability/close on one live session
//! - [`Connector`]: opens sessions for a [`DatabaseTarget`]
//! - [`DatabaseHandle`]: the sessions a run holds for one database
//! - [`MysqlConnector`]: MariaDB implementation on `mysql_async`

mod mysql;

pub use mysql::{MysqlConnector, MysqlSession};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::DatabaseTarget;
use crate::core::TableSet;
use crate::error::{BackupError, Result};

/// One result row; SQL NULL is `None`.
pub type Row = Vec<Option<String>>;

/// Base tables of the connected database with their engines.
pub const CATALOG_QUERY: &str = "SELECT table_name, engine FROM information_schema.tables \
     WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE' \
     ORDER BY table_name";

/// Which of a database's sessions a statement runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Schema work, export flush locks, tablespace discard/import.
    Primary,
    /// Write locks on flat-file tables while their files are replaced.
    WriteLock,
}

/// A live database session.
#[async_trait]
pub trait Session: Send {
    /// Run a statement, discarding any result.
    async fn execute(&mut self, statement: &str) -> Result<()>;

    /// Run a query and return all rows as text.
    async fn query(&mut self, statement: &str) -> Result<Vec<Row>>;

    /// Round-trip to the server to check the session is still alive.
    async fn is_usable(&mut self) -> bool;

    /// Close the session. Any locks it holds are released by the server.
    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &DatabaseTarget, role: SessionRole)
        -> Result<Box<dyn Session>>;
}

/// The sessions one run holds against one database.
///
/// Opened once per run and owned by the workflow. The write-lock session is
/// opened on first use and then reused.
pub struct DatabaseHandle {
    target: DatabaseTarget,
    primary: Box<dyn Session>,
    write_lock: Option<Box<dyn Session>>,
}

impl DatabaseHandle {
    /// Connect the primary session.
    pub async fn open(connector: &dyn Connector, target: DatabaseTarget) -> Result<Self> {
        let primary = connector.connect(&target, SessionRole::Primary).await?;
        Ok(Self {
            target,
            primary,
            write_lock: None,
        })
    }

    pub fn target(&self) -> &DatabaseTarget {
        &self.target
    }

    /// Database name; the key for lock and report bookkeeping.
    pub fn name(&self) -> &str {
        &self.target.database
    }

    pub fn primary(&mut self) -> &mut dyn Session {
        self.primary.as_mut()
    }

    /// The write-lock session, connecting it on first use.
    pub async fn write_lock_session(&mut self, connector: &dyn Connector) -> Result<&mut dyn Session> {
        if self.write_lock.is_none() {
            let session = connector.connect(&self.target, SessionRole::WriteLock).await?;
            self.write_lock = Some(session);
        }
        match self.write_lock.as_mut() {
            Some(session) => Ok(session.as_mut()),
            None => Err(BackupError::connection(
                self.target.label(),
                "write-lock session unavailable",
            )),
        }
    }

    /// The write-lock session if it has been opened.
    pub fn existing_write_lock_session(&mut self) -> Option<&mut dyn Session> {
        match self.write_lock.as_mut() {
            Some(session) => Some(session.as_mut()),
            None => None,
        }
    }

    /// Fail with a connection error if any open session has gone away.
    pub async fn ensure_usable(&mut self) -> Result<()> {
        if !self.primary.is_usable().await {
            return Err(BackupError::connection(
                self.target.label(),
                "primary session is no longer usable",
            ));
        }
        if let Some(session) = self.write_lock.as_mut() {
            if !session.is_usable().await {
                return Err(BackupError::connection(
                    self.target.label(),
                    "write-lock session is no longer usable",
                ));
            }
        }
        Ok(())
    }

    /// Close every session, logging failures.
    pub async fn close(&mut self) {
        if let Some(mut session) = self.write_lock.take() {
            if let Err(e) = session.close().await {
                warn!("{}: closing write-lock session failed: {}", self.name(), e);
            }
        }
        if let Err(e) = self.primary.close().await {
            warn!("{}: closing primary session failed: {}", self.name(), e);
        }
        debug!("{}: sessions closed", self.name());
    }
}

/// Read the live catalog and classify every base table by engine.
pub async fn classify_tables(session: &mut dyn Session) -> Result<TableSet> {
    let rows = session.query(CATALOG_QUERY).await?;
    let pairs = rows
        .into_iter()
        .map(|row| {
            let mut cols = row.into_iter();
            match (cols.next().flatten(), cols.next().flatten()) {
                (Some(name), Some(engine)) => Ok((name, engine)),
                (Some(name), None) => Err(BackupError::UnsupportedEngine {
                    table: name,
                    engine: "NULL".to_string(),
                }),
                _ => Err(BackupError::sql(CATALOG_QUERY, "catalog row without table name")),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    TableSet::classify(pairs)
}

/// Names of every base table, whatever its engine.
pub async fn list_table_names(session: &mut dyn Session) -> Result<Vec<String>> {
    let rows = session.query(CATALOG_QUERY).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect())
}
