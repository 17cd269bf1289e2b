//! Table lock coordination.
//!
//! Tracks one [`LockState`] per database. A database moves
//! `Unlocked -> ExportLocked|WriteLocked -> Unlocked` and never takes a
//! second lock without releasing the first.
//!
//! Acquisition and release are explicit; callers run the locked phase and
//! then call [`LockCoordinator::release_all`] whatever the phase returned,
//! combining the two results with [`settle`]. Closing a session also drops
//! its locks on the server, but that is only the fallback.

use std::collections::HashMap;
use std::fmt;

use tracing::{error, info};

use crate::core::{quote_ident, quote_list, TableDescriptor};
use crate::error::{BackupError, Result};
use crate::session::{Connector, DatabaseHandle};

/// Lock held by a database's sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,
    /// `FLUSH TABLES ... FOR EXPORT` on the primary session.
    ExportLocked,
    /// `LOCK TABLES ... WRITE` on the write-lock session.
    WriteLocked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unlocked => write!(f, "unlocked"),
            LockState::ExportLocked => write!(f, "export-locked"),
            LockState::WriteLocked => write!(f, "write-locked"),
        }
    }
}

/// Per-database lock bookkeeping for one run.
#[derive(Debug, Default)]
pub struct LockCoordinator {
    states: HashMap<String, LockState>,
    history: Vec<(String, LockState)>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state for a database.
    pub fn state(&self, database: &str) -> LockState {
        self.states.get(database).copied().unwrap_or_default()
    }

    /// Databases currently holding a lock.
    pub fn locked_databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| **state != LockState::Unlocked)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Every transition recorded so far, oldest first.
    pub fn history(&self) -> &[(String, LockState)] {
        &self.history
    }

    /// Flush the tables to disk and hold them read-locked for copying.
    ///
    /// Covers transactional and flat-file tables alike; while held, `.cfg`
    /// export metadata exists next to every transactional table.
    pub async fn acquire_export_lock(
        &mut self,
        db: &mut DatabaseHandle,
        tables: &[TableDescriptor],
    ) -> Result<()> {
        self.check_unlocked(db.name())?;

        if tables.is_empty() {
            info!("{}: no tables to flush for export", db.name());
        } else {
            let statement = format!(
                "FLUSH TABLES {} FOR EXPORT",
                quote_list(tables.iter().map(|t| t.name.as_str()))?
            );
            db.primary().execute(&statement).await?;
            info!("{}: {} tables flushed and locked for export", db.name(), tables.len());
        }

        self.transition(db.name(), LockState::ExportLocked);
        Ok(())
    }

    /// Take exclusive write locks on the write-lock session.
    ///
    /// A session holding `FOR EXPORT` locks cannot also take `LOCK TABLES`,
    /// hence the separate session.
    pub async fn acquire_write_lock(
        &mut self,
        db: &mut DatabaseHandle,
        connector: &dyn Connector,
        tables: &[TableDescriptor],
    ) -> Result<()> {
        self.check_unlocked(db.name())?;

        if tables.is_empty() {
            info!("{}: no tables to write-lock", db.name());
        } else {
            let targets = tables
                .iter()
                .map(|t| Ok(format!("{} WRITE", quote_ident(&t.name)?)))
                .collect::<Result<Vec<_>>>()?;
            let statement = format!("LOCK TABLES {}", targets.join(", "));
            let name = db.name().to_string();
            db.write_lock_session(connector)
                .await?
                .execute(&statement)
                .await?;
            info!("{}: {} tables write-locked", name, tables.len());
        }

        self.transition(db.name(), LockState::WriteLocked);
        Ok(())
    }

    /// Unlock every session of the database, whatever state it is in.
    ///
    /// Both sessions are attempted; the first failure is returned after the
    /// state has been reset.
    pub async fn release_all(&mut self, db: &mut DatabaseHandle) -> Result<()> {
        let mut first_error = None;

        if let Err(e) = db.primary().execute("UNLOCK TABLES").await {
            error!("{}: UNLOCK TABLES failed on primary session: {}", db.name(), e);
            first_error.get_or_insert(e);
        }
        let name = db.name().to_string();
        if let Some(session) = db.existing_write_lock_session() {
            if let Err(e) = session.execute("UNLOCK TABLES").await {
                error!("{}: UNLOCK TABLES failed on write-lock session: {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        if self.state(&name) != LockState::Unlocked {
            self.transition(&name, LockState::Unlocked);
            info!("{}: all table locks released", name);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_unlocked(&self, database: &str) -> Result<()> {
        match self.state(database) {
            LockState::Unlocked => Ok(()),
            held => Err(BackupError::LockState(format!(
                "{} is already {}; release it before locking again",
                database, held
            ))),
        }
    }

    fn transition(&mut self, database: &str, next: LockState) {
        self.states.insert(database.to_string(), next);
        self.history.push((database.to_string(), next));
    }
}

/// Combine the result of a locked phase with the result of its release.
///
/// The phase error wins; a release failure after a successful phase is
/// returned as the run's error.
pub fn settle<T>(outcome: Result<T>, release: Result<()>) -> Result<T> {
    match (outcome, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_err)) => {
            error!("Release after failure also failed: {}", release_err);
            Err(e)
        }
    }
}
