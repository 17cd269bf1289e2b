//! Tablespace transport for transactional tables.
//!
//! A restored table walks `Attached -> Discarded -> Replaced -> Attached`:
//! the server forgets its data file, the file is swapped on disk, then the
//! server adopts the new file. Steps out of order are rejected before any
//! statement is sent.
//!
//! Discard and drop run with `foreign_key_checks` disabled on the session.
//! The flag is re-enabled whatever the statements return.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::core::{quote_ident, Engine, TableDescriptor};
use crate::error::{BackupError, BestEffort, Result};
use crate::lock::settle;
use crate::session::Session;

/// Where a transactional table is in its transport cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TablespaceState {
    #[default]
    Attached,
    Discarded,
    Replaced,
}

/// Tables dropped and skipped by [`drop_all`].
#[derive(Debug, Default)]
pub struct DropReport {
    pub dropped: Vec<String>,
    pub skipped: Vec<(String, BackupError)>,
}

impl DropReport {
    pub fn skipped_names(&self) -> Vec<String> {
        self.skipped.iter().map(|(name, _)| name.clone()).collect()
    }
}

async fn set_foreign_key_checks(session: &mut dyn Session, enabled: bool) -> Result<()> {
    let value = if enabled { 1 } else { 0 };
    session
        .execute(&format!("SET SESSION foreign_key_checks = {}", value))
        .await
}

/// Drop every named table, one statement each.
///
/// Failures are expected (views, dependency order) and only logged: a table
/// that survives is caught by the stale-file check or the schema replay.
pub async fn drop_all(session: &mut dyn Session, tables: &[String]) -> Result<DropReport> {
    set_foreign_key_checks(session, false).await?;

    let mut report = DropReport::default();
    for table in tables {
        let outcome = match quote_ident(table) {
            Ok(quoted) => BestEffort::from_result(
                session
                    .execute(&format!("DROP TABLE IF EXISTS {}", quoted))
                    .await,
            ),
            Err(e) => BestEffort::Skipped { reason: e },
        };
        match outcome {
            BestEffort::Applied => report.dropped.push(table.clone()),
            BestEffort::Skipped { reason } => {
                warn!("Could not drop table {}: {}", table, reason);
                report.skipped.push((table.clone(), reason));
            }
        }
    }

    set_foreign_key_checks(session, true).await?;
    info!(
        "Dropped {} tables ({} skipped)",
        report.dropped.len(),
        report.skipped.len()
    );
    Ok(report)
}

/// Per-table transport state for one database.
#[derive(Debug, Default)]
pub struct TablespaceTransportController {
    states: HashMap<String, TablespaceState>,
}

impl TablespaceTransportController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, table: &str) -> TablespaceState {
        self.states.get(table).copied().unwrap_or_default()
    }

    /// `ALTER TABLE ... DISCARD TABLESPACE` for each table.
    ///
    /// Stops at the first failure; foreign key checks are restored either way.
    pub async fn discard_all(
        &mut self,
        session: &mut dyn Session,
        tables: &[&TableDescriptor],
    ) -> Result<()> {
        for table in tables {
            self.expect(table, TablespaceState::Attached, "discard")?;
        }
        if tables.is_empty() {
            return Ok(());
        }

        set_foreign_key_checks(session, false).await?;
        let outcome = self.discard_each(session, tables).await;
        let restore = set_foreign_key_checks(session, true).await;
        settle(outcome, restore)?;

        info!("Discarded {} tablespaces", tables.len());
        Ok(())
    }

    async fn discard_each(
        &mut self,
        session: &mut dyn Session,
        tables: &[&TableDescriptor],
    ) -> Result<()> {
        for table in tables {
            session
                .execute(&format!(
                    "ALTER TABLE {} DISCARD TABLESPACE",
                    quote_ident(&table.name)?
                ))
                .await?;
            self.states
                .insert(table.name.clone(), TablespaceState::Discarded);
            debug!("Discarded tablespace of {}", table.name);
        }
        Ok(())
    }

    /// Record that the table's files have been placed on disk.
    pub fn mark_replaced(&mut self, table: &TableDescriptor) -> Result<()> {
        self.expect(table, TablespaceState::Discarded, "place files for")?;
        self.states
            .insert(table.name.clone(), TablespaceState::Replaced);
        Ok(())
    }

    /// `ALTER TABLE ... IMPORT TABLESPACE` for each table.
    pub async fn import_all(
        &mut self,
        session: &mut dyn Session,
        tables: &[&TableDescriptor],
    ) -> Result<()> {
        for table in tables {
            self.expect(table, TablespaceState::Replaced, "import")?;
        }
        for table in tables {
            session
                .execute(&format!(
                    "ALTER TABLE {} IMPORT TABLESPACE",
                    quote_ident(&table.name)?
                ))
                .await?;
            self.states
                .insert(table.name.clone(), TablespaceState::Attached);
            debug!("Imported tablespace of {}", table.name);
        }
        if !tables.is_empty() {
            info!("Imported {} tablespaces", tables.len());
        }
        Ok(())
    }

    fn expect(&self, table: &TableDescriptor, required: TablespaceState, action: &str) -> Result<()> {
        if table.engine != Engine::Transactional {
            return Err(BackupError::TablespaceState {
                table: table.name.clone(),
                message: format!("cannot {} tablespace of a {} table", action, table.engine),
            });
        }
        let current = self.state(&table.name);
        if current != required {
            return Err(BackupError::TablespaceState {
                table: table.name.clone(),
                message: format!(
                    "cannot {} tablespace while {:?} (expected {:?})",
                    action, current, required
                ),
            });
        }
        Ok(())
    }
}
