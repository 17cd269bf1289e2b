//! # physical-backup
//!
//! File-level backup and restore of MariaDB tables using transportable
//! tablespaces.
//!
//! Table files are copied while the server holds the right locks, alongside
//! a schema capture consistent with them:
//!
//! - **Archive export/import** packs the schema and table files of one
//!   database into a tar archive and restores it into a target database
//! - **Live snapshot export** holds `FLUSH TABLES ... FOR EXPORT` on one or
//!   more databases while the operator snapshots the data volume
//! - **Live snapshot import** restores one database from a mounted snapshot
//!   using the handoff record written at export time
//!
//! InnoDB tables move as tablespaces (`DISCARD`/`IMPORT TABLESPACE`), MyISAM
//! tables as plain files under `LOCK TABLES ... WRITE`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use physical_backup::{Config, Orchestrator, WorkflowPlan};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> physical_backup::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let source = config.sources[0].clone();
//!     let mut orchestrator = Orchestrator::new(config)?;
//!     let plan = WorkflowPlan::ArchiveExport {
//!         source,
//!         archive: "/backups/shop.tar.gz".into(),
//!     };
//!     let report = orchestrator.run(plan, CancellationToken::new()).await?;
//!     println!("Wrote {:?} entries", report.archive_entries);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod config;
pub mod core;
pub mod error;
pub mod files;
pub mod handoff;
pub mod lock;
pub mod orchestrator;
pub mod repair;
pub mod schema;
pub mod session;
pub mod tablespace;
pub mod transfer;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use archive::{ArchiveManifest, ArchiveReader};
pub use config::{Config, DatabaseTarget};
pub use crate::core::{Engine, TableDescriptor, TableSet};
pub use error::{BackupError, Result};
pub use handoff::HandoffRecord;
pub use orchestrator::{
    HealthCheckResult, MarkerFileConfirmation, Orchestrator, Phase, RunReport, SnapshotSignal,
    StdinConfirmation, Variant, WorkflowPlan,
};
pub use session::{Connector, MysqlConnector, Session};
