//! Workflow variants, their phases, and the inputs of a run.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::DatabaseTarget;

/// The four workflow shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    ArchiveExport,
    ArchiveImport,
    LiveSnapshotExport,
    LiveSnapshotImport,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variant::ArchiveExport => "archive export",
            Variant::ArchiveImport => "archive import",
            Variant::LiveSnapshotExport => "live snapshot export",
            Variant::LiveSnapshotImport => "live snapshot import",
        };
        f.write_str(name)
    }
}

/// One step of a workflow. Each phase runs across every database of the run
/// before the next phase starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    OpenArchive,
    LoadHandoff,
    Connect,
    Classify,
    AcquireExportLock,
    CaptureSchema,
    ValidateFiles,
    BuildArchive,
    WriteHandoff,
    AwaitSnapshot,
    RepairIndexes,
    DropTables,
    CheckStaleFiles,
    RecreateSchema,
    EnumerateTables,
    DiscardTablespaces,
    RestoreTransactionalFiles,
    ImportTablespaces,
    AcquireWriteLock,
    RestoreFlatFileFiles,
    ReleaseLocks,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::OpenArchive => "open archive",
            Phase::LoadHandoff => "load handoff record",
            Phase::Connect => "connect",
            Phase::Classify => "classify tables",
            Phase::AcquireExportLock => "acquire export lock",
            Phase::CaptureSchema => "capture schema",
            Phase::ValidateFiles => "validate files",
            Phase::BuildArchive => "build archive",
            Phase::WriteHandoff => "write handoff record",
            Phase::AwaitSnapshot => "await snapshot confirmation",
            Phase::RepairIndexes => "repair indexes",
            Phase::DropTables => "drop tables",
            Phase::CheckStaleFiles => "check stale files",
            Phase::RecreateSchema => "recreate schema",
            Phase::EnumerateTables => "enumerate tables",
            Phase::DiscardTablespaces => "discard tablespaces",
            Phase::RestoreTransactionalFiles => "restore transactional files",
            Phase::ImportTablespaces => "import tablespaces",
            Phase::AcquireWriteLock => "acquire write lock",
            Phase::RestoreFlatFileFiles => "restore flat-file files",
            Phase::ReleaseLocks => "release locks",
        };
        f.write_str(name)
    }
}

impl Phase {
    /// Cleanup phases run even after cancellation.
    pub fn is_cleanup(self) -> bool {
        matches!(self, Phase::ReleaseLocks)
    }
}

impl Variant {
    /// Phases in execution order.
    ///
    /// Exports validate files after taking the lock: `.cfg` metadata only
    /// exists while `FOR EXPORT` is held.
    pub fn phases(self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Variant::ArchiveExport => &[
                Connect,
                Classify,
                AcquireExportLock,
                CaptureSchema,
                ValidateFiles,
                BuildArchive,
                ReleaseLocks,
            ],
            Variant::ArchiveImport => &[
                OpenArchive,
                Connect,
                DropTables,
                CheckStaleFiles,
                RecreateSchema,
                EnumerateTables,
                DiscardTablespaces,
                RestoreTransactionalFiles,
                ImportTablespaces,
                AcquireWriteLock,
                RestoreFlatFileFiles,
                ReleaseLocks,
            ],
            Variant::LiveSnapshotExport => &[
                Connect,
                Classify,
                AcquireExportLock,
                CaptureSchema,
                ValidateFiles,
                WriteHandoff,
                AwaitSnapshot,
                ReleaseLocks,
            ],
            Variant::LiveSnapshotImport => &[
                LoadHandoff,
                Connect,
                RepairIndexes,
                DropTables,
                CheckStaleFiles,
                RecreateSchema,
                DiscardTablespaces,
                RestoreTransactionalFiles,
                ImportTablespaces,
                AcquireWriteLock,
                RestoreFlatFileFiles,
                ReleaseLocks,
            ],
        }
    }

    pub fn is_export(self) -> bool {
        matches!(self, Variant::ArchiveExport | Variant::LiveSnapshotExport)
    }

    /// What the operator should know after a failure in `phase`.
    pub fn recovery_hint(self, phase: Phase) -> &'static str {
        match (self, phase) {
            (Variant::ArchiveExport, Phase::ReleaseLocks) => {
                "The archive was written while the export lock was held and is complete. \
                 Releasing the lock failed; the server drops it when the session closes."
            }
            (Variant::ArchiveImport | Variant::LiveSnapshotImport, Phase::ReleaseLocks) => {
                "Every table was restored. Releasing the write lock failed; the server drops \
                 it when the session closes. Check the tables are readable before use."
            }
            (Variant::ArchiveExport, _) => {
                "The source database was not modified and no archive was written. \
                 Fix the cause and re-run the export."
            }
            (Variant::LiveSnapshotExport, Phase::AwaitSnapshot | Phase::ReleaseLocks) => {
                "Locks have been released. A snapshot taken during this run may be \
                 inconsistent; discard it and re-run the export."
            }
            (Variant::LiveSnapshotExport, _) => {
                "Source databases were not modified. Do not take a snapshot; \
                 fix the cause and re-run the export."
            }
            (_, Phase::OpenArchive | Phase::LoadHandoff | Phase::Connect) => {
                "The target database was not modified. Fix the cause and re-run the import."
            }
            (_, Phase::RepairIndexes) => {
                "No tables were dropped, but index recovery may have rewritten files in the \
                 target directory. Restore the snapshot files before re-running the import."
            }
            (_, Phase::DropTables | Phase::CheckStaleFiles) => {
                "Some target tables may have been dropped. Remove any leftover .ibd files \
                 from the target database directory, then re-run the import."
            }
            _ => {
                "The target schema may exist without attached tablespaces or table files and \
                 is not usable. Re-run the import, which drops and recreates every table."
            }
        }
    }
}

/// Inputs of one run.
#[derive(Debug, Clone)]
pub enum WorkflowPlan {
    ArchiveExport {
        source: DatabaseTarget,
        archive: PathBuf,
    },
    ArchiveImport {
        target: DatabaseTarget,
        archive: PathBuf,
    },
    LiveSnapshotExport {
        sources: Vec<DatabaseTarget>,
        handoff: PathBuf,
    },
    LiveSnapshotImport {
        target: DatabaseTarget,
        handoff: PathBuf,
        /// Database in the handoff record to restore from.
        source_database: String,
        /// Data directory of the mounted snapshot; the source database's
        /// files are in `snapshot_data_dir/source_database`.
        snapshot_data_dir: PathBuf,
    },
}

impl WorkflowPlan {
    pub fn variant(&self) -> Variant {
        match self {
            WorkflowPlan::ArchiveExport { .. } => Variant::ArchiveExport,
            WorkflowPlan::ArchiveImport { .. } => Variant::ArchiveImport,
            WorkflowPlan::LiveSnapshotExport { .. } => Variant::LiveSnapshotExport,
            WorkflowPlan::LiveSnapshotImport { .. } => Variant::LiveSnapshotImport,
        }
    }

    /// Databases the run connects to, in processing order.
    pub fn databases(&self) -> Vec<DatabaseTarget> {
        match self {
            WorkflowPlan::ArchiveExport { source, .. } => vec![source.clone()],
            WorkflowPlan::LiveSnapshotExport { sources, .. } => sources.clone(),
            WorkflowPlan::ArchiveImport { target, .. }
            | WorkflowPlan::LiveSnapshotImport { target, .. } => vec![target.clone()],
        }
    }
}
