//! Workflow orchestrator - one state machine for all four variants.
//!
//! A run walks its variant's phase list. Each phase runs across every
//! database of the run before the next starts, so in a multi-database
//! export all locks are held before any schema is captured. Cancellation is
//! checked between phases. Whatever the outcome, held locks are released and
//! sessions closed before `run` returns.

mod plan;
mod signal;

pub use plan::{Phase, Variant, WorkflowPlan};
pub use signal::{MarkerFileConfirmation, SnapshotSignal, StdinConfirmation};

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::archive::{write_archive, ArchiveManifest, ArchiveReader};
use crate::config::{Config, DatabaseTarget};
use crate::core::{Engine, TableDescriptor, TableSet};
use crate::error::{BackupError, Result};
use crate::files::{ensure_no_stale_data_files, validate_required_files};
use crate::handoff::HandoffRecord;
use crate::lock::{settle, LockCoordinator, LockState};
use crate::repair::{IndexChecker, IndexRepairController, Myisamchk};
use crate::schema::{apply_schema, MariadbDump, SchemaDumper, SchemaExtractor, SchemaSnapshot};
use crate::session::{
    classify_tables, list_table_names, Connector, DatabaseHandle, MysqlConnector, Session,
};
use crate::tablespace::{drop_all, TablespaceTransportController};
use crate::transfer::FileTransferEngine;

/// Backup/restore orchestrator.
pub struct Orchestrator {
    config: Config,
    connector: Box<dyn Connector>,
    dumper: Box<dyn SchemaDumper>,
    checker: Box<dyn IndexChecker>,
    transfer: FileTransferEngine,
    signal: Option<Box<dyn SnapshotSignal>>,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    pub variant: Variant,

    /// Final status.
    pub status: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub databases: Vec<DatabaseReport>,

    /// Archive written or read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,

    /// Entries written to the archive, schema included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_entries: Option<usize>,

    /// Handoff record written or read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<PathBuf>,

    pub phases_completed: Vec<Phase>,

    /// Tables whose pre-restore drop failed and was skipped.
    pub tables_drop_skipped: Vec<String>,

    /// Index files that needed a recovery pass.
    pub indexes_recovered: Vec<PathBuf>,
}

/// Per-database part of a [`RunReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseReport {
    pub database: String,
    pub transactional_tables: usize,
    pub flat_file_tables: usize,
    pub schema_statements: usize,
    pub files_restored: usize,
}

/// Result of a connectivity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub databases: Vec<DatabaseHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    /// `source` or `target`.
    pub role: String,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// State of one database within a run.
struct DatabaseRun {
    target: DatabaseTarget,
    handle: Option<DatabaseHandle>,
    tables: Option<TableSet>,
    schema: Option<SchemaSnapshot>,
    tablespaces: TablespaceTransportController,
    schema_statements: usize,
    files_restored: usize,
}

impl DatabaseRun {
    fn new(target: DatabaseTarget) -> Self {
        Self {
            target,
            handle: None,
            tables: None,
            schema: None,
            tablespaces: TablespaceTransportController::new(),
            schema_statements: 0,
            files_restored: 0,
        }
    }

    fn name(&self) -> &str {
        &self.target.database
    }

    fn handle(&mut self) -> Result<&mut DatabaseHandle> {
        let name = &self.target.database;
        self.handle
            .as_mut()
            .ok_or_else(|| BackupError::Workflow(format!("{} is not connected", name)))
    }

    fn primary_and_tablespaces(
        &mut self,
    ) -> Result<(&mut dyn Session, &mut TablespaceTransportController)> {
        let name = &self.target.database;
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| BackupError::Workflow(format!("{} is not connected", name)))?;
        Ok((handle.primary(), &mut self.tablespaces))
    }

    fn tables(&self) -> Result<&TableSet> {
        self.tables.as_ref().ok_or_else(|| {
            BackupError::Workflow(format!("tables of {} have not been classified", self.name()))
        })
    }

    /// The table set is fixed once captured.
    fn set_tables(&mut self, tables: TableSet) -> Result<()> {
        if self.tables.is_some() {
            return Err(BackupError::Workflow(format!(
                "tables of {} were already classified in this run",
                self.name()
            )));
        }
        info!(
            "{}: {} tables ({} transactional, {} flat-file)",
            self.name(),
            tables.len(),
            tables.transactional().len(),
            tables.flat_file().len()
        );
        self.tables = Some(tables);
        Ok(())
    }

    fn tables_of(&self, engine: Engine) -> Result<Vec<TableDescriptor>> {
        Ok(self
            .tables()?
            .of_engine(engine)
            .into_iter()
            .cloned()
            .collect())
    }

    fn schema(&self) -> Result<&SchemaSnapshot> {
        self.schema.as_ref().ok_or_else(|| {
            BackupError::Workflow(format!("no schema available for {}", self.name()))
        })
    }

    fn report(&self) -> DatabaseReport {
        let count = |engine: Engine| {
            self.tables
                .as_ref()
                .map(|t| t.of_engine(engine).len())
                .unwrap_or(0)
        };
        DatabaseReport {
            database: self.target.database.clone(),
            transactional_tables: count(Engine::Transactional),
            flat_file_tables: count(Engine::FlatFile),
            schema_statements: self.schema_statements,
            files_restored: self.files_restored,
        }
    }
}

/// Everything one run accumulates.
struct RunContext {
    run_id: String,
    databases: Vec<DatabaseRun>,
    locks: LockCoordinator,
    archive: Option<ArchiveReader>,
    manifest: Option<ArchiveManifest>,
    /// Snapshot directory holding the source database's files.
    source_dir: Option<PathBuf>,
    drop_skipped: Vec<String>,
    indexes_recovered: Vec<PathBuf>,
    phases_completed: Vec<Phase>,
}

impl RunContext {
    fn new(plan: &WorkflowPlan) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            databases: plan.databases().into_iter().map(DatabaseRun::new).collect(),
            locks: LockCoordinator::new(),
            archive: None,
            manifest: None,
            source_dir: None,
            drop_skipped: Vec::new(),
            indexes_recovered: Vec::new(),
            phases_completed: Vec::new(),
        }
    }

    async fn close_sessions(&mut self) {
        for db in &mut self.databases {
            if let Some(mut handle) = db.handle.take() {
                handle.close().await;
            }
        }
    }
}

/// The only database of a single-database variant.
fn single(databases: &mut [DatabaseRun]) -> Result<&mut DatabaseRun> {
    match databases {
        [db] => Ok(db),
        _ => Err(BackupError::Workflow(format!(
            "expected exactly one database, found {}",
            databases.len()
        ))),
    }
}

fn blocking_failed(e: tokio::task::JoinError) -> BackupError {
    BackupError::Archive(format!("archive task failed: {}", e))
}

fn plan_mismatch(phase: Phase) -> BackupError {
    BackupError::Workflow(format!("phase {} does not apply to this plan", phase))
}

impl Orchestrator {
    /// Create an orchestrator using MariaDB sessions and the configured tools.
    ///
    /// Snapshot exports wait for confirmation on stdin unless another signal
    /// is set with [`Orchestrator::with_snapshot_signal`].
    pub fn new(config: Config) -> Result<Self> {
        let connector = MysqlConnector::new(config.session.clone());
        let dumper = MariadbDump::new(&config.tools);
        let checker = Myisamchk::new(&config.tools);
        let transfer = FileTransferEngine::new(&config.files)?;
        Ok(
            Self::with_components(
                config,
                Box::new(connector),
                Box::new(dumper),
                Box::new(checker),
                transfer,
            )
            .with_snapshot_signal(Box::new(StdinConfirmation)),
        )
    }

    /// Create an orchestrator from explicit collaborators.
    pub fn with_components(
        config: Config,
        connector: Box<dyn Connector>,
        dumper: Box<dyn SchemaDumper>,
        checker: Box<dyn IndexChecker>,
        transfer: FileTransferEngine,
    ) -> Self {
        Self {
            config,
            connector,
            dumper,
            checker,
            transfer,
            signal: None,
        }
    }

    /// Set how the operator confirms a snapshot.
    pub fn with_snapshot_signal(mut self, signal: Box<dyn SnapshotSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one workflow.
    pub async fn run(&mut self, plan: WorkflowPlan, cancel: CancellationToken) -> Result<RunReport> {
        let started_at = Utc::now();
        let variant = plan.variant();
        let mut ctx = RunContext::new(&plan);

        info!("Starting {} run: {}", variant, ctx.run_id);

        let outcome = self.drive(variant, &plan, &mut ctx, &cancel).await;
        let release = self.release_locks(&mut ctx).await;
        ctx.close_sessions().await;
        settle(outcome, release)?;

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let (archive, handoff) = match &plan {
            WorkflowPlan::ArchiveExport { archive, .. } | WorkflowPlan::ArchiveImport { archive, .. } => {
                (Some(archive.clone()), None)
            }
            WorkflowPlan::LiveSnapshotExport { handoff, .. }
            | WorkflowPlan::LiveSnapshotImport { handoff, .. } => (None, Some(handoff.clone())),
        };

        let report = RunReport {
            run_id: ctx.run_id.clone(),
            variant,
            status: "completed".to_string(),
            started_at,
            completed_at,
            duration_seconds: duration,
            databases: ctx.databases.iter().map(DatabaseRun::report).collect(),
            archive,
            archive_entries: ctx.manifest.as_ref().map(ArchiveManifest::entry_count),
            handoff,
            phases_completed: ctx.phases_completed.clone(),
            tables_drop_skipped: ctx.drop_skipped.clone(),
            indexes_recovered: ctx.indexes_recovered.clone(),
        };

        info!(
            "{} {}: {} databases, {} drop skips, {} index recoveries in {:.1}s",
            variant,
            report.status,
            report.databases.len(),
            report.tables_drop_skipped.len(),
            report.indexes_recovered.len(),
            report.duration_seconds
        );

        Ok(report)
    }

    async fn drive(
        &mut self,
        variant: Variant,
        plan: &WorkflowPlan,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let phases = variant.phases();
        for (i, &phase) in phases.iter().enumerate() {
            let result = if cancel.is_cancelled() && !phase.is_cleanup() {
                warn!("Cancellation requested before {}", phase);
                Err(BackupError::Cancelled)
            } else {
                info!("Phase {}/{}: {}", i + 1, phases.len(), phase);
                self.execute(phase, plan, ctx, cancel).await
            };

            if let Err(e) = result {
                error!("{} failed during {}: {}", variant, phase, e);
                return Err(BackupError::PhaseFailed {
                    variant,
                    phase,
                    hint: variant.recovery_hint(phase),
                    source: Box::new(e),
                });
            }
            ctx.phases_completed.push(phase);
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        phase: Phase,
        plan: &WorkflowPlan,
        ctx: &mut RunContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match phase {
            Phase::OpenArchive => self.open_archive(plan, ctx).await,
            Phase::LoadHandoff => self.load_handoff(plan, ctx),
            Phase::Connect => self.connect(ctx).await,
            Phase::Classify | Phase::EnumerateTables => self.classify(ctx).await,
            Phase::AcquireExportLock => self.acquire_export_locks(ctx).await,
            Phase::CaptureSchema => self.capture_schemas(ctx).await,
            Phase::ValidateFiles => self.validate_files(ctx).await,
            Phase::BuildArchive => self.build_archive(plan, ctx).await,
            Phase::WriteHandoff => self.write_handoff(plan, ctx),
            Phase::AwaitSnapshot => self.await_snapshot(ctx, cancel).await,
            Phase::RepairIndexes => self.repair_indexes(ctx).await,
            Phase::DropTables => self.drop_tables(ctx).await,
            Phase::CheckStaleFiles => self.check_stale_files(ctx),
            Phase::RecreateSchema => self.recreate_schema(ctx).await,
            Phase::DiscardTablespaces => self.discard_tablespaces(ctx).await,
            Phase::RestoreTransactionalFiles => self.restore_transactional_files(ctx).await,
            Phase::ImportTablespaces => self.import_tablespaces(ctx).await,
            Phase::AcquireWriteLock => self.acquire_write_locks(ctx).await,
            Phase::RestoreFlatFileFiles => self.restore_flat_file_files(ctx).await,
            Phase::ReleaseLocks => self.release_locks(ctx).await,
        }
    }

    async fn open_archive(&self, plan: &WorkflowPlan, ctx: &mut RunContext) -> Result<()> {
        let WorkflowPlan::ArchiveImport { archive, .. } = plan else {
            return Err(plan_mismatch(Phase::OpenArchive));
        };
        let reader = ArchiveReader::open(archive)?;
        let schema_reader = reader.clone();
        let raw = tokio::task::spawn_blocking(move || schema_reader.read_schema())
            .await
            .map_err(blocking_failed)??;

        let db = single(&mut ctx.databases)?;
        db.schema = Some(SchemaSnapshot::from_captured(db.target.database.clone(), &raw));
        info!("Read schema from {} ({} bytes)", archive.display(), raw.len());
        ctx.archive = Some(reader);
        Ok(())
    }

    fn load_handoff(&self, plan: &WorkflowPlan, ctx: &mut RunContext) -> Result<()> {
        let WorkflowPlan::LiveSnapshotImport {
            handoff,
            source_database,
            snapshot_data_dir,
            ..
        } = plan
        else {
            return Err(plan_mismatch(Phase::LoadHandoff));
        };

        let record = HandoffRecord::load(handoff)?;
        let entry = record.database(source_database)?;
        let source_dir = snapshot_data_dir.join(source_database);
        let tables = entry.tables();

        // Every file must be on the snapshot before the target is touched
        validate_required_files(&source_dir, tables.all())?;

        let db = single(&mut ctx.databases)?;
        db.schema = Some(SchemaSnapshot::from_captured(
            db.target.database.clone(),
            &entry.schema,
        ));
        db.set_tables(tables)?;
        ctx.source_dir = Some(source_dir);
        Ok(())
    }

    async fn connect(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &mut ctx.databases {
            let handle = DatabaseHandle::open(self.connector.as_ref(), db.target.clone()).await?;
            db.handle = Some(handle);
        }
        Ok(())
    }

    async fn classify(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &mut ctx.databases {
            let tables = classify_tables(db.handle()?.primary()).await?;
            db.set_tables(tables)?;
        }
        Ok(())
    }

    async fn acquire_export_locks(&self, ctx: &mut RunContext) -> Result<()> {
        let RunContext {
            databases, locks, ..
        } = ctx;
        for db in databases.iter_mut() {
            let tables = db.tables()?.all().to_vec();
            locks.acquire_export_lock(db.handle()?, &tables).await?;
        }
        Ok(())
    }

    async fn capture_schemas(&self, ctx: &mut RunContext) -> Result<()> {
        let extractor = SchemaExtractor::new(self.dumper.as_ref());
        let RunContext {
            databases, locks, ..
        } = ctx;
        for db in databases.iter_mut() {
            db.handle()?.ensure_usable().await?;
            let snapshot = extractor.capture(&db.target, locks).await?;
            db.schema = Some(snapshot);
        }
        Ok(())
    }

    async fn validate_files(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &mut ctx.databases {
            db.handle()?.ensure_usable().await?;
            validate_required_files(&db.target.database_dir(), db.tables()?.all())?;
        }
        Ok(())
    }

    async fn build_archive(&self, plan: &WorkflowPlan, ctx: &mut RunContext) -> Result<()> {
        let WorkflowPlan::ArchiveExport { archive, .. } = plan else {
            return Err(plan_mismatch(Phase::BuildArchive));
        };
        let db = single(&mut ctx.databases)?;

        let path = archive.clone();
        let level = self.config.archive.compression_level;
        let schema = db.schema()?.sql.clone();
        let source_dir = db.target.database_dir();
        let tables = db.tables()?.all().to_vec();
        let manifest = tokio::task::spawn_blocking(move || {
            write_archive(&path, level, &schema, &source_dir, &tables)
        })
        .await
        .map_err(blocking_failed)??;

        // Files copied after the lock was lost may be inconsistent
        if let Err(e) = db.handle()?.ensure_usable().await {
            if let Err(remove_err) = std::fs::remove_file(&manifest.path) {
                warn!(
                    "Could not remove archive {} written without a lock: {}",
                    manifest.path.display(),
                    remove_err
                );
            }
            return Err(e);
        }

        ctx.manifest = Some(manifest);
        Ok(())
    }

    fn write_handoff(&self, plan: &WorkflowPlan, ctx: &mut RunContext) -> Result<()> {
        let WorkflowPlan::LiveSnapshotExport { handoff, .. } = plan else {
            return Err(plan_mismatch(Phase::WriteHandoff));
        };
        let mut record = HandoffRecord::new(ctx.run_id.clone(), self.config.hash());
        for db in &ctx.databases {
            record.insert(db.tables()?, db.schema()?);
        }
        record.save(handoff)?;
        Ok(())
    }

    async fn await_snapshot(&mut self, ctx: &mut RunContext, cancel: &CancellationToken) -> Result<()> {
        for db in &mut ctx.databases {
            db.handle()?.ensure_usable().await?;
        }

        let timeout = self.config.snapshot.confirm_timeout();
        let timeout_secs = self.config.snapshot.confirm_timeout_secs;
        let signal = self.signal.as_mut().ok_or_else(|| {
            BackupError::Config("no snapshot confirmation signal configured".to_string())
        })?;

        info!(
            "Locks held on {} databases. Take the snapshot now and {} (waiting up to {}s)",
            ctx.databases.len(),
            signal.describe(),
            timeout_secs
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            waited = tokio::time::timeout(timeout, signal.wait_for_confirmation()) => match waited {
                Ok(confirmed) => confirmed?,
                Err(_) => return Err(BackupError::SnapshotTimeout(timeout_secs)),
            },
        }

        // A session lost while waiting dropped its locks mid-snapshot
        for db in &mut ctx.databases {
            if let Err(e) = db.handle()?.ensure_usable().await {
                error!("{}: lock lost while waiting for the snapshot", db.name());
                return Err(e);
            }
        }
        Ok(())
    }

    async fn repair_indexes(&self, ctx: &mut RunContext) -> Result<()> {
        let controller = IndexRepairController::new(self.checker.as_ref());
        for db in &ctx.databases {
            let report = controller.repair_directory(&db.target.database_dir()).await?;
            ctx.indexes_recovered.extend(report.recovered);
        }
        Ok(())
    }

    async fn drop_tables(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &mut ctx.databases {
            let session = db.handle()?.primary();
            let names = list_table_names(session).await?;
            let report = drop_all(session, &names).await?;
            ctx.drop_skipped.extend(report.skipped_names());
        }
        Ok(())
    }

    fn check_stale_files(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &ctx.databases {
            ensure_no_stale_data_files(&db.target.database_dir())?;
        }
        Ok(())
    }

    async fn recreate_schema(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &mut ctx.databases {
            let schema = db.schema()?.clone();
            db.schema_statements = apply_schema(db.handle()?.primary(), &schema).await?;
        }
        Ok(())
    }

    async fn discard_tablespaces(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &mut ctx.databases {
            let tables = db.tables_of(Engine::Transactional)?;
            let refs: Vec<&TableDescriptor> = tables.iter().collect();
            let (session, tablespaces) = db.primary_and_tablespaces()?;
            tablespaces.discard_all(session, &refs).await?;
        }
        Ok(())
    }

    async fn restore_transactional_files(&self, ctx: &mut RunContext) -> Result<()> {
        let RunContext {
            databases,
            archive,
            source_dir,
            ..
        } = ctx;
        for db in databases.iter_mut() {
            let tables = db.tables_of(Engine::Transactional)?;
            let dest = db.target.database_dir();
            let placed = self
                .place_files(archive.as_ref(), source_dir.as_deref(), &tables, &dest)
                .await?;
            for table in &tables {
                db.tablespaces.mark_replaced(table)?;
            }
            db.files_restored += placed;
        }
        Ok(())
    }

    async fn import_tablespaces(&self, ctx: &mut RunContext) -> Result<()> {
        for db in &mut ctx.databases {
            let tables = db.tables_of(Engine::Transactional)?;
            let refs: Vec<&TableDescriptor> = tables.iter().collect();
            let (session, tablespaces) = db.primary_and_tablespaces()?;
            tablespaces.import_all(session, &refs).await?;
        }
        Ok(())
    }

    async fn acquire_write_locks(&self, ctx: &mut RunContext) -> Result<()> {
        let RunContext {
            databases, locks, ..
        } = ctx;
        for db in databases.iter_mut() {
            let tables = db.tables_of(Engine::FlatFile)?;
            locks
                .acquire_write_lock(db.handle()?, self.connector.as_ref(), &tables)
                .await?;
        }
        Ok(())
    }

    async fn restore_flat_file_files(&self, ctx: &mut RunContext) -> Result<()> {
        let RunContext {
            databases,
            locks,
            archive,
            source_dir,
            ..
        } = ctx;
        for db in databases.iter_mut() {
            let tables = db.tables_of(Engine::FlatFile)?;
            if tables.is_empty() {
                continue;
            }
            if locks.state(db.name()) != LockState::WriteLocked {
                return Err(BackupError::LockState(format!(
                    "{}: flat-file tables must be write-locked before their files are replaced",
                    db.name()
                )));
            }

            db.handle()?.ensure_usable().await?;
            let dest = db.target.database_dir();
            let placed = self
                .place_files(archive.as_ref(), source_dir.as_deref(), &tables, &dest)
                .await?;
            db.handle()?.ensure_usable().await?;
            db.files_restored += placed;
        }
        Ok(())
    }

    /// Put the files of `tables` into `dest`, from the archive if there is
    /// one, otherwise from the snapshot directory.
    async fn place_files(
        &self,
        archive: Option<&ArchiveReader>,
        source_dir: Option<&Path>,
        tables: &[TableDescriptor],
        dest: &Path,
    ) -> Result<usize> {
        if tables.is_empty() {
            return Ok(0);
        }

        let placed = match (archive, source_dir) {
            (Some(reader), _) => {
                let reader = reader.clone();
                let wanted = tables.to_vec();
                let target_dir = dest.to_path_buf();
                let files = tokio::task::spawn_blocking(move || {
                    reader.extract_tables(&wanted, &target_dir)
                })
                .await
                .map_err(blocking_failed)??;
                self.transfer.normalize(&files).await?;
                files
            }
            (None, Some(dir)) => {
                let refs: Vec<&TableDescriptor> = tables.iter().collect();
                self.transfer.copy_tables(dir, dest, &refs).await?
            }
            (None, None) => {
                return Err(BackupError::Workflow(
                    "no archive or snapshot directory to restore files from".to_string(),
                ))
            }
        };
        debug!("Placed {} files into {}", placed.len(), dest.display());
        Ok(placed.len())
    }

    /// Release every database that still holds a lock.
    ///
    /// Each database is attempted even if an earlier release failed.
    async fn release_locks(&self, ctx: &mut RunContext) -> Result<()> {
        let RunContext {
            databases, locks, ..
        } = ctx;
        let mut first_error = None;
        for db in databases.iter_mut() {
            if locks.state(db.name()) == LockState::Unlocked {
                continue;
            }
            let Some(handle) = db.handle.as_mut() else {
                continue;
            };
            if let Err(e) = locks.release_all(handle).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Connect to every configured database and report reachability.
    pub async fn health_check(&self) -> HealthCheckResult {
        let targets = self
            .config
            .sources
            .iter()
            .map(|s| ("source", s))
            .chain(self.config.target.iter().map(|t| ("target", t)));

        let mut databases = Vec::new();
        for (role, target) in targets {
            let start = Instant::now();
            let outcome = match DatabaseHandle::open(self.connector.as_ref(), target.clone()).await {
                Ok(mut handle) => {
                    let usable = handle.ensure_usable().await;
                    handle.close().await;
                    usable
                }
                Err(e) => Err(e),
            };
            let latency_ms = start.elapsed().as_millis() as u64;
            if let Err(ref e) = outcome {
                warn!("Health check failed for {}: {}", target.label(), e);
            }
            databases.push(DatabaseHealth {
                role: role.to_string(),
                database: target.database.clone(),
                host: target.host.clone(),
                port: target.port,
                connected: outcome.is_ok(),
                latency_ms,
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        HealthCheckResult {
            healthy: !databases.is_empty() && databases.iter().all(|d| d.connected),
            databases,
        }
    }
}

impl RunReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests;
