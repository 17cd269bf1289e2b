use std::collections::BTreeSet;
use std::fs::File;
use std::time::Duration;

use flate2::read::GzDecoder;
use tempfile::TempDir;

use super::*;
use crate::error::{EXIT_CANCELLED, EXIT_TIMEOUT};
use crate::schema::{sanitize, split_statements};
use crate::testing::{database_in, FakeChecker, FakeDumper, ManualSignal, ScriptedConnector};

const DUMP: &str = "/*M!999999\\- enable the sandbox mode */ \n\
CREATE TABLE `a` (\n  `id` int(11) NOT NULL\n) ENGINE=InnoDB;\n\
CREATE TABLE `b` (\n  `id` int(11) NOT NULL\n) ENGINE=MyISAM;\n\
/*!50013 DEFINER=`admin`@`%` SQL SECURITY DEFINER */\n\
/*!50001 VIEW `v` AS select 1 AS `x` */;\n";

fn write_files(dir: &Path, names: &[&str]) {
    std::fs::create_dir_all(dir).unwrap();
    for name in names {
        std::fs::write(dir.join(name), format!("contents of {}", name)).unwrap();
    }
}

fn orchestrator(
    connector: &ScriptedConnector,
    dumper: FakeDumper,
    checker: FakeChecker,
    config: Config,
) -> Orchestrator {
    Orchestrator::with_components(
        config,
        Box::new(connector.clone()),
        Box::new(dumper),
        Box::new(checker),
        FileTransferEngine::with_owner(None),
    )
}

fn archive_entry_names(path: &Path) -> BTreeSet<String> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

fn failed_phase(err: &BackupError) -> Phase {
    match err {
        BackupError::PhaseFailed { phase, .. } => *phase,
        other => panic!("expected a phase failure, got {other:?}"),
    }
}

// ---------- archive export ----------

struct ExportFixture {
    _dir: TempDir,
    data_dir: PathBuf,
    archive: PathBuf,
}

fn export_fixture(files: &[&str]) -> ExportFixture {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("mysql");
    write_files(&data_dir.join("shop"), files);
    let archive = dir.path().join("shop.tar.gz");
    ExportFixture {
        _dir: dir,
        data_dir,
        archive,
    }
}

fn export_plan(fixture: &ExportFixture) -> WorkflowPlan {
    WorkflowPlan::ArchiveExport {
        source: database_in("shop", &fixture.data_dir),
        archive: fixture.archive.clone(),
    }
}

#[tokio::test]
async fn test_archive_export_packs_schema_and_all_sidecars() {
    let fixture = export_fixture(&["a.ibd", "a.cfg", "b.MYD", "b.MYI", "db.opt"]);
    let connector =
        ScriptedConnector::new().with_catalog("shop", &[("a", "InnoDB"), ("b", "MyISAM")]);
    let dumper = FakeDumper::new().with_output("shop", DUMP);
    let mut orch = orchestrator(&connector, dumper, FakeChecker::healthy(), Config::default());

    let report = orch
        .run(export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap();

    let expected: BTreeSet<String> = ["schema.sql", "a.ibd", "a.cfg", "b.MYD", "b.MYI"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(archive_entry_names(&fixture.archive), expected);
    assert_eq!(report.archive_entries, Some(5));

    let schema = ArchiveReader::open(&fixture.archive)
        .unwrap()
        .read_schema()
        .unwrap();
    assert_eq!(schema, sanitize(DUMP));

    let log = connector.log();
    assert_eq!(log.count("FLUSH TABLES `a`, `b` FOR EXPORT"), 1);
    assert_eq!(log.count("UNLOCK TABLES"), 1);
    assert_eq!(log.sessions_closed(), log.sessions_opened());
    assert_eq!(report.databases[0].transactional_tables, 1);
    assert_eq!(report.databases[0].flat_file_tables, 1);
    assert_eq!(report.phases_completed, Variant::ArchiveExport.phases());
}

#[tokio::test]
async fn test_archive_export_missing_sidecar_aborts_and_releases() {
    let fixture = export_fixture(&["a.ibd", "b.MYD", "b.MYI"]);
    let connector =
        ScriptedConnector::new().with_catalog("shop", &[("a", "InnoDB"), ("b", "MyISAM")]);
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new().with_output("shop", DUMP),
        FakeChecker::healthy(),
        Config::default(),
    );

    let err = orch
        .run(export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::ValidateFiles);
    match err.root() {
        BackupError::FileNotFound {
            table, extension, ..
        } => {
            assert_eq!(table, "a");
            assert_eq!(extension, "cfg");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!fixture.archive.exists());
    assert_eq!(connector.log().count("UNLOCK TABLES"), 1);
}

#[tokio::test]
async fn test_archive_export_dump_failure_releases_lock() {
    let fixture = export_fixture(&["a.ibd", "a.cfg"]);
    let connector = ScriptedConnector::new().with_catalog("shop", &[("a", "InnoDB")]);
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new().with_failure("shop", "mariadb-dump: Got error: 1045"),
        FakeChecker::healthy(),
        Config::default(),
    );

    let err = orch
        .run(export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::CaptureSchema);
    assert!(err.to_string().contains("Recovery:"));
    assert!(matches!(err.root(), BackupError::SchemaExport { .. }));
    assert_eq!(connector.log().count("UNLOCK TABLES"), 1);
    assert!(!fixture.archive.exists());
}

#[tokio::test]
async fn test_unsupported_engine_aborts_before_locking() {
    let fixture = export_fixture(&["a.ibd", "a.cfg"]);
    let connector =
        ScriptedConnector::new().with_catalog("shop", &[("a", "InnoDB"), ("m", "MEMORY")]);
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );

    let err = orch
        .run(export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::Classify);
    assert!(matches!(err.root(), BackupError::UnsupportedEngine { .. }));
    let log = connector.log();
    assert_eq!(log.count_prefix("FLUSH TABLES"), 0);
    assert_eq!(log.count("UNLOCK TABLES"), 0);
}

#[tokio::test]
async fn test_cancelled_before_start_does_not_connect() {
    let fixture = export_fixture(&[]);
    let connector = ScriptedConnector::new();
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orch.run(export_plan(&fixture), cancel).await.unwrap_err();
    assert_eq!(failed_phase(&err), Phase::Connect);
    assert_eq!(err.exit_code(), EXIT_CANCELLED);
    assert_eq!(connector.log().sessions_opened(), 0);
}

#[tokio::test]
async fn test_cancel_during_build_archive_still_releases_and_completes() {
    let fixture = export_fixture(&["a.ibd", "a.cfg", "b.MYD", "b.MYI"]);
    let cancel = CancellationToken::new();
    // Checks: capture schema, validate files, then the one after the archive is written
    let connector = ScriptedConnector::new()
        .with_catalog("shop", &[("a", "InnoDB"), ("b", "MyISAM")])
        .cancel_on_check(3, cancel.clone());
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new().with_output("shop", DUMP),
        FakeChecker::healthy(),
        Config::default(),
    );

    let report = orch.run(export_plan(&fixture), cancel.clone()).await.unwrap();

    assert!(cancel.is_cancelled());
    assert!(fixture.archive.exists());
    assert_eq!(report.archive_entries, Some(5));
    assert_eq!(report.phases_completed.last(), Some(&Phase::ReleaseLocks));
    assert_eq!(connector.log().count("UNLOCK TABLES"), 1);
}

#[tokio::test]
async fn test_archive_export_release_failure_reports_written_archive() {
    let fixture = export_fixture(&["a.ibd", "a.cfg"]);
    let connector = ScriptedConnector::new()
        .with_catalog("shop", &[("a", "InnoDB")])
        .fail_on("UNLOCK TABLES");
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new().with_output("shop", DUMP),
        FakeChecker::healthy(),
        Config::default(),
    );

    let err = orch
        .run(export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::ReleaseLocks);
    assert!(fixture.archive.exists());
    let message = err.to_string();
    assert!(message.contains("archive was written"), "{message}");
    assert!(!message.contains("no archive was written"), "{message}");
}

// ---------- archive import ----------

struct ImportFixture {
    _dir: TempDir,
    data_dir: PathBuf,
    archive: PathBuf,
}

fn import_fixture() -> ImportFixture {
    let dir = TempDir::new().unwrap();
    let source_dir = dir.path().join("source");
    write_files(&source_dir, &["a.ibd", "a.cfg", "b.MYD", "b.MYI"]);
    let archive = dir.path().join("shop.tar.gz");
    let tables = vec![
        TableDescriptor::new("a", Engine::Transactional),
        TableDescriptor::new("b", Engine::FlatFile),
    ];
    write_archive(&archive, 1, &sanitize(DUMP), &source_dir, &tables).unwrap();

    let data_dir = dir.path().join("mysql");
    std::fs::create_dir_all(data_dir.join("shop_restore")).unwrap();
    ImportFixture {
        _dir: dir,
        data_dir,
        archive,
    }
}

fn import_plan(fixture: &ImportFixture) -> WorkflowPlan {
    WorkflowPlan::ArchiveImport {
        target: database_in("shop_restore", &fixture.data_dir),
        archive: fixture.archive.clone(),
    }
}

#[tokio::test]
async fn test_archive_import_restores_both_engines() {
    let fixture = import_fixture();
    let connector = ScriptedConnector::new()
        .with_catalog("shop_restore", &[("old", "InnoDB")])
        .with_catalog("shop_restore", &[("a", "InnoDB"), ("b", "MyISAM")]);
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );

    let report = orch
        .run(import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap();

    let target_dir = fixture.data_dir.join("shop_restore");
    for name in ["a.ibd", "a.cfg", "b.MYD", "b.MYI"] {
        assert_eq!(
            std::fs::read_to_string(target_dir.join(name)).unwrap(),
            format!("contents of {}", name)
        );
    }

    let log = connector.log();
    let at = |prefix: &str| log.position(prefix).unwrap();
    assert!(at("DROP TABLE IF EXISTS `old`") < at("CREATE TABLE `a`"));
    assert!(at("CREATE TABLE `a`") < at("ALTER TABLE `a` DISCARD TABLESPACE"));
    assert!(at("ALTER TABLE `a` DISCARD TABLESPACE") < at("ALTER TABLE `a` IMPORT TABLESPACE"));
    assert!(at("ALTER TABLE `a` IMPORT TABLESPACE") < at("LOCK TABLES `b` WRITE"));
    assert_eq!(log.find("LOCK TABLES `b` WRITE").unwrap().session, 1);
    // The DEFINER comment never reaches the server
    assert!(log.statements().iter().all(|s| !s.contains("DEFINER")));
    assert_eq!(log.count("UNLOCK TABLES"), 2);

    let db = &report.databases[0];
    assert_eq!(db.files_restored, 4);
    assert_eq!(db.schema_statements, 3);
    assert!(report.tables_drop_skipped.is_empty());
}

#[tokio::test]
async fn test_archive_import_stale_file_aborts_before_schema_recreation() {
    let fixture = import_fixture();
    write_files(&fixture.data_dir.join("shop_restore"), &["ghost.ibd"]);
    let connector = ScriptedConnector::new().with_catalog("shop_restore", &[]);
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );

    let err = orch
        .run(import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::CheckStaleFiles);
    assert!(matches!(err.root(), BackupError::StaleFile { .. }));
    assert_eq!(connector.log().count_prefix("CREATE TABLE"), 0);
}

#[tokio::test]
async fn test_archive_import_drop_failures_are_skipped() {
    let fixture = import_fixture();
    let connector = ScriptedConnector::new()
        .with_catalog("shop_restore", &[("locked", "InnoDB")])
        .with_catalog("shop_restore", &[("a", "InnoDB"), ("b", "MyISAM")])
        .fail_on("DROP TABLE IF EXISTS `locked`");
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );

    let report = orch
        .run(import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.tables_drop_skipped, vec!["locked"]);
}

#[tokio::test]
async fn test_archive_import_import_failure_reports_incomplete_state() {
    let fixture = import_fixture();
    let connector = ScriptedConnector::new()
        .with_catalog("shop_restore", &[])
        .with_catalog("shop_restore", &[("a", "InnoDB"), ("b", "MyISAM")])
        .fail_on("ALTER TABLE `a` IMPORT");
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );

    let err = orch
        .run(import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::ImportTablespaces);
    assert!(err.to_string().contains("without attached tablespaces"));
    let log = connector.log();
    assert_eq!(log.count_prefix("LOCK TABLES"), 0);
    assert_eq!(log.sessions_closed(), log.sessions_opened());
}

#[tokio::test]
async fn test_cancel_during_flat_file_restore_finishes_the_import() {
    let fixture = import_fixture();
    let cancel = CancellationToken::new();
    // The first usability check is taken inside the flat-file restore
    let connector = ScriptedConnector::new()
        .with_catalog("shop_restore", &[])
        .with_catalog("shop_restore", &[("a", "InnoDB"), ("b", "MyISAM")])
        .cancel_on_check(1, cancel.clone());
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );

    let report = orch.run(import_plan(&fixture), cancel.clone()).await.unwrap();

    assert!(cancel.is_cancelled());
    assert_eq!(report.databases[0].files_restored, 4);
    let target_dir = fixture.data_dir.join("shop_restore");
    assert_eq!(
        std::fs::read_to_string(target_dir.join("b.MYD")).unwrap(),
        "contents of b.MYD"
    );
    assert_eq!(connector.log().count("UNLOCK TABLES"), 2);
}

#[tokio::test]
async fn test_exported_archive_restores_same_tables_and_schema() {
    let fixture = export_fixture(&["a.ibd", "a.cfg", "b.MYD", "b.MYI"]);
    let source = ScriptedConnector::new().with_catalog("shop", &[("a", "InnoDB"), ("b", "MyISAM")]);
    let mut export = orchestrator(
        &source,
        FakeDumper::new().with_output("shop", DUMP),
        FakeChecker::healthy(),
        Config::default(),
    );
    let exported = export
        .run(export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap();

    let target_dir = fixture.data_dir.join("shop_restore");
    std::fs::create_dir_all(&target_dir).unwrap();
    let target = ScriptedConnector::new()
        .with_catalog("shop_restore", &[])
        .with_catalog("shop_restore", &[("a", "InnoDB"), ("b", "MyISAM")]);
    let mut import = orchestrator(
        &target,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );
    let plan = WorkflowPlan::ArchiveImport {
        target: database_in("shop_restore", &fixture.data_dir),
        archive: fixture.archive.clone(),
    };
    let imported = import.run(plan, CancellationToken::new()).await.unwrap();

    let (before, after) = (&exported.databases[0], &imported.databases[0]);
    assert_eq!(before.transactional_tables, after.transactional_tables);
    assert_eq!(before.flat_file_tables, after.flat_file_tables);

    // The target replays exactly the sanitized statements, in order
    let expected = split_statements(&sanitize(DUMP));
    assert_eq!(after.schema_statements, expected.len());
    let log = target.log();
    let positions: Vec<usize> = expected
        .iter()
        .map(|statement| log.position(statement).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    for name in ["a.ibd", "a.cfg", "b.MYD", "b.MYI"] {
        assert_eq!(
            std::fs::read(target_dir.join(name)).unwrap(),
            std::fs::read(fixture.data_dir.join("shop").join(name)).unwrap()
        );
    }
}

// ---------- live snapshot export ----------

struct LiveExportFixture {
    _dir: TempDir,
    data_dir: PathBuf,
    handoff: PathBuf,
}

fn live_export_fixture() -> LiveExportFixture {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("mysql");
    write_files(&data_dir.join("shop"), &["a.ibd", "a.cfg", "b.MYD", "b.MYI"]);
    write_files(&data_dir.join("blog"), &["posts.ibd", "posts.cfg"]);
    let handoff = dir.path().join("snapshot.json");
    LiveExportFixture {
        _dir: dir,
        data_dir,
        handoff,
    }
}

fn live_export_plan(fixture: &LiveExportFixture) -> WorkflowPlan {
    WorkflowPlan::LiveSnapshotExport {
        sources: vec![
            database_in("shop", &fixture.data_dir),
            database_in("blog", &fixture.data_dir),
        ],
        handoff: fixture.handoff.clone(),
    }
}

fn live_connector() -> ScriptedConnector {
    ScriptedConnector::new()
        .with_catalog("shop", &[("a", "InnoDB"), ("b", "MyISAM")])
        .with_catalog("blog", &[("posts", "InnoDB")])
}

#[tokio::test]
async fn test_live_export_locks_all_then_writes_handoff() {
    let fixture = live_export_fixture();
    let connector = live_connector();
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new().with_output("shop", DUMP),
        FakeChecker::healthy(),
        Config::default(),
    )
    .with_snapshot_signal(Box::new(ManualSignal::immediate()));

    orch.run(live_export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap();

    let record = HandoffRecord::load(&fixture.handoff).unwrap();
    let shop = record.database("shop").unwrap();
    assert_eq!(shop.transactional_tables, vec!["a"]);
    assert_eq!(shop.flat_file_tables, vec!["b"]);
    assert_eq!(shop.schema, sanitize(DUMP));
    assert_eq!(record.database("blog").unwrap().transactional_tables, vec!["posts"]);

    let log = connector.log();
    assert_eq!(log.count_prefix("FLUSH TABLES"), 2);
    assert_eq!(log.count("UNLOCK TABLES"), 2);
    // Both databases are locked before either is released
    let last_flush = log.position("FLUSH TABLES `posts`").unwrap();
    assert!(last_flush < log.position("UNLOCK TABLES").unwrap());
}

#[tokio::test]
async fn test_live_export_timeout_releases_all_locks() {
    let fixture = live_export_fixture();
    let connector = live_connector();
    let mut config = Config::default();
    config.snapshot.confirm_timeout_secs = 1;
    let mut orch = orchestrator(&connector, FakeDumper::new(), FakeChecker::healthy(), config)
        .with_snapshot_signal(Box::new(ManualSignal::never()));

    let err = orch
        .run(live_export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::AwaitSnapshot);
    assert_eq!(err.exit_code(), EXIT_TIMEOUT);
    assert!(err.to_string().contains("discard it"));
    assert_eq!(connector.log().count("UNLOCK TABLES"), 2);
}

#[tokio::test]
async fn test_live_export_cancellation_releases_all_locks() {
    let fixture = live_export_fixture();
    let connector = live_connector();
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    )
    .with_snapshot_signal(Box::new(ManualSignal::never()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = orch
        .run(live_export_plan(&fixture), cancel)
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), EXIT_CANCELLED);
    assert_eq!(connector.log().count("UNLOCK TABLES"), 2);
}

#[tokio::test]
async fn test_live_export_lost_session_fails_before_handoff() {
    let fixture = live_export_fixture();
    let connector = live_connector().lose_connection_after("FLUSH TABLES");
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    )
    .with_snapshot_signal(Box::new(ManualSignal::immediate()));

    let err = orch
        .run(live_export_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::CaptureSchema);
    assert!(matches!(err.root(), BackupError::Connection { .. }));
    assert!(!fixture.handoff.exists());
}

// ---------- live snapshot import ----------

struct LiveImportFixture {
    _dir: TempDir,
    data_dir: PathBuf,
    snapshot_dir: PathBuf,
    handoff: PathBuf,
}

fn live_import_fixture() -> LiveImportFixture {
    let dir = TempDir::new().unwrap();
    let snapshot_dir = dir.path().join("snapshot/var/lib/mysql");
    write_files(
        &snapshot_dir.join("shop"),
        &["a.ibd", "a.cfg", "b.MYD", "b.MYI"],
    );
    let data_dir = dir.path().join("mysql");
    let target_dir = data_dir.join("shop_restore");
    std::fs::create_dir_all(&target_dir).unwrap();
    std::fs::write(target_dir.join("b.MYI"), "stale b.MYI").unwrap();
    std::fs::write(target_dir.join("b.MYD"), "stale b.MYD").unwrap();

    let handoff = dir.path().join("snapshot.json");
    let tables = TableSet::classify(vec![
        ("a".to_string(), "InnoDB".to_string()),
        ("b".to_string(), "MyISAM".to_string()),
    ])
    .unwrap();
    let mut record = HandoffRecord::new("export-run", "hash");
    record.insert(&tables, &SchemaSnapshot::from_captured("shop", DUMP));
    record.save(&handoff).unwrap();

    LiveImportFixture {
        _dir: dir,
        data_dir,
        snapshot_dir,
        handoff,
    }
}

fn live_import_plan(fixture: &LiveImportFixture) -> WorkflowPlan {
    WorkflowPlan::LiveSnapshotImport {
        target: database_in("shop_restore", &fixture.data_dir),
        handoff: fixture.handoff.clone(),
        source_database: "shop".to_string(),
        snapshot_data_dir: fixture.snapshot_dir.clone(),
    }
}

fn restore_connector() -> ScriptedConnector {
    ScriptedConnector::new().with_catalog("shop_restore", &[("b", "MyISAM")])
}

#[tokio::test]
async fn test_live_import_clean_indexes_skip_recovery() {
    let fixture = live_import_fixture();
    let connector = restore_connector();
    let checker = FakeChecker::healthy();
    let mut orch = orchestrator(&connector, FakeDumper::new(), checker.clone(), Config::default());

    let report = orch
        .run(live_import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap();

    assert!(checker.calls().iter().all(|(op, _)| op == "check"));
    assert!(report.indexes_recovered.is_empty());
    let target_dir = fixture.data_dir.join("shop_restore");
    assert_eq!(
        std::fs::read_to_string(target_dir.join("a.cfg")).unwrap(),
        "contents of a.cfg"
    );
    assert_eq!(
        std::fs::read_to_string(target_dir.join("b.MYD")).unwrap(),
        "contents of b.MYD"
    );

    let log = connector.log();
    let at = |prefix: &str| log.position(prefix).unwrap();
    assert!(at("DROP TABLE IF EXISTS `b`") < at("CREATE TABLE `a`"));
    assert!(at("ALTER TABLE `a` DISCARD") < at("ALTER TABLE `a` IMPORT"));
    assert!(at("ALTER TABLE `a` IMPORT") < at("LOCK TABLES `b` WRITE"));
    assert_eq!(log.count("UNLOCK TABLES"), 2);
}

#[tokio::test]
async fn test_live_import_recovers_failed_index_once() {
    let fixture = live_import_fixture();
    let connector = restore_connector();
    let checker = FakeChecker::new(false, true);
    let mut orch = orchestrator(&connector, FakeDumper::new(), checker.clone(), Config::default());

    let report = orch
        .run(live_import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap();

    let index = fixture.data_dir.join("shop_restore/b.MYI");
    assert_eq!(report.indexes_recovered, vec![index.clone()]);
    assert_eq!(
        checker.calls(),
        vec![("check".to_string(), index.clone()), ("recover".to_string(), index)]
    );
}

#[tokio::test]
async fn test_live_import_unrecoverable_index_aborts_before_copy() {
    let fixture = live_import_fixture();
    let connector = restore_connector();
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::new(false, false),
        Config::default(),
    );

    let err = orch
        .run(live_import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::RepairIndexes);
    assert_eq!(err.exit_code(), crate::error::EXIT_REPAIR_ERROR);
    let target_dir = fixture.data_dir.join("shop_restore");
    assert_eq!(
        std::fs::read_to_string(target_dir.join("b.MYD")).unwrap(),
        "stale b.MYD"
    );
    assert!(!target_dir.join("a.ibd").exists());
    assert_eq!(connector.log().count_prefix("DROP TABLE"), 0);
}

#[tokio::test]
async fn test_live_import_missing_snapshot_file_fails_before_connecting() {
    let fixture = live_import_fixture();
    std::fs::remove_file(fixture.snapshot_dir.join("shop/a.cfg")).unwrap();
    let connector = restore_connector();
    let mut orch = orchestrator(
        &connector,
        FakeDumper::new(),
        FakeChecker::healthy(),
        Config::default(),
    );

    let err = orch
        .run(live_import_plan(&fixture), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(failed_phase(&err), Phase::LoadHandoff);
    assert!(matches!(err.root(), BackupError::FileNotFound { .. }));
    assert_eq!(connector.log().sessions_opened(), 0);
}

// ---------- misc ----------

#[test]
fn test_table_set_is_captured_once() {
    let mut db = DatabaseRun::new(crate::testing::database("shop"));
    db.set_tables(TableSet::default()).unwrap();
    let err = db.set_tables(TableSet::default()).unwrap_err();
    assert!(matches!(err, BackupError::Workflow(_)));
}

#[tokio::test]
async fn test_health_check_reports_each_database() {
    let connector = ScriptedConnector::new().fail_connect("blog");
    let config = Config {
        sources: vec![
            crate::testing::database("shop"),
            crate::testing::database("blog"),
        ],
        ..Config::default()
    };
    let orch = orchestrator(&connector, FakeDumper::new(), FakeChecker::healthy(), config);

    let result = orch.health_check().await;
    assert!(!result.healthy);
    assert_eq!(result.databases.len(), 2);
    assert!(result.databases[0].connected);
    assert!(result.databases[1].error.as_deref().unwrap().contains("refused"));
}

#[test]
fn test_run_report_json() {
    let report = RunReport {
        run_id: "r1".to_string(),
        variant: Variant::ArchiveExport,
        status: "completed".to_string(),
        started_at: Utc::now(),
        completed_at: Utc::now(),
        duration_seconds: 1.5,
        databases: Vec::new(),
        archive: Some(PathBuf::from("/backups/shop.tar.gz")),
        archive_entries: Some(5),
        handoff: None,
        phases_completed: vec![Phase::Connect],
        tables_drop_skipped: Vec::new(),
        indexes_recovered: Vec::new(),
    };
    let json = report.to_json().unwrap();
    assert!(json.contains("\"variant\": \"archive_export\""));
    assert!(json.contains("\"connect\""));
    assert!(!json.contains("handoff"));
}
