//! 快照服务端到端测试

use assert_matches::assert_matches;
use chrono::{DateTime, TimeZone, Utc};
use db_snapshot_lib::audit::{AuditOperation, AuditStatus, MemoryAuditSink};
use db_snapshot_lib::database::PoolSettings;
use db_snapshot_lib::{
    BackupError, BackupService, CancelToken, Clock, Principal, RestoreState, SnapshotDatabase,
    SnapshotOrigin, SnapshotStore,
};
use std::io::Read;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// 按预设序列返回时间的时钟
struct ScriptedClock {
    times: Mutex<Vec<DateTime<Utc>>>,
}

impl ScriptedClock {
    fn new(mut times: Vec<DateTime<Utc>>) -> Self {
        times.reverse();
        Self {
            times: Mutex::new(times),
        }
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> DateTime<Utc> {
        let mut times = self.times.lock().unwrap();
        if times.len() > 1 {
            times.pop().unwrap()
        } else {
            times[0]
        }
    }

    fn wait_for_next_second(&self, _now: DateTime<Utc>) {}
}

struct Harness {
    dir: TempDir,
    service: BackupService,
    audit: Arc<MemoryAuditSink>,
}

fn harness(clock: Arc<dyn Clock>) -> Harness {
    let dir = TempDir::new().unwrap();
    let database =
        SnapshotDatabase::open(&dir.path().join("app.db"), PoolSettings::default()).unwrap();
    database
        .get_conn()
        .unwrap()
        .execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             CREATE TABLE orders (
                 id INTEGER PRIMARY KEY,
                 customer_id INTEGER NOT NULL REFERENCES customers(id),
                 total REAL,
                 receipt BLOB
             );
             CREATE INDEX idx_orders_customer ON orders(customer_id);
             INSERT INTO customers (name) VALUES ('Ada'), ('Grace'), ('O''Neil');
             INSERT INTO orders (customer_id, total, receipt) VALUES
                 (1, 10.5, X'DEADBEEF'), (2, 0.1, NULL), (3, -2.0, NULL), (3, 1e10, X'00');",
        )
        .unwrap();
    let store = SnapshotStore::open(dir.path().join("backups")).unwrap();
    let audit = Arc::new(MemoryAuditSink::new());
    let service = BackupService::new(database, store, audit.clone()).with_clock(clock);
    Harness {
        dir,
        service,
        audit,
    }
}

fn count(service: &BackupService, table: &str) -> i64 {
    service
        .database()
        .get_conn()
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .unwrap()
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
}

#[test]
fn new_year_backup_and_restore_scenario() {
    let clock = Arc::new(ScriptedClock::new(vec![at(0, 0, 0), at(0, 1, 0)]));
    let h = harness(clock);
    let root = Principal::elevated("root");

    let backup = h.service.create_backup(&root).unwrap();
    assert_eq!(backup.name, "db-backup-2024-01-01-000000.sql");

    h.service
        .database()
        .get_conn()
        .unwrap()
        .execute_batch("DELETE FROM orders; INSERT INTO customers (name) VALUES ('Eve');")
        .unwrap();

    let outcome = h
        .service
        .restore_backup(&root, &backup.name, true, CancelToken::new())
        .unwrap();
    assert_eq!(outcome.state, RestoreState::Committed);
    let safety = outcome.safety_snapshot.unwrap();
    assert_eq!(safety.name, "pre-restore-backup-2024-01-01-000100.sql");

    assert_eq!(count(&h.service, "customers"), 3);
    assert_eq!(count(&h.service, "orders"), 4);

    let names: Vec<String> = h
        .service
        .list_backups(&root)
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(
        names,
        vec![
            "pre-restore-backup-2024-01-01-000100.sql",
            "db-backup-2024-01-01-000000.sql",
        ]
    );
}

#[test]
fn backup_restores_into_an_empty_database_with_identical_row_counts() {
    let clock = Arc::new(ScriptedClock::new(vec![at(8, 0, 0), at(8, 0, 1)]));
    let source = harness(clock.clone());
    let root = Principal::elevated("root");
    let backup = source.service.create_backup(&root).unwrap();

    // 新数据库共享同一快照目录
    let empty_dir = TempDir::new().unwrap();
    let database =
        SnapshotDatabase::open(&empty_dir.path().join("empty.db"), PoolSettings::default())
            .unwrap();
    let store = SnapshotStore::open(source.dir.path().join("backups")).unwrap();
    let target = BackupService::new(database, store, Arc::new(MemoryAuditSink::new()))
        .with_clock(clock);

    let outcome = target
        .restore_backup(&root, &backup.name, true, CancelToken::new())
        .unwrap();
    assert_eq!(outcome.state, RestoreState::Committed);

    for table in ["customers", "orders"] {
        assert_eq!(count(&target, table), count(&source.service, table));
    }
    let receipt: Vec<u8> = target
        .database()
        .get_conn()
        .unwrap()
        .query_row("SELECT receipt FROM orders WHERE id = 1", [], |r| r.get(0))
        .unwrap();
    assert_eq!(receipt, vec![0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn traversal_names_never_escape_the_snapshot_directory() {
    let h = harness(Arc::new(ScriptedClock::new(vec![at(0, 0, 0)])));
    let outside = h.dir.path().join("app.db");
    let admin = Principal::standard("alice");

    assert_matches!(
        h.service.delete_backup(&admin, "../app.db"),
        Err(BackupError::NotFound(_))
    );
    assert_matches!(
        h.service.download_backup(&admin, "../../../../etc/passwd"),
        Err(BackupError::NotFound(_))
    );
    assert_matches!(
        h.service.delete_backup(&admin, "../"),
        Err(BackupError::Validation(_))
    );
    assert!(outside.exists());
}

#[test]
fn standard_tier_manages_snapshots_but_cannot_restore() {
    let h = harness(Arc::new(ScriptedClock::new(vec![at(0, 0, 0)])));
    let admin = Principal::standard("alice");

    let backup = h.service.create_backup(&admin).unwrap();
    let mut bytes = Vec::new();
    h.service
        .download_backup(&admin, &backup.name)
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    assert_eq!(bytes.len() as u64, backup.size);

    assert_matches!(
        h.service
            .restore_backup(&admin, &backup.name, false, CancelToken::new()),
        Err(BackupError::Forbidden { .. })
    );

    h.service.delete_backup(&admin, &backup.name).unwrap();
    assert!(h.service.list_backups(&admin).unwrap().is_empty());

    let ops: Vec<_> = h
        .audit
        .records()
        .into_iter()
        .map(|r| (r.operation, r.status))
        .collect();
    assert_eq!(
        ops,
        vec![
            (AuditOperation::Create, AuditStatus::Completed),
            (AuditOperation::Download, AuditStatus::Completed),
            (AuditOperation::Restore, AuditStatus::Failed),
            (AuditOperation::Delete, AuditStatus::Completed),
            (AuditOperation::List, AuditStatus::Completed),
        ]
    );
}

#[test]
fn failed_restore_leaves_database_unchanged_and_names_safety_snapshot() {
    let clock = Arc::new(ScriptedClock::new(vec![at(1, 0, 0), at(1, 0, 5)]));
    let h = harness(clock);
    let root = Principal::elevated("root");
    let store = h.service.store().clone();
    store
        .put(
            "db-backup-2023-12-31-120000.sql",
            b"DELETE FROM orders;\nINSERT INTO nowhere VALUES (1);\n",
        )
        .unwrap();

    let err = h
        .service
        .restore_backup(&root, "db-backup-2023-12-31-120000.sql", true, CancelToken::new())
        .unwrap_err();

    assert_matches!(
        err,
        BackupError::PartialFailure { state: RestoreState::RolledBack, .. }
    );
    let safety = err.safety_snapshot().unwrap();
    assert_eq!(safety, "pre-restore-backup-2024-01-01-010000.sql");
    let info = store.stat(safety).unwrap();
    assert_eq!(info.origin, SnapshotOrigin::PreRestore);
    assert_eq!(count(&h.service, "orders"), 4);
}

#[test]
fn unconfirmed_restore_is_a_dry_run() {
    let h = harness(Arc::new(ScriptedClock::new(vec![at(2, 0, 0), at(2, 0, 1)])));
    let root = Principal::elevated("root");
    let backup = h.service.create_backup(&root).unwrap();

    let outcome = h
        .service
        .restore_backup(&root, &backup.name, false, CancelToken::new())
        .unwrap();
    assert_eq!(outcome.state, RestoreState::AwaitingConfirmation);
    assert!(outcome.safety_snapshot.is_none());
    assert_eq!(h.service.list_backups(&root).unwrap().len(), 1);

    assert_matches!(
        h.service
            .restore_backup(&root, "db-backup-1999-01-01-000000.sql", false, CancelToken::new()),
        Err(BackupError::NotFound(_))
    );
}

#[test]
fn same_second_backups_get_distinct_names() {
    let clock = Arc::new(ScriptedClock::new(vec![
        at(3, 0, 0),
        at(3, 0, 0),
        at(3, 0, 1),
    ]));
    let h = harness(clock);
    let admin = Principal::standard("alice");

    let first = h.service.create_backup(&admin).unwrap();
    let second = h.service.create_backup(&admin).unwrap();
    assert_eq!(first.name, "db-backup-2024-01-01-030000.sql");
    assert_eq!(second.name, "db-backup-2024-01-01-030001.sql");
}
