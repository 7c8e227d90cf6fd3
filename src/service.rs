//! 快照服务
//!
//! 对外的操作面：每个调用先按信任等级做能力检查，再委派给导出器、
//! 生命周期管理器或恢复编排器。创建快照与已确认的恢复在同一把
//! 按数据库划分的操作锁下串行执行；锁文件放在快照目录中，
//! 多个进程共用同一目录时同样互斥。

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::audit::{emit, AuditLog, AuditOperation, AuditSink, TracingAuditSink};
use crate::backup::restore::StateObserver;
use crate::backup::{
    BackupError, DumpOptions, DumpProducer, DumpScript, LifecycleManager, RestoreOrchestrator,
    RestoreOutcome, RestoreRequest, RestoreState, SnapshotDownload, SnapshotStore,
};
use crate::backup_common::{
    operation_lock, safe_lock, CancelToken, Clock, OperationFileLock, SystemClock,
};
use crate::backup_config::BackupSettings;
use crate::database::SnapshotDatabase;
use crate::models::{Capability, Principal, SnapshotInfo, SnapshotOrigin};

/// 单个数据库的快照服务
#[derive(Clone)]
pub struct BackupService {
    database: SnapshotDatabase,
    store: SnapshotStore,
    producer: DumpProducer,
    lifecycle: LifecycleManager,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    restore_timeout: std::time::Duration,
    observer: Option<StateObserver>,
}

impl BackupService {
    pub fn new(database: SnapshotDatabase, store: SnapshotStore, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            lifecycle: LifecycleManager::new(store.clone(), audit.clone()),
            database,
            store,
            producer: DumpProducer::default(),
            audit,
            clock: Arc::new(SystemClock),
            restore_timeout: BackupSettings::default().restore_timeout(),
            observer: None,
        }
    }

    /// 按配置打开数据库、快照目录与审计目标
    pub fn from_settings(settings: &BackupSettings) -> Result<Self, BackupError> {
        settings.validate()?;
        let database = SnapshotDatabase::open(&settings.database_path, settings.pool_settings())?;
        let store = SnapshotStore::open(&settings.backup_directory)?;
        let audit = audit_sink_for(settings)?;

        Ok(Self::new(database, store, audit)
            .with_dump_options(settings.dump)
            .with_restore_timeout(settings.restore_timeout()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_dump_options(mut self, options: DumpOptions) -> Self {
        self.producer = DumpProducer::new(options);
        self
    }

    pub fn with_restore_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.restore_timeout = timeout;
        self
    }

    /// 恢复状态变更回调
    pub fn with_restore_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn database(&self) -> &SnapshotDatabase {
        &self.database
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// 创建手动快照
    pub fn create_backup(&self, principal: &Principal) -> Result<SnapshotInfo, BackupError> {
        let started = Instant::now();
        self.authorize(principal, Capability::CreateBackup, AuditOperation::Create, self.database.id())?;

        let result = {
            let lock = operation_lock(self.database.id());
            let _guard = safe_lock(&lock);
            self.produce_manual_snapshot()
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match result {
            Ok((script, info)) => {
                let log = AuditLog::new(&principal.actor, AuditOperation::Create, &info.name)
                    .complete(elapsed)
                    .with_details(serde_json::json!({
                        "size": info.size,
                        "tables": script.tables,
                    }));
                emit(self.audit.as_ref(), &log);
                info!(
                    "[BackupService] {} created snapshot {}",
                    principal.actor, info.name
                );
                Ok(info)
            }
            Err(e) => {
                let log = AuditLog::new(&principal.actor, AuditOperation::Create, self.database.id())
                    .fail(elapsed, e.to_string());
                emit(self.audit.as_ref(), &log);
                Err(e)
            }
        }
    }

    pub fn list_backups(&self, principal: &Principal) -> Result<Vec<SnapshotInfo>, BackupError> {
        let target = self.store.dir().to_string_lossy().to_string();
        self.authorize(principal, Capability::ListBackups, AuditOperation::List, &target)?;
        self.lifecycle.list(&principal.actor)
    }

    pub fn download_backup(
        &self,
        principal: &Principal,
        name: &str,
    ) -> Result<SnapshotDownload, BackupError> {
        self.authorize(principal, Capability::DownloadBackup, AuditOperation::Download, name)?;
        self.lifecycle.download(&principal.actor, name)
    }

    pub fn delete_backup(&self, principal: &Principal, name: &str) -> Result<(), BackupError> {
        self.authorize(principal, Capability::DeleteBackup, AuditOperation::Delete, name)?;
        self.lifecycle.delete(&principal.actor, name)
    }

    /// 恢复快照
    ///
    /// `confirmed == false` 时只返回 `AwaitingConfirmation`，不触碰任何状态。
    pub fn restore_backup(
        &self,
        principal: &Principal,
        name: &str,
        confirmed: bool,
        cancel: CancelToken,
    ) -> Result<RestoreOutcome, BackupError> {
        let started = Instant::now();
        self.authorize(principal, Capability::RestoreBackup, AuditOperation::Restore, name)?;

        let mut orchestrator = RestoreOrchestrator::new(self.store.clone(), self.producer.clone())
            .with_timeout(self.restore_timeout);
        if let Some(observer) = &self.observer {
            orchestrator = orchestrator.with_observer(observer.clone());
        }
        let request = RestoreRequest::new(name, confirmed).with_cancel(cancel);

        let result = self.database.get_conn().and_then(|mut conn| {
            orchestrator.restore(&mut conn, self.database.id(), &request, self.clock.as_ref())
        });

        let elapsed = started.elapsed().as_millis() as u64;
        let log = match &result {
            Ok(outcome) => {
                let log = AuditLog::new(&principal.actor, AuditOperation::Restore, &outcome.target.name)
                    .with_details(serde_json::json!({
                        "state": outcome.state,
                        "safety_snapshot": outcome.safety_snapshot.as_ref().map(|s| s.name.as_str()),
                        "statements_applied": outcome.statements_applied,
                    }));
                if outcome.state == RestoreState::AwaitingConfirmation {
                    log.awaiting_confirmation(elapsed)
                } else {
                    log.complete(elapsed)
                }
            }
            Err(e) => AuditLog::new(&principal.actor, AuditOperation::Restore, name)
                .fail(elapsed, e.to_string())
                .with_details(serde_json::json!({
                    "safety_snapshot": e.safety_snapshot(),
                })),
        };
        emit(self.audit.as_ref(), &log);
        result
    }

    /// 在进程内操作锁已持有的前提下获取文件锁并导出
    fn produce_manual_snapshot(&self) -> Result<(DumpScript, SnapshotInfo), BackupError> {
        let _file_lock = OperationFileLock::acquire(self.store.dir(), self.database.id())?;
        let conn = self.database.get_conn()?;
        self.producer.produce_snapshot(
            &conn,
            self.database.id(),
            &self.store,
            SnapshotOrigin::Manual,
            self.clock.as_ref(),
        )
    }

    /// 能力检查；拒绝时记录一条失败审计
    fn authorize(
        &self,
        principal: &Principal,
        capability: Capability,
        operation: AuditOperation,
        target: &str,
    ) -> Result<(), BackupError> {
        if principal.can(capability) {
            return Ok(());
        }
        let err = BackupError::Forbidden {
            actor: principal.actor.clone(),
            capability: capability.as_str().to_string(),
        };
        warn!(
            "[BackupService] {} ({:?}) denied {}",
            principal.actor,
            principal.tier,
            capability.as_str()
        );
        emit(
            self.audit.as_ref(),
            &AuditLog::new(&principal.actor, operation, target).fail(0, err.to_string()),
        );
        Err(err)
    }
}

/// tracing 审计始终启用；配置了审计库时同时写入 SQLite
fn audit_sink_for(settings: &BackupSettings) -> Result<Arc<dyn AuditSink>, BackupError> {
    match &settings.audit_database_path {
        #[cfg(feature = "sqlite_audit")]
        Some(path) => {
            let sqlite = crate::audit::SqliteAuditSink::open(path)
                .map_err(|e| BackupError::Config(format!("无法打开审计库 {:?}: {}", path, e)))?;
            Ok(Arc::new(crate::audit::CompositeAuditSink::new(vec![
                Arc::new(TracingAuditSink),
                Arc::new(sqlite),
            ])))
        }
        #[cfg(not(feature = "sqlite_audit"))]
        Some(path) => {
            warn!(
                "[BackupService] sqlite_audit feature disabled, ignoring audit database {:?}",
                path
            );
            Ok(Arc::new(TracingAuditSink))
        }
        None => Ok(Arc::new(TracingAuditSink)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditStatus, MemoryAuditSink};
    use crate::backup_common::StepClock;
    use crate::database::PoolSettings;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn setup() -> (BackupService, Arc<MemoryAuditSink>, TempDir) {
        let dir = TempDir::new().unwrap();
        let database =
            SnapshotDatabase::open(&dir.path().join("app.db"), PoolSettings::default()).unwrap();
        database
            .get_conn()
            .unwrap()
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT);
                 INSERT INTO items (label) VALUES ('one'), ('two');",
            )
            .unwrap();
        let store = SnapshotStore::open(dir.path().join("backups")).unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        let clock = StepClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            chrono::Duration::seconds(60),
        );
        let service = BackupService::new(database, store, sink.clone()).with_clock(Arc::new(clock));
        (service, sink, dir)
    }

    #[test]
    fn test_standard_tier_cannot_restore() {
        let (service, sink, _dir) = setup();
        let admin = Principal::standard("alice");
        let info = service.create_backup(&admin).unwrap();

        let err = service
            .restore_backup(&admin, &info.name, true, CancelToken::new())
            .unwrap_err();
        assert_matches!(err, BackupError::Forbidden { ref capability, .. } if capability == "restore_backup");

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].operation, AuditOperation::Restore);
        assert_eq!(records[1].status, AuditStatus::Failed);
        // 拒绝后不会产生安全快照
        assert_eq!(service.list_backups(&admin).unwrap().len(), 1);
    }

    #[test]
    fn test_restore_is_audited_with_safety_snapshot() {
        let (service, sink, _dir) = setup();
        let root = Principal::elevated("root");
        let info = service.create_backup(&root).unwrap();
        service
            .database()
            .get_conn()
            .unwrap()
            .execute("DELETE FROM items", [])
            .unwrap();

        let pending = service
            .restore_backup(&root, &info.name, false, CancelToken::new())
            .unwrap();
        assert_eq!(pending.state, RestoreState::AwaitingConfirmation);

        let outcome = service
            .restore_backup(&root, &info.name, true, CancelToken::new())
            .unwrap();
        assert_eq!(outcome.state, RestoreState::Committed);
        let count: i64 = service
            .database()
            .get_conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM items", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);

        let records = sink.records();
        let statuses: Vec<_> = records.iter().map(|r| (r.operation, r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (AuditOperation::Create, AuditStatus::Completed),
                (AuditOperation::Restore, AuditStatus::AwaitingConfirmation),
                (AuditOperation::Restore, AuditStatus::Completed),
            ]
        );
        let safety = outcome.safety_snapshot.unwrap();
        assert_eq!(records[2].details["safety_snapshot"], safety.name.as_str());
    }

    #[test]
    fn test_failed_create_names_the_snapshot() {
        let (service, sink, dir) = setup();
        let frozen = StepClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            chrono::Duration::zero(),
        );
        let service = service.with_clock(Arc::new(frozen));
        // 目标路径被目录占用，快照无法落盘
        std::fs::create_dir(dir.path().join("backups").join("db-backup-2024-01-01-000000.sql"))
            .unwrap();

        let err = service
            .create_backup(&Principal::standard("alice"))
            .unwrap_err();
        assert!(err.to_string().contains("db-backup-2024-01-01-000000.sql"));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditStatus::Failed);
        assert!(records[0]
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("db-backup-2024-01-01-000000.sql"));
    }

    #[test]
    fn test_create_takes_the_cross_process_lock() {
        let (service, _sink, _dir) = setup();
        let held = OperationFileLock::acquire(service.store().dir(), service.database().id())
            .unwrap();
        let worker = service.clone();
        let handle = std::thread::spawn(move || worker.create_backup(&Principal::standard("bob")));

        std::thread::sleep(std::time::Duration::from_millis(150));
        assert!(service.store().list().unwrap().is_empty());
        drop(held);
        let info = handle.join().unwrap().unwrap();
        assert_eq!(service.store().list().unwrap()[0].name, info.name);
    }

    #[test]
    fn test_from_settings_wires_sqlite_audit() {
        let dir = TempDir::new().unwrap();
        let settings = BackupSettings {
            database_path: dir.path().join("data").join("app.db"),
            backup_directory: dir.path().join("backups"),
            audit_database_path: Some(dir.path().join("audit.db")),
            ..BackupSettings::default()
        };
        let service = BackupService::from_settings(&settings).unwrap();
        service.list_backups(&Principal::standard("alice")).unwrap();
        assert!(service.store().has_access_marker());

        #[cfg(feature = "sqlite_audit")]
        {
            let audit = crate::audit::SqliteAuditSink::open(&dir.path().join("audit.db")).unwrap();
            assert_eq!(audit.count().unwrap(), 1);
        }
    }
}
