//! 快照生命周期：列表 / 下载 / 删除
//!
//! 每次调用恰好产生一条审计记录，成功与失败都会记录。

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::store::SnapshotStore;
use super::BackupError;
use crate::audit::{emit, AuditLog, AuditOperation, AuditSink};
use crate::models::SnapshotInfo;

/// 可流式读取的快照内容
#[derive(Debug)]
pub struct SnapshotDownload {
    info: SnapshotInfo,
    file: File,
}

impl SnapshotDownload {
    pub fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    /// 建议的下载文件名
    pub fn file_name(&self) -> &str {
        &self.info.name
    }

    /// 读取剩余全部内容
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.info.size as usize);
        self.file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for SnapshotDownload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// 生命周期管理器
#[derive(Clone)]
pub struct LifecycleManager {
    store: SnapshotStore,
    audit: Arc<dyn AuditSink>,
}

impl LifecycleManager {
    pub fn new(store: SnapshotStore, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn list(&self, actor: &str) -> Result<Vec<SnapshotInfo>, BackupError> {
        let started = Instant::now();
        let result = self.store.list();
        let target = self.store.dir().to_string_lossy().to_string();
        self.audit(actor, AuditOperation::List, &target, started, &result, |snapshots| {
            serde_json::json!({ "count": snapshots.len() })
        });
        result
    }

    pub fn download(&self, actor: &str, name: &str) -> Result<SnapshotDownload, BackupError> {
        let started = Instant::now();
        let result = self
            .store
            .open_reader(name)
            .map(|(info, file)| SnapshotDownload { info, file });
        self.audit(actor, AuditOperation::Download, name, started, &result, |download| {
            serde_json::json!({ "size": download.info.size })
        });
        if let Ok(download) = &result {
            info!(
                "[LifecycleManager] {} downloading {} ({} bytes)",
                actor, download.info.name, download.info.size
            );
        }
        result
    }

    pub fn delete(&self, actor: &str, name: &str) -> Result<(), BackupError> {
        let started = Instant::now();
        let result = self.store.delete(name);
        self.audit(actor, AuditOperation::Delete, name, started, &result, |_| {
            serde_json::Value::Null
        });
        result
    }

    fn audit<T>(
        &self,
        actor: &str,
        operation: AuditOperation,
        target: &str,
        started: Instant,
        result: &Result<T, BackupError>,
        details: impl FnOnce(&T) -> serde_json::Value,
    ) {
        let elapsed = started.elapsed().as_millis() as u64;
        let log = match result {
            Ok(value) => AuditLog::new(actor, operation, target)
                .complete(elapsed)
                .with_details(details(value)),
            Err(e) => AuditLog::new(actor, operation, target).fail(elapsed, e.to_string()),
        };
        emit(self.audit.as_ref(), &log);
    }
}
