//! # Backup 模块
//!
//! 数据库逻辑备份 / 快照管理 / 安全恢复。
//!
//! ## 设计原则
//!
//! 1. **原子性**：快照先写临时文件再改名，读者永远看不到半个文件
//! 2. **不可变**：快照写入后不再修改，只能显式删除
//! 3. **可恢复**：恢复前必定先落盘一份 `pre-restore-backup-*` 安全快照
//! 4. **单事务**：恢复脚本在一个事务内整体提交或整体回滚
//!
//! ## 组件
//!
//! - `store`: 快照存储（文件系统）
//! - `dump`: 导出 SQL 脚本
//! - `sql_split`: 感知引号/注释/触发器的语句切分
//! - `restore`: 恢复编排状态机
//! - `lifecycle`: 列表/下载/删除 + 审计
//!
//! ## 已知限制
//!
//! - 导出在单个读事务内进行；调用方已处于事务中时沿用该事务，不另加栅栏
//! - 对不支持事务性 DDL 的引擎，"回滚" 之后仍可能残留部分 schema 变更；
//!   官方恢复流程始终是 "恢复安全快照"

pub mod dump;
pub mod lifecycle;
pub mod restore;
pub mod sql_split;
pub mod store;

use serde::{Deserialize, Serialize};

pub use dump::{DumpOptions, DumpProducer, DumpScript, TableDump};
pub use lifecycle::{LifecycleManager, SnapshotDownload};
pub use restore::{RestoreOrchestrator, RestoreOutcome, RestoreRequest, RestoreState};
pub use sql_split::{split_statements, SplitError};
pub use store::SnapshotStore;

/// 备份错误
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Snapshot {name} could not be written: {source}")]
    SnapshotFailed {
        name: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Safety snapshot before restoring {target} failed, {target} was not loaded: {source}")]
    SafetySnapshotFailed {
        target: String,
        #[source]
        source: Box<BackupError>,
    },

    #[error("Integrity check failed for {name}: {reason}")]
    IntegrityCheckFailed { name: String, reason: String },

    #[error(
        "Restore of {target} ended in {state}: {reason}; recover with safety snapshot {safety_snapshot}"
    )]
    PartialFailure {
        target: String,
        safety_snapshot: String,
        state: RestoreState,
        reason: String,
    },

    #[error("Permission denied: {actor} lacks {capability}")]
    Forbidden { actor: String, capability: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for BackupError {
    fn from(err: r2d2::Error) -> Self {
        BackupError::Database(format!("获取数据库连接失败: {}", err))
    }
}

/// 面向展示层的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Io,
    Database,
    PartialFailure,
    Forbidden,
    Config,
}

impl BackupError {
    pub(crate) fn snapshot_failed(name: &str, source: BackupError) -> Self {
        BackupError::SnapshotFailed {
            name: name.to_string(),
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::SnapshotFailed { source, .. }
            | BackupError::SafetySnapshotFailed { source, .. } => source.kind(),
            BackupError::Validation(_)
            | BackupError::AlreadyExists(_)
            | BackupError::IntegrityCheckFailed { .. } => ErrorKind::Validation,
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::Io(_) => ErrorKind::Io,
            BackupError::Database(_) => ErrorKind::Database,
            BackupError::PartialFailure { .. } => ErrorKind::PartialFailure,
            BackupError::Forbidden { .. } => ErrorKind::Forbidden,
            BackupError::Config(_) => ErrorKind::Config,
        }
    }

    /// 失败时可用于人工恢复的安全快照名
    pub fn safety_snapshot(&self) -> Option<&str> {
        match self {
            BackupError::PartialFailure {
                safety_snapshot, ..
            } => Some(safety_snapshot),
            _ => None,
        }
    }
}
