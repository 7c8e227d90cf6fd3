//! # Audit 模块
//!
//! 快照操作的审计记录。
//!
//! ## 设计原则
//!
//! 1. **结构化**：每次调用产生一条记录（操作者、操作、目标、时间、结果）
//! 2. **可插拔**：通过 [`AuditSink`] 投递，可写 tracing、SQLite 审计表或内存
//! 3. **尽力而为**：审计失败只记录告警，从不阻断业务操作

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::backup_common::safe_lock;

#[cfg(feature = "sqlite_audit")]
mod sqlite;

#[cfg(feature = "sqlite_audit")]
pub use sqlite::{AuditRepository, SqliteAuditSink};

/// 审计日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    /// 唯一 ID
    pub id: String,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
    /// 操作者
    pub actor: String,
    /// 操作类型
    pub operation: AuditOperation,
    /// 操作目标（快照名或数据库标识）
    pub target: String,
    /// 状态
    pub status: AuditStatus,
    /// 耗时（毫秒）
    pub duration_ms: Option<u64>,
    /// 详细信息（JSON）
    pub details: serde_json::Value,
    /// 错误信息（如果有）
    pub error_message: Option<String>,
}

/// 审计操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Create,
    List,
    Download,
    Delete,
    Restore,
}

impl AuditOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOperation::Create => "create",
            AuditOperation::List => "list",
            AuditOperation::Download => "download",
            AuditOperation::Delete => "delete",
            AuditOperation::Restore => "restore",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(AuditOperation::Create),
            "list" => Some(AuditOperation::List),
            "download" => Some(AuditOperation::Download),
            "delete" => Some(AuditOperation::Delete),
            "restore" => Some(AuditOperation::Restore),
            _ => None,
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 审计状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// 完成
    Completed,
    /// 失败
    Failed,
    /// 恢复请求未确认
    AwaitingConfirmation,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::AwaitingConfirmation => "awaiting_confirmation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(AuditStatus::Completed),
            "failed" => Some(AuditStatus::Failed),
            "awaiting_confirmation" => Some(AuditStatus::AwaitingConfirmation),
            _ => None,
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AuditLog {
    /// 创建新的审计日志（默认状态为完成）
    pub fn new(
        actor: impl Into<String>,
        operation: AuditOperation,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor: actor.into(),
            operation,
            target: target.into(),
            status: AuditStatus::Completed,
            duration_ms: None,
            details: serde_json::Value::Null,
            error_message: None,
        }
    }

    /// 标记为完成
    pub fn complete(mut self, duration_ms: u64) -> Self {
        self.status = AuditStatus::Completed;
        self.duration_ms = Some(duration_ms);
        self
    }

    /// 标记为失败
    pub fn fail(mut self, duration_ms: u64, error: impl Into<String>) -> Self {
        self.status = AuditStatus::Failed;
        self.duration_ms = Some(duration_ms);
        self.error_message = Some(error.into());
        self
    }

    /// 标记为等待确认
    pub fn awaiting_confirmation(mut self, duration_ms: u64) -> Self {
        self.status = AuditStatus::AwaitingConfirmation;
        self.duration_ms = Some(duration_ms);
        self
    }

    /// 添加详细信息
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// 审计记录投递目标
pub trait AuditSink: Send + Sync {
    fn record(&self, log: &AuditLog) -> Result<(), AuditError>;
}

/// 投递一条审计记录；失败只记录告警
pub fn emit(sink: &dyn AuditSink, log: &AuditLog) {
    if let Err(e) = sink.record(log) {
        warn!(
            "[Audit] Failed to record {} on {} by {}: {}",
            log.operation, log.target, log.actor, e
        );
    }
}

/// 以结构化 tracing 事件输出（target = "audit"）
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, log: &AuditLog) -> Result<(), AuditError> {
        info!(
            target: "audit",
            id = %log.id,
            actor = %log.actor,
            operation = %log.operation,
            target_name = %log.target,
            status = %log.status,
            duration_ms = log.duration_ms,
            error = log.error_message.as_deref(),
            "snapshot operation"
        );
        Ok(())
    }
}

/// 内存审计（测试与嵌入使用）
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditLog>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditLog> {
        safe_lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        safe_lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, log: &AuditLog) -> Result<(), AuditError> {
        safe_lock(&self.records).push(log.clone());
        Ok(())
    }
}

/// 依次投递到多个目标；某个目标失败不影响其余目标
#[derive(Default, Clone)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }
}

impl AuditSink for CompositeAuditSink {
    fn record(&self, log: &AuditLog) -> Result<(), AuditError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(log) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 审计错误
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
