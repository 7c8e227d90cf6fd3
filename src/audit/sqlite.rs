//! SQLite 审计表
//!
//! 记录写入专用的 `__audit_log` 表，使用独立连接，不参与被备份数据库的事务。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

use super::{AuditError, AuditLog, AuditOperation, AuditSink, AuditStatus};
use crate::backup_common::safe_lock;

/// 审计日志仓库
pub struct AuditRepository;

impl AuditRepository {
    /// 创建审计表的 SQL
    pub const CREATE_TABLE_SQL: &'static str = r#"
        CREATE TABLE IF NOT EXISTS __audit_log (
            id TEXT PRIMARY KEY NOT NULL,
            timestamp TEXT NOT NULL,
            actor TEXT NOT NULL,
            operation TEXT NOT NULL,
            target TEXT NOT NULL,
            status TEXT NOT NULL,
            duration_ms INTEGER,
            details TEXT,
            error_message TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON __audit_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_audit_log_operation ON __audit_log(operation);
    "#;

    const INSERT_SQL: &'static str = r#"
        INSERT INTO __audit_log (
            id, timestamp, actor, operation, target,
            status, duration_ms, details, error_message
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    "#;

    /// 初始化审计表
    pub fn init(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(Self::CREATE_TABLE_SQL)
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(())
    }

    /// 保存审计日志
    pub fn save(conn: &Connection, log: &AuditLog) -> Result<(), AuditError> {
        let details_str = serde_json::to_string(&log.details)?;
        conn.execute(
            Self::INSERT_SQL,
            params![
                log.id,
                log.timestamp.to_rfc3339(),
                log.actor,
                log.operation.as_str(),
                log.target,
                log.status.as_str(),
                log.duration_ms.map(|d| d as i64),
                details_str,
                log.error_message,
            ],
        )
        .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(())
    }

    /// 获取最近的 N 条日志（时间倒序）
    pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<AuditLog>, AuditError> {
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, actor, operation, target,
                        status, duration_ms, details, error_message
                 FROM __audit_log ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
            )
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit as i64], Self::row_to_audit_log)
            .map_err(|e| AuditError::Database(e.to_string()))?;

        let mut logs = Vec::new();
        for row_result in rows {
            let log = row_result.map_err(|e| AuditError::Database(e.to_string()))?;
            logs.push(log?);
        }
        Ok(logs)
    }

    /// 获取审计日志总数
    pub fn count_all(conn: &Connection) -> Result<u64, AuditError> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM __audit_log", [], |row| row.get(0))
            .map_err(|e| AuditError::Database(e.to_string()))?;
        Ok(count as u64)
    }

    fn row_to_audit_log(row: &Row) -> rusqlite::Result<Result<AuditLog, AuditError>> {
        let id: String = row.get(0)?;
        let timestamp_str: String = row.get(1)?;
        let actor: String = row.get(2)?;
        let operation_str: String = row.get(3)?;
        let target: String = row.get(4)?;
        let status_str: String = row.get(5)?;
        let duration_ms: Option<i64> = row.get(6)?;
        let details_str: Option<String> = row.get(7)?;
        let error_message: Option<String> = row.get(8)?;

        let timestamp = match DateTime::parse_from_rfc3339(&timestamp_str) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(e) => {
                return Ok(Err(AuditError::Database(format!(
                    "Invalid timestamp: {}",
                    e
                ))))
            }
        };
        let Some(operation) = AuditOperation::parse(&operation_str) else {
            return Ok(Err(AuditError::Database(format!(
                "Unknown operation: {}",
                operation_str
            ))));
        };
        let Some(status) = AuditStatus::parse(&status_str) else {
            return Ok(Err(AuditError::Database(format!(
                "Unknown status: {}",
                status_str
            ))));
        };

        let details = match details_str {
            Some(ref s) if !s.is_empty() => {
                serde_json::from_str(s).unwrap_or(serde_json::Value::Null)
            }
            _ => serde_json::Value::Null,
        };

        Ok(Ok(AuditLog {
            id,
            timestamp,
            actor,
            operation,
            target,
            status,
            duration_ms: duration_ms.map(|d| d.max(0) as u64),
            details,
            error_message,
        }))
    }
}

/// 写入 SQLite 审计表的投递目标
pub struct SqliteAuditSink {
    conn: Mutex<Connection>,
}

impl SqliteAuditSink {
    pub fn new(conn: Connection) -> Result<Self, AuditError> {
        AuditRepository::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 从路径打开审计数据库
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AuditError::Database(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| AuditError::Database(e.to_string()))?;
        Self::new(conn)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory().map_err(|e| AuditError::Database(e.to_string()))?;
        Self::new(conn)
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<AuditLog>, AuditError> {
        AuditRepository::recent(&safe_lock(&self.conn), limit)
    }

    pub fn count(&self) -> Result<u64, AuditError> {
        AuditRepository::count_all(&safe_lock(&self.conn))
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, log: &AuditLog) -> Result<(), AuditError> {
        AuditRepository::save(&safe_lock(&self.conn), log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_recent_roundtrip() {
        let sink = SqliteAuditSink::in_memory().unwrap();
        let first = AuditLog::new("alice", AuditOperation::Create, "db-backup-2024-01-01-000000.sql")
            .complete(40)
            .with_details(serde_json::json!({ "size": 1024 }));
        let second = AuditLog::new("alice", AuditOperation::Delete, "missing.sql")
            .fail(1, "Snapshot not found: missing.sql");
        sink.record(&first).unwrap();
        sink.record(&second).unwrap();

        assert_eq!(sink.count().unwrap(), 2);
        let recent = sink.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        let stored = recent.iter().find(|l| l.id == first.id).unwrap();
        assert_eq!(stored.operation, AuditOperation::Create);
        assert_eq!(stored.details["size"], 1024);
        let failed = recent.iter().find(|l| l.id == second.id).unwrap();
        assert_eq!(failed.status, AuditStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("Snapshot not found: missing.sql"));

        assert_eq!(sink.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_id_is_an_error() {
        let sink = SqliteAuditSink::in_memory().unwrap();
        let log = AuditLog::new("alice", AuditOperation::List, "app.db");
        sink.record(&log).unwrap();
        assert!(matches!(sink.record(&log), Err(AuditError::Database(_))));
    }
}
