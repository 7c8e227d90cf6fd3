//! 连接池构建
//!
//! 与宿主应用一致的 PRAGMA 基线：外键开启、WAL、busy_timeout 快速失败。

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::SqlitePool;
use crate::backup::BackupError;

/// 连接池参数
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_size: u32,
    pub busy_timeout_ms: u32,
    pub connection_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 4,
            busy_timeout_ms: 3000,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// 为数据库文件创建 r2d2 连接池
pub fn build_pool(db_path: &Path, settings: PoolSettings) -> Result<SqlitePool, BackupError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let busy_timeout = i64::from(settings.busy_timeout_ms);
    let manager = SqliteConnectionManager::file(db_path).with_init(move |c| {
        c.pragma_update(None, "foreign_keys", &"ON")?;
        c.pragma_update(None, "journal_mode", &"WAL")?;
        c.pragma_update(None, "synchronous", &"NORMAL")?;
        // 写锁等待有界，超时交给上层报错
        c.pragma_update(None, "busy_timeout", &busy_timeout)?;
        Ok(())
    });

    Pool::builder()
        .max_size(settings.max_size.max(1))
        .connection_timeout(settings.connection_timeout)
        .build(manager)
        .map_err(|e| BackupError::Database(format!("创建数据库连接池失败 {:?}: {}", db_path, e)))
}
