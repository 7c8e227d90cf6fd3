//! 被备份的数据库句柄
//!
//! 本子系统不拥有数据库：调用方注入一个连接池以及用于互斥的数据库标识。
//! 每个操作只从池中取出一个连接。

mod manager;

pub use manager::{build_pool, PoolSettings};

use std::path::Path;

use crate::backup::BackupError;

pub type SqlitePool = r2d2::Pool<r2d2_sqlite::SqliteConnectionManager>;
pub type SqlitePooledConnection = r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>;

/// 注入的数据库连接句柄
#[derive(Clone)]
pub struct SnapshotDatabase {
    id: String,
    pool: SqlitePool,
}

impl std::fmt::Debug for SnapshotDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotDatabase")
            .field("id", &self.id)
            .field("pool_size", &self.pool.max_size())
            .finish()
    }
}

impl SnapshotDatabase {
    /// 使用已有连接池；`id` 用作操作锁的键，同一数据库必须使用相同标识
    pub fn from_pool(id: impl Into<String>, pool: SqlitePool) -> Self {
        Self {
            id: id.into(),
            pool,
        }
    }

    /// 打开数据库文件；标识取规范化后的绝对路径
    pub fn open(db_path: &Path, settings: PoolSettings) -> Result<Self, BackupError> {
        let pool = build_pool(db_path, settings)?;
        let id = db_path
            .canonicalize()
            .unwrap_or_else(|_| db_path.to_path_buf())
            .to_string_lossy()
            .to_string();
        Ok(Self::from_pool(id, pool))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 取出一个连接
    pub fn get_conn(&self) -> Result<SqlitePooledConnection, BackupError> {
        Ok(self.pool.get()?)
    }
}
