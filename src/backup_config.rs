//! 备份配置模块
//!
//! 配置来源按优先级从低到高叠加：
//! - 内置默认值
//! - `config/db_snapshot.toml`（可选）
//! - `DB_SNAPSHOT__*` 环境变量（`.env` 会先被加载），嵌套键用 `__` 分隔，
//!   例如 `DB_SNAPSHOT__DUMP__ADD_DROP=false`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backup::restore::DEFAULT_RESTORE_TIMEOUT_SECS;
use crate::backup::{BackupError, DumpOptions};
use crate::database::PoolSettings;

/// 默认配置文件（不含扩展名，由 config 按格式探测）
pub const DEFAULT_CONFIG_FILE: &str = "config/db_snapshot";

/// 环境变量前缀
pub const ENV_PREFIX: &str = "DB_SNAPSHOT";

/// 备份子系统配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// 被备份的数据库文件
    pub database_path: PathBuf,

    /// 快照目录
    pub backup_directory: PathBuf,

    /// 恢复超时（秒）
    pub restore_timeout_secs: u64,

    /// 连接池大小
    pub pool_size: u32,

    /// SQLite busy_timeout（毫秒）
    pub busy_timeout_ms: u32,

    /// 审计库路径；为空时只输出 tracing 审计事件
    pub audit_database_path: Option<PathBuf>,

    /// 导出选项
    pub dump: DumpOptions,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/app.db"),
            backup_directory: PathBuf::from("backups"),
            restore_timeout_secs: DEFAULT_RESTORE_TIMEOUT_SECS,
            pool_size: 4,
            busy_timeout_ms: 3000,
            audit_database_path: None,
            dump: DumpOptions::default(),
        }
    }
}

impl BackupSettings {
    /// 加载 `.env`、默认配置文件与环境变量
    pub fn load() -> Result<Self, BackupError> {
        dotenvy::dotenv().ok();
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE), None)
    }

    /// 从指定配置文件加载
    ///
    /// `env` 为 `None` 时读取进程环境变量，否则使用给定的键值表。
    pub fn load_from(
        file: &Path,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, BackupError> {
        let mut builder = config::Config::builder();

        if file.exists() || file.with_extension("toml").exists() {
            builder = builder.add_source(config::File::from(file.to_path_buf()).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let settings: BackupSettings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BackupError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), BackupError> {
        if self.restore_timeout_secs == 0 {
            return Err(BackupError::Config(
                "restore_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.backup_directory.as_os_str().is_empty() {
            return Err(BackupError::Config("backup_directory is empty".to_string()));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(BackupError::Config("database_path is empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(BackupError::Config("pool_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_size,
            busy_timeout_ms: self.busy_timeout_ms,
            ..PoolSettings::default()
        }
    }
}
