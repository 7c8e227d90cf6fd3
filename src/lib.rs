// DB Snapshot library entry
// 数据库逻辑备份、快照管理与安全恢复；bin 目标只负责参数解析与输出。

pub mod audit;
pub mod backup;
pub mod backup_common;
pub mod backup_config;
pub mod database;
pub mod logging;
pub mod models;
pub mod service;

pub use backup::{BackupError, RestoreOutcome, RestoreState, SnapshotStore};
pub use backup_common::{CancelToken, Clock, SystemClock};
pub use backup_config::BackupSettings;
pub use database::SnapshotDatabase;
pub use models::{Capability, Principal, SnapshotInfo, SnapshotOrigin, TrustTier};
pub use service::BackupService;
