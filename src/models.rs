use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 调用方信任等级
///
/// 由外部认证/授权协作方确定后显式传入，核心不读取任何会话或全局身份状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    /// 普通管理员：创建、列出、下载、删除快照
    Standard,
    /// 高级管理员：额外允许恢复
    Elevated,
}

/// 单个操作所需的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateBackup,
    ListBackups,
    DownloadBackup,
    DeleteBackup,
    RestoreBackup,
}

impl Capability {
    pub fn required_tier(self) -> TrustTier {
        match self {
            Capability::RestoreBackup => TrustTier::Elevated,
            _ => TrustTier::Standard,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::CreateBackup => "create_backup",
            Capability::ListBackups => "list_backups",
            Capability::DownloadBackup => "download_backup",
            Capability::DeleteBackup => "delete_backup",
            Capability::RestoreBackup => "restore_backup",
        }
    }
}

/// 已认证的调用方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub actor: String,
    pub tier: TrustTier,
}

impl Principal {
    pub fn new(actor: impl Into<String>, tier: TrustTier) -> Self {
        Self {
            actor: actor.into(),
            tier,
        }
    }

    pub fn standard(actor: impl Into<String>) -> Self {
        Self::new(actor, TrustTier::Standard)
    }

    pub fn elevated(actor: impl Into<String>) -> Self {
        Self::new(actor, TrustTier::Elevated)
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.tier >= capability.required_tier()
    }
}

/// 快照来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    /// 显式请求创建
    Manual,
    /// 恢复前自动创建的安全快照
    PreRestore,
}

impl SnapshotOrigin {
    /// 文件名前缀（不含时间戳）
    pub fn prefix(self) -> &'static str {
        match self {
            SnapshotOrigin::Manual => "db-backup-",
            SnapshotOrigin::PreRestore => "pre-restore-backup-",
        }
    }

    pub fn from_name(name: &str) -> Self {
        if name.starts_with(SnapshotOrigin::PreRestore.prefix()) {
            SnapshotOrigin::PreRestore
        } else {
            SnapshotOrigin::Manual
        }
    }
}

impl fmt::Display for SnapshotOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotOrigin::Manual => write!(f, "manual"),
            SnapshotOrigin::PreRestore => write!(f, "pre-restore"),
        }
    }
}

/// 快照元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// 文件名（唯一标识）
    pub name: String,
    /// 字节数
    pub size: u64,
    /// 创建时间（优先取文件名中的时间戳）
    pub created_at: DateTime<Utc>,
    pub origin: SnapshotOrigin,
}
