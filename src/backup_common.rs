//! 备份系统共享组件
//!
//! 提供所有备份模块共用的锁和工具函数
//! - 操作锁: 按数据库标识串行化备份/恢复（进程内互斥 + 跨进程文件锁）
//! - 快照命名: 时间戳命名与解析
//! - 名称清洗: 防止目录遍历
//! - 取消令牌与时钟

use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use crate::backup::BackupError;
use crate::models::SnapshotOrigin;

/// 快照文件名中的时间戳格式（UTC，秒级）
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// 快照文件扩展名
pub const SNAPSHOT_EXTENSION: &str = ".sql";

/// 拒绝访问标记文件名
pub const ACCESS_DENY_MARKER: &str = ".htaccess";

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[BackupCommon] Directory entry read error (skipped): {}", e);
            None
        }
    }
}

/// 安全地获取 Mutex 锁，在中毒时恢复锁并返回 guard
pub fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                "[BackupCommon] Mutex poisoned! Attempting recovery for type: {:?}",
                std::any::type_name::<T>()
            );
            poisoned.into_inner()
        }
    }
}

// ============================================================================
// 操作锁 - 同一数据库上的备份/恢复互斥
// ============================================================================

/// 按数据库标识分配的互斥锁表
///
/// 同一数据库的创建备份与已确认的恢复必须持有对应锁；
/// 不同数据库之间互不阻塞。
static BACKUP_OPERATION_LOCKS: LazyLock<DashMap<String, Arc<Mutex<()>>>> =
    LazyLock::new(DashMap::new);

/// 获取指定数据库的操作锁（调用方通过 [`safe_lock`] 加锁）
pub fn operation_lock(database_id: &str) -> Arc<Mutex<()>> {
    BACKUP_OPERATION_LOCKS
        .entry(database_id.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// 锁文件名前缀（隐藏文件，不会出现在快照列表中）
pub const OPERATION_LOCK_PREFIX: &str = ".lock-";

/// 锁文件名中数据库标识部分的最大长度
const LOCK_KEY_MAX_LEN: usize = 96;

/// 数据库标识对应的锁文件路径
///
/// 标识中的非 `[A-Za-z0-9_-]` 字符替换为 `_`，过长时保留结尾部分。
/// 不同标识映射到同一文件只会让它们多串行一些。
pub fn operation_lock_path(dir: &Path, database_id: &str) -> PathBuf {
    let key: String = database_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let key = &key[key.len().saturating_sub(LOCK_KEY_MAX_LEN)..];
    dir.join(format!("{}{}", OPERATION_LOCK_PREFIX, key))
}

/// 跨进程的操作锁
///
/// 在快照目录中对锁文件加独占建议锁，析构时释放。进程内的线程应先持有
/// [`operation_lock`]，再获取本锁。
#[derive(Debug)]
pub struct OperationFileLock {
    file: File,
    path: PathBuf,
}

impl OperationFileLock {
    /// 获取锁；被其他进程持有时阻塞等待
    pub fn acquire(dir: &Path, database_id: &str) -> Result<Self, BackupError> {
        let path = operation_lock_path(dir, database_id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            tracing::info!(
                "[BackupCommon] {} is locked by another process, waiting",
                path.display()
            );
            file.lock_exclusive()?;
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationFileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(
                "[BackupCommon] Failed to release {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

// ============================================================================
// 快照命名
// ============================================================================

/// 生成快照文件名，例如 `db-backup-2024-01-01-000000.sql`
pub fn snapshot_name_at(origin: SnapshotOrigin, now: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        origin.prefix(),
        now.format(SNAPSHOT_TIMESTAMP_FORMAT),
        SNAPSHOT_EXTENSION
    )
}

/// 从快照文件名解析创建时间；非本系统命名的文件返回 None
pub fn parse_snapshot_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(SNAPSHOT_EXTENSION)?;
    let raw = [SnapshotOrigin::PreRestore, SnapshotOrigin::Manual]
        .iter()
        .find_map(|origin| stem.strip_prefix(origin.prefix()))?;
    NaiveDateTime::parse_from_str(raw, SNAPSHOT_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

// ============================================================================
// 名称清洗
// ============================================================================

/// 将调用方传入的标识清洗为单个文件名分量
///
/// 无论传入什么，只保留最后一个路径分量（同时识别 `/` 与 `\`），
/// 丢弃所有目录遍历片段。空名、`.`、`..` 以及包含 NUL 的名称视为非法。
pub fn sanitize_snapshot_name(raw: &str) -> Result<String, BackupError> {
    if raw.contains('\0') {
        return Err(BackupError::Validation(
            "快照名称包含非法字符 (NUL)".to_string(),
        ));
    }

    let base = raw
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        return Err(BackupError::Validation(format!(
            "快照名称无效: {:?}",
            raw
        )));
    }

    Ok(base.to_string())
}

/// 判断清洗后的名称是否属于快照命名空间
///
/// 标记文件、隐藏文件（含写入中的临时文件）与非 `.sql` 文件均不是快照。
pub fn is_snapshot_file_name(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(SNAPSHOT_EXTENSION) && name.len() > SNAPSHOT_EXTENSION.len()
}

// ============================================================================
// 取消令牌
// ============================================================================

/// 可跨线程共享的取消信号
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// ============================================================================
// 时钟
// ============================================================================

/// 时间来源，便于在测试中固定快照命名
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// 同一秒内快照名冲突时，等待进入下一秒
    fn wait_for_next_second(&self, now: DateTime<Utc>) {
        let elapsed_ms = u64::from(now.timestamp_subsec_millis().min(999));
        std::thread::sleep(std::time::Duration::from_millis(1000 - elapsed_ms));
    }
}

/// 系统 UTC 时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 每次读取前进固定步长的测试时钟
#[cfg(test)]
pub(crate) struct StepClock {
    current: Mutex<DateTime<Utc>>,
    step: chrono::Duration,
}

#[cfg(test)]
impl StepClock {
    pub(crate) fn new(start: DateTime<Utc>, step: chrono::Duration) -> Self {
        Self {
            current: Mutex::new(start),
            step,
        }
    }
}

#[cfg(test)]
impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let mut current = safe_lock(&self.current);
        let now = *current;
        *current = now + self.step;
        now
    }

    fn wait_for_next_second(&self, _now: DateTime<Utc>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    #[test]
    fn operation_file_lock_excludes_other_handles_until_dropped() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = OperationFileLock::acquire(dir.path(), "/srv/data/app.db").unwrap();
        assert_eq!(
            lock.path(),
            dir.path().join(".lock-_srv_data_app_db").as_path()
        );

        // 另一个打开的句柄等同于另一个进程
        let other = File::open(lock.path()).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        let unrelated = OperationFileLock::acquire(dir.path(), "/srv/data/other.db").unwrap();
        assert_ne!(unrelated.path(), lock.path());

        drop(lock);
        other.try_lock_exclusive().unwrap();
        FileExt::unlock(&other).unwrap();
    }

    #[test]
    fn operation_file_lock_waits_for_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let held = OperationFileLock::acquire(dir.path(), "app").unwrap();
        let released = Arc::new(AtomicBool::new(false));

        let flag = released.clone();
        let path = dir.path().to_path_buf();
        let waiter = std::thread::spawn(move || {
            let _lock = OperationFileLock::acquire(&path, "app").unwrap();
            flag.load(Ordering::SeqCst)
        });

        std::thread::sleep(std::time::Duration::from_millis(100));
        released.store(true, Ordering::SeqCst);
        drop(held);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn lock_path_keeps_tail_of_long_identifiers() {
        let id = format!("{}tail.db", "x".repeat(300));
        let path = operation_lock_path(Path::new("/tmp"), &id);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(OPERATION_LOCK_PREFIX));
        assert!(name.ends_with("tail_db"));
        assert_eq!(name.len(), OPERATION_LOCK_PREFIX.len() + LOCK_KEY_MAX_LEN);
        assert!(!is_snapshot_file_name(&name));
    }

    #[test]
    fn snapshot_name_uses_second_resolution_utc() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        assert_eq!(
            snapshot_name_at(SnapshotOrigin::Manual, now),
            "db-backup-2024-01-01-000100.sql"
        );
        assert_eq!(
            snapshot_name_at(SnapshotOrigin::PreRestore, now),
            "pre-restore-backup-2024-01-01-000100.sql"
        );
    }

    #[test]
    fn parse_timestamp_roundtrips_generated_names() {
        let now = Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 58).unwrap();
        let name = snapshot_name_at(SnapshotOrigin::PreRestore, now);
        assert_eq!(parse_snapshot_timestamp(&name), Some(now));
        assert_eq!(parse_snapshot_timestamp("custom.sql"), None);
        assert_eq!(parse_snapshot_timestamp("db-backup-garbage.sql"), None);
    }

    #[test]
    fn sanitize_strips_traversal_segments() {
        assert_eq!(sanitize_snapshot_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(
            sanitize_snapshot_name("..\\..\\db-backup-2024-01-01-000000.sql").unwrap(),
            "db-backup-2024-01-01-000000.sql"
        );
        assert_eq!(sanitize_snapshot_name("/abs/x.sql").unwrap(), "x.sql");
    }

    #[test]
    fn sanitize_rejects_empty_and_dot_names() {
        assert_matches!(sanitize_snapshot_name(""), Err(BackupError::Validation(_)));
        assert_matches!(sanitize_snapshot_name("   "), Err(BackupError::Validation(_)));
        assert_matches!(sanitize_snapshot_name("foo/.."), Err(BackupError::Validation(_)));
        assert_matches!(sanitize_snapshot_name("dir/"), Err(BackupError::Validation(_)));
        assert_matches!(sanitize_snapshot_name("a\0b.sql"), Err(BackupError::Validation(_)));
    }

    #[test]
    fn snapshot_namespace_excludes_marker_and_temp_files() {
        assert!(is_snapshot_file_name("db-backup-2024-01-01-000000.sql"));
        assert!(!is_snapshot_file_name(ACCESS_DENY_MARKER));
        assert!(!is_snapshot_file_name(".tmpAbC123"));
        assert!(!is_snapshot_file_name("passwd"));
        assert!(!is_snapshot_file_name(".sql"));
    }

    #[test]
    fn operation_lock_is_shared_per_database() {
        let a1 = operation_lock("db-a");
        let a2 = operation_lock("db-a");
        let b = operation_lock("db-b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
