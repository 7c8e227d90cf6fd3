//! 快照存储
//!
//! 单目录、扁平命名空间。所有名称在访问文件系统前都先经过
//! [`sanitize_snapshot_name`] 清洗，调用方传入什么都无法逃出该目录。

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::BackupError;
use crate::backup_common::{
    is_snapshot_file_name, log_and_skip_entry_err, parse_snapshot_timestamp,
    sanitize_snapshot_name, ACCESS_DENY_MARKER,
};
use crate::models::{SnapshotInfo, SnapshotOrigin};

/// 拒绝访问标记内容（Apache 2.2 / 2.4 两种写法）
const ACCESS_DENY_MARKER_CONTENT: &str = "# Snapshot directory: never serve over HTTP\nRequire all denied\nDeny from all\n";

/// 文件系统快照仓库
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// 打开（必要时创建）快照目录，并确认拒绝访问标记存在
    ///
    /// 标记只是声明该目录不得出现在公开请求面上，真正的拦截由 HTTP 边界负责。
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, BackupError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let marker = dir.join(ACCESS_DENY_MARKER);
        if !marker.is_file() {
            warn!(
                "[SnapshotStore] Access-deny marker missing, writing {:?}",
                marker
            );
            fs::write(&marker, ACCESS_DENY_MARKER_CONTENT)?;
        }

        info!("[SnapshotStore] Opened snapshot directory {:?}", dir);
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 目录是否带有拒绝访问标记
    pub fn has_access_marker(&self) -> bool {
        self.dir.join(ACCESS_DENY_MARKER).is_file()
    }

    /// 清洗名称并解析为快照路径
    ///
    /// 非快照命名空间内的名称（标记文件、临时文件、非 .sql）一律视为不存在。
    fn resolve(&self, raw: &str) -> Result<(String, PathBuf), BackupError> {
        let name = sanitize_snapshot_name(raw)?;
        if !is_snapshot_file_name(&name) {
            return Err(BackupError::NotFound(name));
        }
        let path = self.dir.join(&name);
        Ok((name, path))
    }

    /// 原子写入快照
    ///
    /// 1. 在同一目录创建临时文件（隐藏文件，list 不可见）
    /// 2. 写入并 fsync
    /// 3. 不覆盖式改名为目标文件
    ///
    /// 任一步骤失败都不会留下目标文件；已存在同名快照时拒绝写入。
    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<SnapshotInfo, BackupError> {
        let name = sanitize_snapshot_name(name)?;
        if !is_snapshot_file_name(&name) {
            return Err(BackupError::Validation(format!(
                "不是合法的快照文件名: {}",
                name
            )));
        }
        let target = self.dir.join(&name);
        if target.exists() {
            return Err(BackupError::AlreadyExists(name));
        }

        let mut temp = NamedTempFile::new_in(&self.dir)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;

        temp.persist_noclobber(&target).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                BackupError::AlreadyExists(name.clone())
            } else {
                BackupError::Io(e.error)
            }
        })?;
        sync_dir(&self.dir);

        debug!(
            "[SnapshotStore] Persisted {} ({} bytes)",
            name,
            bytes.len()
        );
        self.stat(&name)
    }

    /// 读取快照全部内容
    pub fn get(&self, name: &str) -> Result<Vec<u8>, BackupError> {
        let (name, path) = self.resolve(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::NotFound(name)),
            Err(e) => Err(BackupError::Io(e)),
        }
    }

    /// 以流方式打开快照
    pub fn open_reader(&self, name: &str) -> Result<(SnapshotInfo, File), BackupError> {
        let info = self.stat(name)?;
        let file = match File::open(self.dir.join(&info.name)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(info.name))
            }
            Err(e) => return Err(BackupError::Io(e)),
        };
        Ok((info, file))
    }

    /// 快照是否存在（不合法的名称视为不存在）
    pub fn exists(&self, name: &str) -> bool {
        self.stat(name).is_ok()
    }

    /// 查询单个快照元数据
    pub fn stat(&self, name: &str) -> Result<SnapshotInfo, BackupError> {
        let (name, path) = self.resolve(name)?;
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(BackupError::NotFound(name)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::NotFound(name))
            }
            Err(e) => return Err(BackupError::Io(e)),
        };
        Ok(snapshot_info(name, &meta))
    }

    /// 列出所有快照（按创建时间倒序）
    ///
    /// 每次调用都重新扫描目录，结果是有限且可重复获取的。
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, BackupError> {
        let mut snapshots = Vec::new();

        for entry in fs::read_dir(&self.dir)?.filter_map(log_and_skip_entry_err) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_snapshot_file_name(&name) {
                continue;
            }
            let Some(meta) = log_and_skip_entry_err(entry.metadata()) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            snapshots.push(snapshot_info(name, &meta));
        }

        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });

        Ok(snapshots)
    }

    /// 删除快照
    pub fn delete(&self, name: &str) -> Result<(), BackupError> {
        let (name, path) = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.dir);
                info!("[SnapshotStore] Deleted snapshot {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::NotFound(name)),
            Err(e) => Err(BackupError::Io(e)),
        }
    }
}

fn snapshot_info(name: String, meta: &fs::Metadata) -> SnapshotInfo {
    let created_at = parse_snapshot_timestamp(&name).unwrap_or_else(|| {
        meta.modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now())
    });
    SnapshotInfo {
        origin: SnapshotOrigin::from_name(&name),
        size: meta.len(),
        created_at,
        name,
    }
}

/// 刷新目录项，确保改名/删除持久化（仅 Unix，失败只记录）
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            warn!("[SnapshotStore] fsync on directory {:?} failed: {}", dir, e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
