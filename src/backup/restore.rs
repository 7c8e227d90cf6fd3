//! 恢复编排
//!
//! ```text
//! Requested ─┬─> AwaitingConfirmation                    （未确认，不触碰任何状态）
//!            ├─> Failed                                  （目标不存在 / 完整性校验失败）
//!            └─> SafetySnapshotting ─┬─> Failed          （安全快照失败，目标不会被加载）
//!                                    └─> Applying ─┬─> Committed
//!                                                  ├─> RolledBack
//!                                                  └─> Failed
//! ```
//!
//! 进入 `Applying` 之后的任何失败都以 [`BackupError::PartialFailure`] 返回，
//! 并给出安全快照名；人工恢复的方式始终是"恢复安全快照"。

use rusqlite::{Connection, DropBehavior, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::dump::{DumpProducer, DUMP_HEADER, DUMP_TRAILER_PREFIX};
use super::sql_split::{is_transaction_control, split_statements};
use super::store::SnapshotStore;
use super::BackupError;
use crate::backup_common::{operation_lock, safe_lock, CancelToken, Clock, OperationFileLock};
use crate::models::{SnapshotInfo, SnapshotOrigin};

/// 默认恢复超时（秒）
pub const DEFAULT_RESTORE_TIMEOUT_SECS: u64 = 600;

/// 进度回调间隔（虚拟机指令数）
const PROGRESS_HANDLER_OPS: i32 = 1000;

/// 恢复状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreState {
    Requested,
    AwaitingConfirmation,
    SafetySnapshotting,
    Applying,
    Committed,
    /// 工作单元已干净地中止，数据库保持恢复前的状态
    RolledBack,
    /// 加载前失败，或回滚本身未能确认完成
    Failed,
}

impl RestoreState {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreState::Requested => "requested",
            RestoreState::AwaitingConfirmation => "awaiting_confirmation",
            RestoreState::SafetySnapshotting => "safety_snapshotting",
            RestoreState::Applying => "applying",
            RestoreState::Committed => "committed",
            RestoreState::RolledBack => "rolled_back",
            RestoreState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestoreState::AwaitingConfirmation
                | RestoreState::Committed
                | RestoreState::RolledBack
                | RestoreState::Failed
        )
    }

    pub fn can_transition_to(self, next: RestoreState) -> bool {
        use RestoreState::*;
        matches!(
            (self, next),
            (Requested, AwaitingConfirmation)
                | (Requested, SafetySnapshotting)
                | (Requested, Failed)
                | (SafetySnapshotting, Applying)
                | (SafetySnapshotting, Failed)
                | (Applying, Committed)
                | (Applying, RolledBack)
                | (Applying, Failed)
        )
    }
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复请求
///
/// `confirmed` 是一次性的：只对本次调用生效，不会被记住。
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub target: String,
    pub confirmed: bool,
    pub cancel: CancelToken,
}

impl RestoreRequest {
    pub fn new(target: impl Into<String>, confirmed: bool) -> Self {
        Self {
            target: target.into(),
            confirmed,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// 恢复结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub state: RestoreState,
    pub target: SnapshotInfo,
    pub safety_snapshot: Option<SnapshotInfo>,
    pub statements_applied: usize,
    pub duration_ms: u64,
}

/// 状态变更回调
pub type StateObserver = Arc<dyn Fn(RestoreState) + Send + Sync>;

/// 跟踪当前状态并通知观察者
struct StateTracker<'a> {
    target: &'a str,
    state: RestoreState,
    observer: Option<&'a StateObserver>,
}

impl<'a> StateTracker<'a> {
    fn new(target: &'a str, observer: Option<&'a StateObserver>) -> Self {
        if let Some(observer) = observer {
            observer(RestoreState::Requested);
        }
        Self {
            target,
            state: RestoreState::Requested,
            observer,
        }
    }

    fn advance(&mut self, next: RestoreState) {
        if !self.state.can_transition_to(next) {
            error!(
                "[RestoreOrchestrator] Invalid transition {} -> {} for {}",
                self.state, next, self.target
            );
            debug_assert!(false, "invalid restore transition {} -> {}", self.state, next);
        }
        debug!(
            "[RestoreOrchestrator] {}: {} -> {}",
            self.target, self.state, next
        );
        self.state = next;
        if let Some(observer) = self.observer {
            observer(next);
        }
    }

    /// 失败收尾：记录终态并原样返回错误
    fn fail(&mut self, err: BackupError) -> BackupError {
        self.advance(RestoreState::Failed);
        err
    }
}

/// 工作单元失败信息
struct ApplyFailure {
    reason: String,
    rolled_back: bool,
    applied: usize,
}

/// 恢复编排器
#[derive(Clone)]
pub struct RestoreOrchestrator {
    store: SnapshotStore,
    producer: DumpProducer,
    timeout: Duration,
    observer: Option<StateObserver>,
}

impl fmt::Debug for RestoreOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreOrchestrator")
            .field("store", &self.store)
            .field("producer", &self.producer)
            .field("timeout", &self.timeout)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl RestoreOrchestrator {
    pub fn new(store: SnapshotStore, producer: DumpProducer) -> Self {
        Self {
            store,
            producer,
            timeout: Duration::from_secs(DEFAULT_RESTORE_TIMEOUT_SECS),
            observer: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行恢复
    ///
    /// 已确认的请求会持有 `database_id` 对应的操作锁（进程内互斥加快照目录中的
    /// 文件锁）直到返回，同一数据库的创建快照与其他恢复在此期间排队等待，
    /// 跨进程也是如此。
    pub fn restore(
        &self,
        conn: &mut Connection,
        database_id: &str,
        request: &RestoreRequest,
        clock: &dyn Clock,
    ) -> Result<RestoreOutcome, BackupError> {
        let started = Instant::now();
        let mut tracker = StateTracker::new(&request.target, self.observer.as_ref());

        let target = self.store.stat(&request.target).map_err(|e| tracker.fail(e))?;

        if !request.confirmed {
            tracker.advance(RestoreState::AwaitingConfirmation);
            info!(
                "[RestoreOrchestrator] Restore of {} awaiting confirmation",
                target.name
            );
            return Ok(RestoreOutcome {
                state: RestoreState::AwaitingConfirmation,
                target,
                safety_snapshot: None,
                statements_applied: 0,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let lock = operation_lock(database_id);
        let _guard = safe_lock(&lock);
        let _file_lock =
            OperationFileLock::acquire(self.store.dir(), database_id).map_err(|e| tracker.fail(e))?;
        info!(
            "[RestoreOrchestrator] Restoring {} into {}",
            target.name, database_id
        );

        let bytes = self.store.get(&target.name).map_err(|e| tracker.fail(e))?;
        let statements = verify_dump(&target.name, &bytes).map_err(|e| tracker.fail(e))?;

        tracker.advance(RestoreState::SafetySnapshotting);
        let (_, safety) = self
            .producer
            .produce_snapshot(conn, database_id, &self.store, SnapshotOrigin::PreRestore, clock)
            .map_err(|e| {
                error!(
                    "[RestoreOrchestrator] Safety snapshot failed, {} will not be loaded: {}",
                    target.name, e
                );
                tracker.fail(BackupError::SafetySnapshotFailed {
                    target: target.name.clone(),
                    source: Box::new(e),
                })
            })?;
        info!(
            "[RestoreOrchestrator] Safety snapshot {} persisted",
            safety.name
        );

        tracker.advance(RestoreState::Applying);
        let deadline = started
            .checked_add(self.timeout)
            .unwrap_or_else(|| started + Duration::from_secs(u32::MAX as u64));

        match apply_statements(conn, &statements, deadline, self.timeout, &request.cancel) {
            Ok(applied) => {
                tracker.advance(RestoreState::Committed);
                info!(
                    "[RestoreOrchestrator] Restore of {} committed ({} statements)",
                    target.name, applied
                );
                Ok(RestoreOutcome {
                    state: RestoreState::Committed,
                    target,
                    safety_snapshot: Some(safety),
                    statements_applied: applied,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(failure) => {
                let state = if failure.rolled_back {
                    RestoreState::RolledBack
                } else {
                    RestoreState::Failed
                };
                tracker.advance(state);
                error!(
                    "[RestoreOrchestrator] Restore of {} ended in {} after {} statements: {}. Safety snapshot: {}",
                    target.name, state, failure.applied, failure.reason, safety.name
                );
                Err(BackupError::PartialFailure {
                    target: target.name,
                    safety_snapshot: safety.name,
                    state,
                    reason: failure.reason,
                })
            }
        }
    }
}

/// 结构化完整性校验，返回需要执行的语句
///
/// - 必须是合法 UTF-8
/// - 带本工具头部的脚本必须以完成标记结尾（截断检测）
/// - 引号与块注释必须闭合
/// - 至少包含一条可执行语句
pub fn verify_dump<'a>(name: &str, bytes: &'a [u8]) -> Result<Vec<&'a str>, BackupError> {
    let integrity = |reason: String| BackupError::IntegrityCheckFailed {
        name: name.to_string(),
        reason,
    };

    let text = std::str::from_utf8(bytes)
        .map_err(|e| integrity(format!("not valid UTF-8: {}", e)))?;

    if text.trim_start().starts_with(DUMP_HEADER) {
        let complete = text
            .trim_end()
            .lines()
            .last()
            .map(|line| line.starts_with(DUMP_TRAILER_PREFIX))
            .unwrap_or(false);
        if !complete {
            return Err(integrity("completion trailer missing, dump is truncated".to_string()));
        }
    }

    let statements: Vec<&str> = split_statements(text)
        .map_err(|e| integrity(e.to_string()))?
        .into_iter()
        .filter(|stmt| !is_transaction_control(stmt))
        .collect();

    if statements.is_empty() {
        return Err(integrity("no executable statements".to_string()));
    }
    Ok(statements)
}

/// 在单个 IMMEDIATE 事务内执行全部语句
///
/// 外键检查在事务开始前关闭，返回前恢复原值。
fn apply_statements(
    conn: &mut Connection,
    statements: &[&str],
    deadline: Instant,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<usize, ApplyFailure> {
    let foreign_keys_on = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get::<_, i64>(0))
        .map(|v| v != 0)
        .map_err(|e| ApplyFailure {
            reason: format!("failed to read foreign_keys: {}", e),
            rolled_back: false,
            applied: 0,
        })?;
    if foreign_keys_on {
        conn.pragma_update(None, "foreign_keys", "OFF")
            .map_err(|e| ApplyFailure {
                reason: format!("failed to disable foreign_keys: {}", e),
                rolled_back: false,
                applied: 0,
            })?;
    }

    let result = run_unit_of_work(conn, statements, deadline, timeout, cancel);

    if foreign_keys_on {
        if let Err(e) = conn.pragma_update(None, "foreign_keys", "ON") {
            warn!(
                "[RestoreOrchestrator] Failed to re-enable foreign_keys: {}",
                e
            );
        }
    }
    result
}

fn run_unit_of_work(
    conn: &mut Connection,
    statements: &[&str],
    deadline: Instant,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<usize, ApplyFailure> {
    let mut tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| ApplyFailure {
            reason: format!("failed to begin transaction: {}", e),
            rolled_back: false,
            applied: 0,
        })?;
    let interrupt = cancel.clone();
    tx.progress_handler(
        PROGRESS_HANDLER_OPS,
        Some(move || interrupt.is_cancelled() || Instant::now() >= deadline),
    );
    tx.set_drop_behavior(DropBehavior::Rollback);

    let interrupted_reason = || {
        if cancel.is_cancelled() {
            "restore cancelled".to_string()
        } else {
            format!("restore timed out after {}s", timeout.as_secs())
        }
    };

    let mut applied = 0usize;
    let mut failure = None;
    for (idx, stmt) in statements.iter().enumerate() {
        if cancel.is_cancelled() || Instant::now() >= deadline {
            failure = Some(interrupted_reason());
            break;
        }
        match tx.execute_batch(stmt) {
            Ok(()) => applied += 1,
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::OperationInterrupted =>
            {
                failure = Some(interrupted_reason());
                break;
            }
            Err(e) => {
                failure = Some(format!(
                    "statement {} failed: {} ({})",
                    idx + 1,
                    e,
                    statement_preview(stmt)
                ));
                break;
            }
        }
    }

    // 提交/回滚不应被中断
    tx.progress_handler(0, None::<fn() -> bool>);

    match failure {
        None => {
            let committed = tx.commit();
            let clean = conn.is_autocommit();
            match committed {
                Ok(()) if clean => Ok(applied),
                Ok(()) => Err(ApplyFailure {
                    reason: "connection still inside a transaction after commit".to_string(),
                    rolled_back: false,
                    applied,
                }),
                Err(e) => Err(ApplyFailure {
                    reason: format!("commit failed: {}", e),
                    rolled_back: clean,
                    applied,
                }),
            }
        }
        Some(reason) => {
            // 被中断的语句可能已让 SQLite 自动回滚，finish 会识别这种情况
            let finished = tx.finish();
            let rolled_back = finished.is_ok() && conn.is_autocommit();
            if let Err(e) = finished {
                error!("[RestoreOrchestrator] Rollback failed: {}", e);
            }
            Err(ApplyFailure {
                reason,
                rolled_back,
                applied,
            })
        }
    }
}

fn statement_preview(stmt: &str) -> String {
    let flat: String = stmt.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 80 {
        format!("{}…", flat.chars().take(80).collect::<String>())
    } else {
        flat
    }
}
