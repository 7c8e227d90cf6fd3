//! SQL 导出
//!
//! 将当前数据库的 schema 与数据导出为可重放的 SQL 脚本。
//! 整个脚本先在内存中生成完毕，只有生成成功后才交给快照存储落盘，
//! 中途失败不会留下任何部分快照。

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

use super::store::SnapshotStore;
use super::BackupError;
use crate::backup_common::{snapshot_name_at, Clock};
use crate::models::{SnapshotInfo, SnapshotOrigin};

/// 脚本首行标识
pub const DUMP_HEADER: &str = "-- db-snapshot SQL dump";

/// 脚本结束标记前缀（用于恢复前的截断检测）
pub const DUMP_TRAILER_PREFIX: &str = "-- Dump completed on ";

/// 快照名冲突时的最大尝试次数
pub const NAME_COLLISION_ATTEMPTS: usize = 3;

/// 导出选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpOptions {
    /// 在 CREATE 前输出 DROP
    pub add_drop: bool,
    /// 输出逐行 INSERT
    pub add_insert: bool,
    /// 加载期间关闭外键检查，使表顺序无关
    pub disable_fk_checks: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            add_drop: true,
            add_insert: true,
            disable_fk_checks: true,
        }
    }
}

/// 单表导出统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDump {
    pub name: String,
    pub row_count: u64,
}

/// 生成完毕的导出脚本
#[derive(Debug, Clone)]
pub struct DumpScript {
    pub database_id: String,
    pub generated_at: DateTime<Utc>,
    pub tables: Vec<TableDump>,
    sql: String,
}

impl DumpScript {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.sql.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.sql.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    /// 导出时某张表的行数
    pub fn row_count(&self, table: &str) -> Option<u64> {
        self.tables
            .iter()
            .find(|t| t.name == table)
            .map(|t| t.row_count)
    }
}

/// sqlite_master 中的一个对象
struct SchemaObject {
    kind: String,
    name: String,
    sql: String,
}

/// 导出器
#[derive(Debug, Clone, Default)]
pub struct DumpProducer {
    options: DumpOptions,
}

impl DumpProducer {
    pub fn new(options: DumpOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> DumpOptions {
        self.options
    }

    /// 生成完整导出脚本
    ///
    /// 输出顺序：表（DROP/CREATE/INSERT）→ 索引 → 视图 → 触发器，
    /// 同类对象按创建顺序排列。连接处于自动提交模式时，所有读取在同一个
    /// 读事务内完成，各表来自同一时间点。
    pub fn produce(
        &self,
        conn: &Connection,
        database_id: &str,
        generated_at: DateTime<Utc>,
    ) -> Result<DumpScript, BackupError> {
        let _read_fence = if conn.is_autocommit() {
            Some(conn.unchecked_transaction()?)
        } else {
            None
        };
        let objects = load_schema_objects(conn)?;
        let shadow_tables = load_shadow_tables(conn)?;
        let timestamp = generated_at.to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut sql = String::with_capacity(4096);
        sql.push_str(DUMP_HEADER);
        sql.push('\n');
        sql.push_str(&format!("-- Database: {}\n", single_line(database_id)));
        sql.push_str(&format!("-- Generated: {}\n", timestamp));
        sql.push_str(&format!(
            "-- Options: add_drop={} add_insert={} disable_fk_checks={}\n\n",
            self.options.add_drop, self.options.add_insert, self.options.disable_fk_checks
        ));

        if self.options.disable_fk_checks {
            sql.push_str("PRAGMA foreign_keys=OFF;\n");
        }

        let mut tables = Vec::new();
        for object in objects.iter().filter(|o| o.kind == "table") {
            // 影子表由 CREATE VIRTUAL TABLE 重建
            if shadow_tables.contains(&object.name) {
                debug!("[DumpProducer] Skipping shadow table {}", object.name);
                continue;
            }

            sql.push_str(&format!("\n-- Table: {}\n", single_line(&object.name)));
            if self.options.add_drop {
                sql.push_str(&format!(
                    "DROP TABLE IF EXISTS {};\n",
                    quote_identifier(&object.name)
                ));
            }
            sql.push_str(object.sql.trim_end_matches(';'));
            sql.push_str(";\n");

            let row_count = if self.options.add_insert {
                dump_rows(conn, &object.name, &mut sql)?
            } else {
                count_rows(conn, &object.name)?
            };
            tables.push(TableDump {
                name: object.name.clone(),
                row_count,
            });
        }

        for kind in ["index", "view", "trigger"] {
            let mut section_started = false;
            for object in objects.iter().filter(|o| o.kind == kind) {
                if !section_started {
                    sql.push_str(&format!("\n-- {}s\n", kind));
                    section_started = true;
                }
                if kind == "view" && self.options.add_drop {
                    sql.push_str(&format!(
                        "DROP VIEW IF EXISTS {};\n",
                        quote_identifier(&object.name)
                    ));
                }
                sql.push_str(object.sql.trim_end_matches(';'));
                sql.push_str(";\n");
            }
        }

        if self.options.disable_fk_checks {
            sql.push_str("\nPRAGMA foreign_keys=ON;\n");
        }
        sql.push_str(&format!("\n{}{}\n", DUMP_TRAILER_PREFIX, timestamp));

        info!(
            "[DumpProducer] Dumped {} tables ({} bytes) from {}",
            tables.len(),
            sql.len(),
            database_id
        );

        Ok(DumpScript {
            database_id: database_id.to_string(),
            generated_at,
            tables,
            sql,
        })
    }

    /// 生成脚本并原子写入快照存储
    ///
    /// 只有脚本完整生成后才调用 `store.put`，失败时磁盘上不会出现该快照。
    /// 快照名精确到秒；同一秒内已存在同名快照时等待下一秒重试，最多
    /// [`NAME_COLLISION_ATTEMPTS`] 次。调用方通常持有操作锁，冲突时同一
    /// 数据库的其他操作最多会多等约 [`NAME_COLLISION_ATTEMPTS`] 秒。
    ///
    /// 生成或写入失败返回 [`BackupError::SnapshotFailed`]，其中带有本次
    /// 尝试的快照名。
    pub fn produce_snapshot(
        &self,
        conn: &Connection,
        database_id: &str,
        store: &SnapshotStore,
        origin: SnapshotOrigin,
        clock: &dyn Clock,
    ) -> Result<(DumpScript, SnapshotInfo), BackupError> {
        let mut last_name = String::new();
        for attempt in 1..=NAME_COLLISION_ATTEMPTS {
            let now = clock.now();
            let name = snapshot_name_at(origin, now);
            if store.exists(&name) {
                debug!(
                    "[DumpProducer] Snapshot name {} taken (attempt {}), waiting",
                    name, attempt
                );
                last_name = name;
                clock.wait_for_next_second(now);
                continue;
            }

            let script = self
                .produce(conn, database_id, now)
                .map_err(|e| BackupError::snapshot_failed(&name, e))?;
            match store.put(&name, script.as_bytes()) {
                Ok(info) => {
                    info!(
                        "[DumpProducer] Snapshot {} written ({} bytes, origin={})",
                        info.name, info.size, origin
                    );
                    return Ok((script, info));
                }
                Err(BackupError::AlreadyExists(taken)) => {
                    last_name = taken;
                    clock.wait_for_next_second(now);
                }
                Err(e) => return Err(BackupError::snapshot_failed(&name, e)),
            }
        }
        Err(BackupError::AlreadyExists(last_name))
    }
}

fn load_schema_objects(conn: &Connection) -> Result<Vec<SchemaObject>, BackupError> {
    let mut stmt = conn.prepare(
        "SELECT type, name, sql FROM sqlite_master \
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
         ORDER BY rowid",
    )?;
    let objects = stmt
        .query_map([], |row| {
            Ok(SchemaObject {
                kind: row.get(0)?,
                name: row.get(1)?,
                sql: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(objects)
}

/// 由 SQLite 标记为影子表的表名
fn load_shadow_tables(conn: &Connection) -> Result<HashSet<String>, BackupError> {
    // 虚表连接后 SQLite 才会标记其影子表
    let virtual_tables = {
        let mut stmt = conn.prepare(
            "SELECT name FROM pragma_table_list WHERE schema = 'main' AND type = 'virtual'",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
    };
    for table in &virtual_tables {
        conn.prepare(&format!("SELECT * FROM {} LIMIT 0", quote_identifier(table)))?;
    }

    let mut stmt = conn.prepare(
        "SELECT name FROM pragma_table_list WHERE schema = 'main' AND type = 'shadow'",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

/// 可写入的列（排除生成列与虚表隐藏列）
fn insertable_columns(conn: &Connection, table: &str) -> Result<Vec<String>, BackupError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_xinfo({})", quote_identifier(table)))?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get("name")?;
            let hidden: i64 = row.get("hidden")?;
            Ok((name, hidden))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns
        .into_iter()
        .filter(|(_, hidden)| *hidden == 0)
        .map(|(name, _)| name)
        .collect())
}

fn dump_rows(conn: &Connection, table: &str, out: &mut String) -> Result<u64, BackupError> {
    let quoted = quote_identifier(table);
    let columns = insertable_columns(conn, table)?;
    if columns.is_empty() {
        return count_rows(conn, table);
    }
    let column_list = columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(",");

    let mut stmt = conn.prepare(&format!("SELECT {} FROM {}", column_list, quoted))?;
    let column_count = columns.len();
    let prefix = format!("INSERT INTO {} ({}) VALUES (", quoted, column_list);

    let mut rows = stmt.query([])?;
    let mut count = 0u64;
    while let Some(row) = rows.next()? {
        out.push_str(&prefix);
        for idx in 0..column_count {
            if idx > 0 {
                out.push(',');
            }
            push_sql_literal(out, row.get_ref(idx)?);
        }
        out.push_str(");\n");
        count += 1;
    }
    Ok(count)
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64, BackupError> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_identifier(table)),
        [],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

/// 以 SQL 字面量形式追加一个值
fn push_sql_literal(out: &mut String, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => out.push_str("NULL"),
        ValueRef::Integer(v) => out.push_str(&v.to_string()),
        ValueRef::Real(f) => {
            if f.is_nan() {
                out.push_str("NULL");
            } else if f.is_infinite() {
                out.push_str(if f > 0.0 { "9e999" } else { "-9e999" });
            } else {
                // Debug 输出保证可往返且总带小数点或指数
                out.push_str(&format!("{:?}", f));
            }
        }
        ValueRef::Text(t) => match std::str::from_utf8(t) {
            Ok(s) => {
                out.push('\'');
                out.push_str(&s.replace('\'', "''"));
                out.push('\'');
            }
            // 非 UTF-8 文本按原始字节还原
            Err(_) => {
                out.push_str("CAST(X'");
                out.push_str(&hex::encode(t));
                out.push_str("' AS TEXT)");
            }
        },
        ValueRef::Blob(b) => {
            out.push_str("X'");
            out.push_str(&hex::encode(b));
            out.push('\'');
        }
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}
