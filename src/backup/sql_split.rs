//! SQL 语句切分
//!
//! 按 `;` 切分脚本，但不会被以下内容中的分号误导：
//! - 字符串与标识符：`'…'`、`"…"`、`` `…` ``、`[…]`（引号重复视为转义）
//! - 注释：`-- …` 行注释、`/* … */` 块注释
//! - 触发器体：`CREATE [TEMP] TRIGGER … BEGIN …; …; END;` 只在 `END;` 处结束
//!
//! 与 `sqlite3_complete()` 的判定一致：触发器内只有紧跟在 `;` 之后的 `END`
//! 才结束触发器，体内 `CASE … END;` 的 `END` 不算。

use std::fmt;

/// 切分失败（脚本结构不完整）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    /// 引号未闭合
    UnterminatedLiteral { quote: char, offset: usize },
    /// 块注释未闭合
    UnterminatedComment { offset: usize },
}

impl fmt::Display for SplitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitError::UnterminatedLiteral { quote, offset } => {
                write!(f, "unterminated {} literal starting at byte {}", quote, offset)
            }
            SplitError::UnterminatedComment { offset } => {
                write!(f, "unterminated block comment starting at byte {}", offset)
            }
        }
    }
}

impl std::error::Error for SplitError {}

/// 当前语句的关键字状态
#[derive(Default)]
struct StatementState {
    has_code: bool,
    leading_words: Vec<String>,
    in_trigger: bool,
    /// 上一个记号是触发器体内的 `;`
    after_body_semicolon: bool,
    /// 当前记号是紧跟 `;` 的 `END`
    closes_trigger: bool,
}

impl StatementState {
    fn push_word(&mut self, word: &str) {
        self.has_code = true;
        self.closes_trigger = self.after_body_semicolon && word.eq_ignore_ascii_case("END");
        self.after_body_semicolon = false;
        if self.leading_words.len() < 3 {
            self.leading_words.push(word.to_ascii_uppercase());
            self.in_trigger = is_create_trigger(&self.leading_words);
        }
    }

    fn push_other(&mut self) {
        self.has_code = true;
        self.closes_trigger = false;
        self.after_body_semicolon = false;
    }

    fn push_body_semicolon(&mut self) {
        self.push_other();
        self.after_body_semicolon = true;
    }
}

fn is_create_trigger(words: &[String]) -> bool {
    match words {
        [create, trigger, ..] if create == "CREATE" && trigger == "TRIGGER" => true,
        [create, temp, trigger]
            if create == "CREATE"
                && (temp == "TEMP" || temp == "TEMPORARY")
                && trigger == "TRIGGER" =>
        {
            true
        }
        _ => false,
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// 跳过引号包裹的内容，返回闭合引号之后的位置
fn skip_quoted(bytes: &[u8], start: usize, close: u8) -> Result<usize, SplitError> {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == close {
            // 重复引号是转义（'' 或 ""），[ ] 没有转义
            if close != b']' && bytes.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return Ok(i + 1);
        }
        i += 1;
    }
    Err(SplitError::UnterminatedLiteral {
        quote: bytes[start] as char,
        offset: start,
    })
}

/// 将脚本切分为独立语句（去掉结尾分号并去除首尾空白）
///
/// 仅包含空白或注释的片段会被跳过。
pub fn split_statements(script: &str) -> Result<Vec<&str>, SplitError> {
    let bytes = script.as_bytes();
    let mut statements = Vec::new();
    let mut state = StatementState::default();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' | b'`' => {
                i = skip_quoted(bytes, i, b)?;
                state.push_other();
            }
            b'[' => {
                i = skip_quoted(bytes, i, b']')?;
                state.push_other();
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let comment_start = i;
                i += 2;
                loop {
                    if i + 1 >= bytes.len() {
                        return Err(SplitError::UnterminatedComment {
                            offset: comment_start,
                        });
                    }
                    if bytes[i] == b'*' && bytes[i + 1] == b'/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            b';' => {
                if state.in_trigger && !state.closes_trigger {
                    state.push_body_semicolon();
                    i += 1;
                    continue;
                }
                if state.has_code {
                    statements.push(script[start..i].trim());
                }
                state = StatementState::default();
                i += 1;
                start = i;
            }
            _ if is_word_byte(b) => {
                let word_start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                state.push_word(&script[word_start..i]);
            }
            _ if b.is_ascii_whitespace() => {
                i += 1;
            }
            _ => {
                state.push_other();
                i += 1;
            }
        }
    }

    if state.has_code {
        statements.push(script[start..].trim());
    }

    Ok(statements)
}

/// 返回语句的首个关键字（大写），跳过前导空白与注释
pub fn leading_keyword(statement: &str) -> Option<String> {
    let bytes = statement.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b if b.is_ascii_whitespace() => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            b if is_word_byte(b) => {
                let start = i;
                while i < bytes.len() && is_word_byte(bytes[i]) {
                    i += 1;
                }
                return Some(statement[start..i].to_ascii_uppercase());
            }
            _ => return None,
        }
    }
    None
}

/// 是否为事务控制语句（恢复时由外层事务接管，需跳过）
pub fn is_transaction_control(statement: &str) -> bool {
    matches!(
        leading_keyword(statement).as_deref(),
        Some("BEGIN" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE")
    )
}
