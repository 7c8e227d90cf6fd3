//! 日志初始化

use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// 安装全局 tracing 订阅者
///
/// 先加载 `.env`，级别由 `RUST_LOG` 控制，未设置时为 `default_level`。
/// 输出写到 stderr，stdout 留给命令结果。重复调用是安全的（已安装时忽略）。
pub fn init_tracing(default_level: LevelFilter) {
    let filter = env_filter(default_level, None);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// 加载 dotenv 文件后按 `RUST_LOG` 构造过滤器
///
/// `dotenv` 为 `None` 时从当前目录向上查找 `.env`。已存在的环境变量不会被覆盖。
pub fn env_filter(default_level: LevelFilter, dotenv: Option<&Path>) -> EnvFilter {
    let _ = match dotenv {
        Some(path) => dotenvy::from_path(path),
        None => dotenvy::dotenv().map(|_| ()),
    };

    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}
