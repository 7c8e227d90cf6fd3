mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};

use cli::{Cli, Commands};
use db_snapshot_lib::backup_config::DEFAULT_CONFIG_FILE;
use db_snapshot_lib::logging::init_tracing;
use db_snapshot_lib::{BackupService, BackupSettings, CancelToken, Principal, RestoreState, TrustTier};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // 同时加载 .env，后续配置读取可见其中的变量
    init_tracing(LevelFilter::INFO);

    let config_file = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let settings = BackupSettings::load_from(&config_file, None).context("loading configuration")?;
    let service = BackupService::from_settings(&settings).context("opening snapshot service")?;

    let tier = if cli.elevated {
        TrustTier::Elevated
    } else {
        TrustTier::Standard
    };
    let principal = Principal::new(cli.actor.clone(), tier);

    match cli.command {
        Commands::Create => {
            let info = blocking(move || service.create_backup(&principal)).await?;
            print_json(&info)?;
        }
        Commands::List => {
            let snapshots = blocking(move || service.list_backups(&principal)).await?;
            print_json(&snapshots)?;
        }
        Commands::Download { name, output } => {
            let written = blocking(move || -> Result<u64> {
                let mut download = service.download_backup(&principal, &name)?;
                match output {
                    Some(path) => write_to_file(&mut download, &path),
                    None => {
                        let stdout = std::io::stdout();
                        let mut lock = stdout.lock();
                        let n = std::io::copy(&mut download, &mut lock)?;
                        lock.flush()?;
                        Ok(n)
                    }
                }
            })
            .await?;
            info!("Downloaded {} bytes", written);
        }
        Commands::Delete { name } => {
            let deleted = name.clone();
            blocking(move || service.delete_backup(&principal, &name)).await?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
        Commands::Restore { name, confirm } => {
            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling restore");
                    on_interrupt.cancel();
                }
            });

            let outcome =
                blocking(move || service.restore_backup(&principal, &name, confirm, cancel)).await?;
            if outcome.state == RestoreState::AwaitingConfirmation {
                eprintln!(
                    "Restoring {} replaces the current database. Re-run with --confirm to proceed.",
                    outcome.target.name
                );
            }
            print_json(&outcome)?;
        }
    }

    Ok(())
}

/// 在阻塞线程池中执行同步操作
async fn blocking<T, E, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking task panicked")?
        .map_err(Into::into)
}

fn write_to_file(reader: &mut impl std::io::Read, path: &Path) -> Result<u64> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let n = std::io::copy(reader, &mut file)?;
    file.sync_all()?;
    Ok(n)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
