/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "db-snapshot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Actor name recorded in the audit log
    #[arg(long, global = true, default_value = "cli")]
    pub actor: String,

    /// Act with the elevated tier (required for restore)
    #[arg(long, global = true)]
    pub elevated: bool,

    /// Config file (default: config/db_snapshot.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a snapshot of the configured database
    Create,

    /// List snapshots, newest first
    List,

    /// Write a snapshot to a file or stdout
    Download {
        name: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a snapshot
    Delete { name: String },

    /// Restore a snapshot (dry run unless --confirm is given)
    Restore {
        name: String,

        /// Actually apply the snapshot
        #[arg(long)]
        confirm: bool,
    },
}
