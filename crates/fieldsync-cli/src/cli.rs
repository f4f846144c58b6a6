use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Operator tools for a fieldsync server database")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the server database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or migrate the database
    InitDb,
    /// Report rows whose parent no longer exists
    Orphans {
        /// Delete orphans and unlink dangling template references
        #[arg(long)]
        fix: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Verify stored photo bytes against their recorded hashes
    Integrity {
        /// Check a single photo instead of all of them
        #[arg(long, value_name = "ID")]
        photo: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and drive the photo upload queue
    Uploads {
        #[command(subcommand)]
        command: UploadCommands,
    },
    /// List recently recorded sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum UploadCommands {
    /// Show photo counts per upload status and the circuit breaker state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one upload cycle now
    Run,
    /// Give permanently failed uploads another chance
    Recover {
        /// Photo ids to recover (all permanently failed photos when omitted)
        ids: Vec<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
