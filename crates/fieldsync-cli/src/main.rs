//! fieldsync CLI - Operator tools for a fieldsync server database
//!
//! Audits orphans and photo integrity, drives the upload queue and lists
//! recorded sync conflicts.

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::common::{resolve_db_path, Toolkit};
use crate::commands::completions::run_completions;
use crate::commands::conflicts::run_conflicts;
use crate::commands::init_db::run_init_db;
use crate::commands::integrity::run_integrity;
use crate::commands::orphans::run_orphans;
use crate::commands::uploads::run_uploads;
use crate::error::CliError;

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fieldsync=warn,fieldsync_core=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::InitDb => run_init_db(&db_path)?,
        Commands::Completions { shell, output } => run_completions(shell, output.as_deref())?,
        Commands::Orphans { fix, json } => run_orphans(fix, json, &Toolkit::from_env(&db_path)?)?,
        Commands::Integrity { photo, json } => {
            run_integrity(photo.as_deref(), json, &Toolkit::from_env(&db_path)?)?;
        }
        Commands::Uploads { command } => run_uploads(command, &Toolkit::from_env(&db_path)?)?,
        Commands::Conflicts { limit, json } => {
            run_conflicts(limit, json, &Toolkit::from_env(&db_path)?)?;
        }
    }

    Ok(())
}
