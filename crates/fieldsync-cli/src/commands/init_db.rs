use std::path::Path;

use fieldsync_core::db::{ChangeStore, Database, SqliteChangeStore};

use crate::error::CliError;

pub fn run_init_db(db_path: &Path) -> Result<(), CliError> {
    let db = Database::open(db_path)?;
    let site_id = SqliteChangeStore::new(db.connection()).local_site_id()?;
    println!("Database ready at {} (site {site_id})", db_path.display());
    Ok(())
}
