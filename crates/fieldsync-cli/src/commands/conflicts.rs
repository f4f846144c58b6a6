use fieldsync_core::db::ConflictRepository;

use crate::commands::common::{conflict_to_item, format_conflict_lines, print_json, Toolkit};
use crate::error::CliError;

pub fn run_conflicts(limit: usize, as_json: bool, toolkit: &Toolkit) -> Result<(), CliError> {
    let conflicts = {
        let db = toolkit.db.lock()?;
        ConflictRepository::new(db.connection()).list_recent(limit)?
    };

    if as_json {
        let items: Vec<_> = conflicts.iter().map(conflict_to_item).collect();
        return print_json(&items);
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
