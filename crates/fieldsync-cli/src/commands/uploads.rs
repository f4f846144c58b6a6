use fieldsync_core::services::{CycleReport, QueueStatus};

use crate::cli::UploadCommands;
use crate::commands::common::{normalize_photo_id, print_json, Toolkit};
use crate::error::CliError;

pub fn run_uploads(command: UploadCommands, toolkit: &Toolkit) -> Result<(), CliError> {
    let queue = toolkit.upload_queue()?;
    match command {
        UploadCommands::Status { json } => {
            let status = queue.status()?;
            if json {
                print_json(&status)?;
            } else {
                for line in format_status_lines(&status) {
                    println!("{line}");
                }
            }
        }
        UploadCommands::Run => {
            let report = queue.process_cycle()?;
            println!("{}", format_cycle(&report));
        }
        UploadCommands::Recover { ids } => {
            let ids = ids
                .iter()
                .map(|id| normalize_photo_id(id))
                .collect::<Result<Vec<_>, _>>()?;
            let filter = (!ids.is_empty()).then_some(ids.as_slice());
            let recovered = queue.recover_permanently_failed(filter)?;
            println!("Recovered {recovered} photo(s) for another upload attempt");
        }
    }
    Ok(())
}

pub fn format_status_lines(status: &QueueStatus) -> Vec<String> {
    let mut lines: Vec<String> = if status.counts.is_empty() {
        vec!["No photos recorded.".to_string()]
    } else {
        status
            .counts
            .iter()
            .map(|(state, count)| format!("{state:<20} {count:>6}"))
            .collect()
    };
    lines.push(format!(
        "circuit breaker: {:?} (failures={})",
        status.breaker.state, status.breaker.failure_count
    ));
    lines
}

pub fn format_cycle(report: &CycleReport) -> String {
    format!(
        "selected={} uploaded={} failed={} stale={} exhausted={} recovered={}",
        report.selected,
        report.uploaded,
        report.failed,
        report.stale_marked,
        report.exhausted,
        report.recovered
    )
}
