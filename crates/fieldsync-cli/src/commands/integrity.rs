use fieldsync_core::services::{CheckSource, IntegrityReport, PhotoCheck};
use serde::Serialize;

use crate::commands::common::{normalize_photo_id, print_json, Toolkit};
use crate::error::CliError;

#[derive(Serialize)]
struct PhotoCheckItem<'a> {
    photo_id: &'a str,
    #[serde(flatten)]
    check: &'a PhotoCheck,
}

pub fn run_integrity(photo: Option<&str>, as_json: bool, toolkit: &Toolkit) -> Result<(), CliError> {
    let auditor = toolkit.integrity_auditor()?;

    if let Some(photo_id) = photo {
        let photo_id = normalize_photo_id(photo_id)?;
        let check = auditor.check_photo(&photo_id)?;
        if as_json {
            print_json(&PhotoCheckItem {
                photo_id: &photo_id,
                check: &check,
            })?;
        } else {
            println!("{photo_id}: {}", describe_check(&check));
        }
        return match check {
            PhotoCheck::Corrupted { .. } => Err(CliError::CorruptionFound(1)),
            _ => Ok(()),
        };
    }

    let report = auditor.run_full()?;
    if as_json {
        print_json(&report)?;
    } else {
        for line in format_report_lines(&report) {
            println!("{line}");
        }
    }
    if report.is_clean() {
        Ok(())
    } else {
        Err(CliError::CorruptionFound(report.corrupted.len()))
    }
}

pub fn describe_check(check: &PhotoCheck) -> String {
    match check {
        PhotoCheck::Verified { source } => format!("verified ({})", source_label(*source)),
        PhotoCheck::Corrupted { source, reason } => {
            format!("CORRUPTED ({}): {reason}", source_label(*source))
        }
        PhotoCheck::Skipped { reason } => format!("skipped: {reason}"),
        PhotoCheck::Unavailable { reason } => format!("unavailable: {reason}"),
    }
}

const fn source_label(source: CheckSource) -> &'static str {
    match source {
        CheckSource::LocalFile => "local file",
        CheckSource::Cloud => "cloud copy",
    }
}

pub fn format_report_lines(report: &IntegrityReport) -> Vec<String> {
    let mut lines = vec![format!(
        "checked={} verified={} corrupted={} skipped={} unavailable={}",
        report.checked,
        report.verified,
        report.corrupted.len(),
        report.skipped,
        report.unavailable
    )];
    lines.extend(report.corrupted.iter().map(|id| format!("  corrupted: {id}")));
    lines
}
