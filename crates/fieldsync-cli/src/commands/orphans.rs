use fieldsync_core::services::{AuditRun, OrphanReport, Relationship};

use crate::commands::common::{print_json, Toolkit};
use crate::error::CliError;

pub fn run_orphans(fix: bool, as_json: bool, toolkit: &Toolkit) -> Result<(), CliError> {
    let run = toolkit.orphan_auditor().run_once(fix)?;

    if as_json {
        print_json(&run)?;
    } else {
        for line in format_audit_lines(&run) {
            println!("{line}");
        }
    }

    let unresolved = unresolved_count(&run);
    if unresolved > 0 {
        return Err(CliError::OrphansRemain(unresolved));
    }
    Ok(())
}

/// Orphans still present once the run finished.
pub fn unresolved_count(run: &AuditRun) -> usize {
    let report = run.remaining.as_ref().unwrap_or(&run.report);
    report.total() + report.dangling_template_refs.len()
}

pub fn format_audit_lines(run: &AuditRun) -> Vec<String> {
    let mut lines = format_report_lines(&run.report);
    if let Some(cleanup) = &run.cleanup {
        lines.push(String::new());
        lines.push("Cleanup:".to_string());
        for (table, count) in &cleanup.deleted {
            lines.push(format!("  deleted {count:>4} from {table}"));
        }
        lines.push(format!(
            "  unlinked {} template reference(s)",
            cleanup.unlinked_templates
        ));
        lines.push(format!(
            "  removed {} cloud object(s)",
            cleanup.cloud_objects_deleted
        ));
    }
    if let Some(remaining) = &run.remaining {
        lines.push(format!("Remaining orphans: {}", remaining.total()));
    }
    lines
}

fn format_report_lines(report: &OrphanReport) -> Vec<String> {
    if report.is_clean() {
        return vec!["No orphaned rows found.".to_string()];
    }
    let mut lines: Vec<String> = Relationship::ALL
        .iter()
        .map(|relationship| {
            let count = report
                .by_relationship
                .get(relationship)
                .copied()
                .unwrap_or_default();
            format!(
                "{:<24} {count:>4}  ({}.{} -> {})",
                relationship.name(),
                relationship.child(),
                relationship.column(),
                relationship.parent()
            )
        })
        .collect();
    lines.push(format!("Unique orphaned rows: {}", report.total()));
    if !report.dangling_template_refs.is_empty() {
        lines.push(format!(
            "Surveys with a dangling template reference: {}",
            report.dangling_template_refs.len()
        ));
    }
    lines
}
