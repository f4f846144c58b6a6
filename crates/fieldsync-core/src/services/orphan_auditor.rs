//! Referential-integrity audit and repair.
//!
//! Replication accepts children before their parents, so dangling foreign
//! keys are expected for a while. This auditor finds rows whose parent never
//! arrived (or was deleted) and, in fix mode, removes them with everything
//! that hangs off them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::worker::BackgroundWorker;
use crate::db::{ChangeStore, PhotoRepository, SharedDatabase, SqliteChangeStore};
use crate::error::Result;
use crate::models::PrimaryKey;
use crate::schema::{PkKind, Table};
use crate::storage::CloudStorageClient;

/// A parent/child link checked by the auditor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    SiteProject,
    SurveySite,
    ResponseSurvey,
    TemplateFieldTemplate,
    PhotoSurvey,
    PhotoSite,
}

impl Relationship {
    pub const ALL: [Self; 6] = [
        Self::SiteProject,
        Self::SurveySite,
        Self::ResponseSurvey,
        Self::TemplateFieldTemplate,
        Self::PhotoSurvey,
        Self::PhotoSite,
    ];

    pub const fn child(self) -> Table {
        match self {
            Self::SiteProject => Table::Sites,
            Self::SurveySite => Table::Survey,
            Self::ResponseSurvey => Table::SurveyResponse,
            Self::TemplateFieldTemplate => Table::TemplateField,
            Self::PhotoSurvey | Self::PhotoSite => Table::Photo,
        }
    }

    pub const fn column(self) -> &'static str {
        match self {
            Self::SiteProject => "project_id",
            Self::SurveySite | Self::PhotoSite => "site_id",
            Self::ResponseSurvey | Self::PhotoSurvey => "survey_id",
            Self::TemplateFieldTemplate => "template_id",
        }
    }

    pub const fn parent(self) -> Table {
        match self {
            Self::SiteProject => Table::Projects,
            Self::SurveySite | Self::PhotoSite => Table::Sites,
            Self::ResponseSurvey | Self::PhotoSurvey => Table::Survey,
            Self::TemplateFieldTemplate => Table::SurveyTemplate,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::SiteProject => "site_project",
            Self::SurveySite => "survey_site",
            Self::ResponseSurvey => "response_survey",
            Self::TemplateFieldTemplate => "template_field_template",
            Self::PhotoSurvey => "photo_survey",
            Self::PhotoSite => "photo_site",
        }
    }
}

/// Result of an orphan scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    /// Dangling references per relationship.
    pub by_relationship: BTreeMap<Relationship, usize>,
    /// Unique orphan rows per child table.
    pub orphans: BTreeMap<Table, BTreeSet<PrimaryKey>>,
    /// Surveys whose optional template reference points nowhere.
    pub dangling_template_refs: BTreeSet<PrimaryKey>,
}

impl OrphanReport {
    /// Number of unique orphan rows.
    pub fn total(&self) -> usize {
        self.orphans.values().map(BTreeSet::len).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0 && self.dangling_template_refs.is_empty()
    }

    fn orphans_of(&self, table: Table) -> impl Iterator<Item = &PrimaryKey> {
        self.orphans.get(&table).into_iter().flatten()
    }
}

/// What a fix pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    /// Deleted rows per table, cascades included.
    pub deleted: BTreeMap<Table, usize>,
    pub unlinked_templates: usize,
    pub cloud_objects_deleted: usize,
}

/// One auditor run. `cleanup` and `remaining` are set when fixes ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRun {
    pub report: OrphanReport,
    pub cleanup: Option<CleanupSummary>,
    pub remaining: Option<OrphanReport>,
}

fn read_key(row: &rusqlite::Row<'_>, kind: PkKind) -> rusqlite::Result<PrimaryKey> {
    match kind {
        PkKind::Integer => row.get(0).map(PrimaryKey::Integer),
        PkKind::Text => row.get(0).map(PrimaryKey::Text),
    }
}

fn dangling_rows(
    conn: &Connection,
    child: Table,
    column: &str,
    parent: Table,
) -> Result<Vec<PrimaryKey>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT c.id FROM {child} c
         WHERE c.{column} IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM {parent} p WHERE p.id = c.{column})
         ORDER BY c.id"
    ))?;
    let kind = child.pk_kind();
    let keys = stmt
        .query_map([], |row| read_key(row, kind))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys)
}

/// Find rows whose parent does not exist. Null references are not orphans.
pub fn scan(conn: &Connection) -> Result<OrphanReport> {
    let mut report = OrphanReport::default();
    for relationship in Relationship::ALL {
        let keys = dangling_rows(
            conn,
            relationship.child(),
            relationship.column(),
            relationship.parent(),
        )?;
        report.by_relationship.insert(relationship, keys.len());
        if !keys.is_empty() {
            tracing::warn!(
                relationship = relationship.name(),
                count = keys.len(),
                "Found orphaned rows"
            );
            report
                .orphans
                .entry(relationship.child())
                .or_default()
                .extend(keys);
        }
    }

    report.dangling_template_refs =
        dangling_rows(conn, Table::Survey, "template_id", Table::SurveyTemplate)?
            .into_iter()
            .collect();
    Ok(report)
}

/// Deletes rows with their dependents and clocks inside one transaction.
struct Cascade<'a> {
    conn: &'a Connection,
    summary: CleanupSummary,
    cloud_urls: Vec<String>,
}

impl<'a> Cascade<'a> {
    fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            summary: CleanupSummary::default(),
            cloud_urls: Vec::new(),
        }
    }

    fn child_ids<T: rusqlite::types::FromSql>(
        &self,
        child: Table,
        column: &str,
        parent_id: i64,
    ) -> Result<Vec<T>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {child} WHERE {column} = ?1 ORDER BY id"))?;
        let ids = stmt
            .query_map([parent_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn delete_row(&mut self, table: Table, pk: &PrimaryKey) -> Result<()> {
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![pk])?;
        if removed > 0 {
            SqliteChangeStore::new(self.conn).forget_row(table, pk)?;
            *self.summary.deleted.entry(table).or_default() += removed;
        }
        Ok(())
    }

    fn delete_photo(&mut self, id: &str) -> Result<()> {
        if let Some(photo) = PhotoRepository::new(self.conn).delete(id)? {
            *self.summary.deleted.entry(Table::Photo).or_default() += 1;
            self.cloud_urls
                .extend([photo.cloud_url, photo.thumbnail_url].into_iter().filter(|url| !url.is_empty()));
        }
        Ok(())
    }

    fn delete_survey(&mut self, id: i64) -> Result<()> {
        for photo_id in self.child_ids::<String>(Table::Photo, "survey_id", id)? {
            self.delete_photo(&photo_id)?;
        }
        for response_id in self.child_ids::<i64>(Table::SurveyResponse, "survey_id", id)? {
            self.delete_row(Table::SurveyResponse, &PrimaryKey::Integer(response_id))?;
        }
        self.delete_row(Table::Survey, &PrimaryKey::Integer(id))
    }

    fn delete_site(&mut self, id: i64) -> Result<()> {
        for survey_id in self.child_ids::<i64>(Table::Survey, "site_id", id)? {
            self.delete_survey(survey_id)?;
        }
        for photo_id in self.child_ids::<String>(Table::Photo, "site_id", id)? {
            self.delete_photo(&photo_id)?;
        }
        self.delete_row(Table::Sites, &PrimaryKey::Integer(id))
    }

    fn row_exists(&self, table: Table, pk: &PrimaryKey) -> Result<bool> {
        let found = self
            .conn
            .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), [pk], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

/// Delete every orphan in `report` with its dependents and unlink dangling
/// template references, all in one transaction.
///
/// Returns the summary and the cloud URLs of deleted photos. Cloud objects
/// are left alone here so a rollback never loses data.
pub fn fix(conn: &mut Connection, report: &OrphanReport) -> Result<(CleanupSummary, Vec<String>)> {
    let tx = conn.transaction()?;
    let mut cascade = Cascade::new(&tx);

    for pk in report.orphans_of(Table::Photo) {
        if let PrimaryKey::Text(id) = pk {
            cascade.delete_photo(id)?;
        }
    }
    for pk in report.orphans_of(Table::SurveyResponse) {
        cascade.delete_row(Table::SurveyResponse, pk)?;
    }
    for pk in report.orphans_of(Table::TemplateField) {
        cascade.delete_row(Table::TemplateField, pk)?;
    }
    for pk in report.orphans_of(Table::Survey) {
        if let Some(id) = pk.as_integer() {
            cascade.delete_survey(id)?;
        }
    }
    for pk in report.orphans_of(Table::Sites) {
        if let Some(id) = pk.as_integer() {
            cascade.delete_site(id)?;
        }
    }

    for pk in &report.dangling_template_refs {
        if cascade.row_exists(Table::Survey, pk)? {
            SqliteChangeStore::new(&tx).write_local(
                Table::Survey,
                pk,
                &[("template_id", SqlValue::Null)],
            )?;
            cascade.summary.unlinked_templates += 1;
        }
    }

    let Cascade {
        summary, cloud_urls, ..
    } = cascade;
    tx.commit()?;

    tracing::info!(
        deleted = ?summary.deleted,
        unlinked_templates = summary.unlinked_templates,
        "Orphan cleanup committed"
    );
    Ok((summary, cloud_urls))
}

/// Periodic orphan audit with automatic repair.
pub struct OrphanAuditor {
    db: SharedDatabase,
    cloud: Arc<CloudStorageClient>,
    interval: Duration,
    worker: BackgroundWorker,
}

impl OrphanAuditor {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

    pub fn new(db: SharedDatabase, cloud: Arc<CloudStorageClient>, interval: Duration) -> Self {
        Self {
            db,
            cloud,
            interval,
            worker: BackgroundWorker::new("orphan-auditor"),
        }
    }

    /// Scan and, when `fix` is set, repair. Cloud objects of deleted photos
    /// are removed after the database lock is released.
    pub fn run_once(&self, fix: bool) -> Result<AuditRun> {
        let (mut run, cloud_urls) = {
            let mut db = self.db.lock()?;
            let report = scan(db.connection())?;
            if !fix || report.is_clean() {
                return Ok(AuditRun {
                    report,
                    cleanup: None,
                    remaining: None,
                });
            }
            let (cleanup, cloud_urls) = self::fix(db.connection_mut(), &report)?;
            let remaining = scan(db.connection())?;
            let run = AuditRun {
                report,
                cleanup: Some(cleanup),
                remaining: Some(remaining),
            };
            (run, cloud_urls)
        };

        if !cloud_urls.is_empty() {
            let urls: Vec<&str> = cloud_urls.iter().map(String::as_str).collect();
            let removed = self.cloud.delete_urls_best_effort(&urls);
            if let Some(cleanup) = run.cleanup.as_mut() {
                cleanup.cloud_objects_deleted = removed;
            }
        }
        Ok(run)
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let auditor: Weak<Self> = Arc::downgrade(self);
        self.worker.start(self.interval, move || {
            let Some(auditor) = auditor.upgrade() else {
                return;
            };
            match auditor.run_once(true) {
                Ok(run) if run.remaining.as_ref().is_some_and(|left| !left.is_clean()) => {
                    tracing::error!(remaining = ?run.remaining, "Orphans remain after cleanup");
                }
                Ok(_) => {}
                Err(error) => tracing::error!(%error, "Orphan audit failed"),
            }
        })
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }
}
