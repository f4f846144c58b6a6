//! Applies peer change batches to the replicated store.

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

use super::foreign_keys::ForeignKeyChecker;
use super::photo_guard::{ObjectDownloads, PendingPhotoValues, PhotoGuard};
use super::validator::{validate_batch, ValidationError};
use crate::clock::{Clock, SystemClock};
use crate::db::{ChangeStore, ConflictRepository, MergeOutcome, SqliteChangeStore};
use crate::error::Error;
use crate::models::{sql_to_json, ChangeRecord, IntegrityIssue, NewConflict};
use crate::schema::Table;
use crate::storage::CloudStorageClient;

/// Failure of a whole batch.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A record is malformed; nothing was written.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Storage failed mid-batch; the batch was rolled back.
    #[error(transparent)]
    Storage(#[from] Error),
}

impl From<rusqlite::Error> for SyncError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Storage(error.into())
    }
}

/// Result of a processed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyOutcome {
    /// Changes handed to the store, duplicates included.
    pub applied: usize,
    pub integrity_issues: Vec<IntegrityIssue>,
    /// Conflict-audit entries written for this batch.
    pub conflicts: usize,
}

pub struct ChangeApplicator<'a> {
    cloud: &'a CloudStorageClient,
    clock: &'a dyn Clock,
}

impl<'a> ChangeApplicator<'a> {
    pub fn new(cloud: &'a CloudStorageClient) -> Self {
        Self {
            cloud,
            clock: &SystemClock,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Object names the photo guard will download for this batch. Only reads
    /// `conn`, so callers can release it before fetching the objects.
    pub fn verification_keys(
        &self,
        conn: &Connection,
        records: &[ChangeRecord],
    ) -> Result<Vec<String>, SyncError> {
        let changes = validate_batch(records)?;
        let guard = PhotoGuard::new(conn, self.cloud, PendingPhotoValues::from_changes(&changes));
        Ok(guard.verification_keys(&changes)?)
    }

    /// Download `keys` from the cloud store. Touches no database state.
    pub fn fetch_objects(&self, keys: Vec<String>) -> ObjectDownloads {
        ObjectDownloads::fetch_all(self.cloud, keys)
    }

    pub fn process_changes(
        &self,
        conn: &mut Connection,
        records: &[ChangeRecord],
    ) -> Result<ApplyOutcome, SyncError> {
        self.process_changes_with(conn, records, ObjectDownloads::default())
    }

    /// Validate, check and merge one batch inside a single transaction,
    /// verifying photos against `downloads` before downloading anything else.
    ///
    /// Conflicts are observed rather than decided: after each merge the
    /// column is read back, and a stored value other than the proposed one
    /// means the change lost to a newer write.
    pub fn process_changes_with(
        &self,
        conn: &mut Connection,
        records: &[ChangeRecord],
        downloads: ObjectDownloads,
    ) -> Result<ApplyOutcome, SyncError> {
        let changes = validate_batch(records)?;
        let mut outcome = ApplyOutcome::default();

        let mut survivors = Vec::with_capacity(changes.len());
        {
            let foreign_keys = ForeignKeyChecker::new(conn, &changes);
            let mut guard =
                PhotoGuard::new(conn, self.cloud, PendingPhotoValues::from_changes(&changes))
                    .with_downloads(downloads);
            for change in &changes {
                let record = &records[change.index];
                if let Some(warning) = foreign_keys.check(change)? {
                    outcome
                        .integrity_issues
                        .push(IntegrityIssue::warning(record, warning));
                }
                if change.table == Table::Photo {
                    if let Some(rejection) = guard.check(change)? {
                        let photo_id = change.pk.to_string();
                        outcome
                            .integrity_issues
                            .push(rejection.into_issue(record, &photo_id));
                        continue;
                    }
                }
                survivors.push(change);
            }
        }

        let tx = conn.transaction()?;
        {
            let store = SqliteChangeStore::new(&tx);
            let conflicts = ConflictRepository::new(&tx);
            let db_version = store.next_db_version()?;

            for change in &survivors {
                let column = change.column_name();
                let previous = store.read_column(change.table, &change.pk, column)?;
                let merged = store.merge(change, db_version)?;
                let observed = store
                    .read_column(change.table, &change.pk, column)?
                    .unwrap_or(SqlValue::Null);
                outcome.applied += 1;

                if merged == MergeOutcome::Duplicate || observed == change.value {
                    continue;
                }
                conflicts.record(&NewConflict {
                    table: change.table.name().to_string(),
                    pk: change.pk.canonical(),
                    column: column.to_string(),
                    lost_value: sql_to_json(&change.value),
                    winning_value: sql_to_json(&observed),
                    origin_site_id: change.site_id.to_string(),
                    recorded_at: self.clock.now_millis(),
                })?;
                tracing::info!(
                    table = %change.table,
                    pk = %change.pk,
                    column,
                    origin = %change.site_id,
                    previous = ?previous,
                    "Change lost to a newer stored value"
                );
                outcome.conflicts += 1;
                outcome.integrity_issues.push(IntegrityIssue::logged(
                    &records[change.index],
                    format!(
                        "{}.{column} kept its stored value; the proposed value lost under last-writer-wins",
                        change.table
                    ),
                ));
            }
        }
        tx.commit()?;

        tracing::debug!(
            received = records.len(),
            applied = outcome.applied,
            issues = outcome.integrity_issues.len(),
            "Processed change batch"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::db::{Database, PhotoRepository};
    use crate::models::{IssueAction, UploadStatus};
    use crate::storage::{
        hash_bytes, BreakerConfig, CircuitBreaker, MemoryObjectStore, ObjectStore,
    };
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value as JsonValue};

    const SITE_A: &str = "0190b2c4-7d1e-7aa0-9c1f-3c2b1a0e9f11";
    const SITE_B: &str = "0190b2c4-7d1e-7aa0-9c1f-3c2b1a0e9f22";

    struct Fixture {
        db: Database,
        store: Arc<MemoryObjectStore>,
        cloud: CloudStorageClient,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryObjectStore::new());
            let breaker =
                CircuitBreaker::new(BreakerConfig::default(), Arc::new(ManualClock::new(0)));
            Self {
                db: Database::open_in_memory().unwrap(),
                cloud: CloudStorageClient::new(store.clone(), breaker),
                store,
                clock: ManualClock::new(1_700_000_000_000),
            }
        }

        fn apply(&mut self, records: &[ChangeRecord]) -> Result<ApplyOutcome, SyncError> {
            ChangeApplicator::new(&self.cloud)
                .with_clock(&self.clock)
                .process_changes(self.db.connection_mut(), records)
        }

        fn conflicts(&self) -> Vec<crate::models::ConflictEntry> {
            ConflictRepository::new(self.db.connection())
                .list_recent(100)
                .unwrap()
        }
    }

    fn record(
        table: &str,
        pk: JsonValue,
        cid: &str,
        val: JsonValue,
        db_version: i64,
        site: &str,
    ) -> ChangeRecord {
        ChangeRecord {
            table: json!(table),
            pk,
            cid: json!(cid),
            val,
            col_version: json!(1),
            db_version: json!(db_version),
            site_id: json!(site),
        }
    }

    #[test]
    fn applies_batch_and_reports_dangling_reference() {
        let mut fixture = Fixture::new();
        let outcome = fixture
            .apply(&[
                record("projects", json!({"id": 1}), "name", json!("Depot"), 1, SITE_A),
                record("sites", json!({"id": 1}), "project_id", json!(1), 1, SITE_A),
                record("survey", json!({"id": 1}), "site_id", json!(99), 1, SITE_A),
            ])
            .unwrap();

        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.conflicts, 0);
        assert_eq!(outcome.integrity_issues.len(), 1);
        assert_eq!(outcome.integrity_issues[0].action, IssueAction::Warning);

        let store = SqliteChangeStore::new(fixture.db.connection());
        assert_eq!(
            store
                .read_column(Table::Survey, &crate::models::PrimaryKey::Integer(1), "site_id")
                .unwrap(),
            Some(SqlValue::Integer(99))
        );
    }

    #[test]
    fn malformed_record_rejects_whole_batch_before_writing() {
        let mut fixture = Fixture::new();
        let err = fixture
            .apply(&[
                record("projects", json!({"id": 1}), "name", json!("Depot"), 1, SITE_A),
                record("projects", json!({"id": 2}), "owner", json!("x"), 1, SITE_A),
            ])
            .unwrap_err();

        assert!(matches!(err, SyncError::Validation(ValidationError { index: 1, .. })));
        let store = SqliteChangeStore::new(fixture.db.connection());
        assert!(store.changes_since(0, None).unwrap().is_empty());
    }

    #[test]
    fn resubmission_is_idempotent() {
        let mut fixture = Fixture::new();
        let batch = [
            record("sites", json!({"id": 5}), "name", json!("North"), 3, SITE_A),
            record("sites", json!({"id": 5}), "notes", json!("gate code 12"), 3, SITE_A),
        ];
        let first = fixture.apply(&batch).unwrap();
        let second = fixture.apply(&batch).unwrap();

        assert_eq!(first.applied, second.applied);
        assert!(second.integrity_issues.is_empty());
        assert!(fixture.conflicts().is_empty());
    }

    #[test]
    fn lower_version_loses_and_is_audited() {
        let mut fixture = Fixture::new();
        fixture
            .apply(&[record("survey", json!({"id": 2}), "title", json!("from B"), 9, SITE_B)])
            .unwrap();
        let outcome = fixture
            .apply(&[record("survey", json!({"id": 2}), "title", json!("from A"), 4, SITE_A)])
            .unwrap();

        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.conflicts, 1);
        assert_eq!(outcome.integrity_issues[0].action, IssueAction::Logged);

        let conflicts = fixture.conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].lost_value, json!("from A"));
        assert_eq!(conflicts[0].winning_value, json!("from B"));
        assert_eq!(conflicts[0].origin_site_id, SITE_A);
        assert_eq!(conflicts[0].recorded_at, 1_700_000_000_000);
    }

    #[test]
    fn mismatched_cloud_object_is_rejected_and_not_applied() {
        let mut fixture = Fixture::new();
        let recorded = "a".repeat(64);
        fixture
            .apply(&[
                record("photo", json!({"id": "p1"}), "upload_status", json!("failed"), 1, SITE_A),
                record("photo", json!({"id": "p1"}), "hash_value", json!(recorded), 1, SITE_A),
            ])
            .unwrap();
        fixture.store.insert("x/p1.jpg", b"different".to_vec());
        let url = fixture.store.object_url("x/p1.jpg");

        let outcome = fixture
            .apply(&[
                record("photo", json!({"id": "p1"}), "cloud_url", json!(url), 5, SITE_A),
                record("photo", json!({"id": "p1"}), "description", json!("north wall"), 5, SITE_A),
            ])
            .unwrap();

        assert_eq!(outcome.applied, 1);
        let issue = &outcome.integrity_issues[0];
        assert_eq!(issue.action, IssueAction::Rejected);
        assert_eq!(issue.expected_hash.as_deref(), Some(recorded.as_str()));
        assert_eq!(issue.received_hash, Some(hash_bytes(b"different")));

        let photo = PhotoRepository::new(fixture.db.connection())
            .get("p1")
            .unwrap()
            .unwrap();
        assert_eq!(photo.cloud_url, "");
        assert_eq!(photo.description, "north wall");
    }

    #[test]
    fn prefetched_batch_applies_without_further_downloads() {
        let mut fixture = Fixture::new();
        let photo = |cid: &str, val: JsonValue, db_version: i64| {
            record("photo", json!({"id": "p1"}), cid, val, db_version, SITE_A)
        };
        fixture.apply(&[photo("upload_status", json!("failed"), 1)]).unwrap();
        fixture.store.insert("7/p1.jpg", b"photo".to_vec());
        let url = fixture.store.object_url("7/p1.jpg");
        let batch = [
            photo("cloud_url", json!(url), 2),
            photo("hash_value", json!(hash_bytes(b"photo")), 2),
            photo("upload_status", json!("completed"), 2),
        ];

        let applicator = ChangeApplicator::new(&fixture.cloud).with_clock(&fixture.clock);
        let keys = applicator
            .verification_keys(fixture.db.connection(), &batch)
            .unwrap();
        assert_eq!(keys, vec!["7/p1.jpg".to_string()]);
        let downloads = applicator.fetch_objects(keys);
        assert_eq!(fixture.store.call_count(), 1);

        let outcome = applicator
            .process_changes_with(fixture.db.connection_mut(), &batch, downloads)
            .unwrap();
        assert_eq!(outcome.applied, 3);
        assert!(outcome.integrity_issues.is_empty());
        assert_eq!(fixture.store.call_count(), 1);

        let photo = PhotoRepository::new(fixture.db.connection())
            .get("p1")
            .unwrap()
            .unwrap();
        assert_eq!(photo.upload_status, UploadStatus::Completed);
    }

    #[test]
    fn pending_photo_accepts_metadata_only() {
        let mut fixture = Fixture::new();
        fixture
            .apply(&[record("photo", json!({"id": "p1"}), "upload_status", json!("pending"), 1, SITE_A)])
            .unwrap();

        let outcome = fixture
            .apply(&[
                record("photo", json!({"id": "p1"}), "file_path", json!("/tmp/p1.jpg"), 2, SITE_B),
                record("photo", json!({"id": "p1"}), "tags", json!(["roof"]), 2, SITE_B),
                record("photo", json!({"id": "p1"}), "upload_status", json!("completed"), 2, SITE_B),
            ])
            .unwrap();

        assert_eq!(outcome.applied, 1);
        let rejected: Vec<_> = outcome
            .integrity_issues
            .iter()
            .filter(|issue| issue.action == IssueAction::Rejected)
            .collect();
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|issue| issue.photo_id.as_deref() == Some("p1")));

        let photo = PhotoRepository::new(fixture.db.connection())
            .get("p1")
            .unwrap()
            .unwrap();
        assert_eq!(photo.tags, vec!["roof".to_string()]);
        assert_eq!(photo.file_path, "");
        assert_eq!(photo.upload_status, UploadStatus::Pending);
    }
}
