//! Photo integrity guard applied to incoming photo changes.
//!
//! While a photo's upload is pending, its cloud and content fields belong to
//! the upload queue. Changes that point a photo at a cloud object are only
//! accepted after the object is downloaded and its hash matches.

use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use thiserror::Error;

use crate::db::PhotoRepository;
use crate::error::Result;
use crate::models::{
    non_empty_text, ChangeRecord, IntegrityIssue, Photo, UploadStatus, ValidatedChange,
};
use crate::schema::Table;
use crate::storage::{hash_bytes, CloudError, CloudStorageClient};

/// Columns owned by the upload queue while a photo is pending.
pub const PENDING_PROTECTED_COLUMNS: &[&str] = &[
    "cloud_url",
    "hash_value",
    "hash_algo",
    "upload_status",
    "size_bytes",
    "file_path",
    "thumbnail_url",
];

/// Metadata that peers may keep editing during an upload.
pub const PENDING_ALLOWED_COLUMNS: &[&str] = &[
    "description",
    "tags",
    "category",
    "latitude",
    "longitude",
    "section",
];

/// Why a download-and-compare check failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("photo has no recorded hash to verify against")]
    MissingHash,

    #[error("photo has no cloud URL to verify")]
    MissingUrl,

    #[error("cannot derive an object name from `{0}`")]
    InvalidUrl(String),

    #[error("cloud object unreachable during verification: {0}")]
    Unreachable(CloudError),

    #[error("hash mismatch: expected {expected}, received {received}")]
    HashMismatch { expected: String, received: String },

    #[error("size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: i64, received: i64 },
}

/// A photo change the guard refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("upload pending: `{column}` is owned by the upload queue")]
    PendingWindow { column: &'static str },

    #[error("invalid upload_status `{0}`")]
    InvalidStatus(String),

    #[error(transparent)]
    Verification(#[from] VerificationError),
}

impl GuardRejection {
    /// Report the rejection for `record`, carrying both hashes on a mismatch.
    pub fn into_issue(self, record: &ChangeRecord, photo_id: &str) -> IntegrityIssue {
        let issue = IntegrityIssue::rejected(record, self.to_string()).with_photo(photo_id);
        match self {
            Self::Verification(VerificationError::HashMismatch { expected, received }) => {
                issue.with_hashes(expected, received)
            }
            _ => issue,
        }
    }
}

/// Values a batch is about to write, per photo and column. Later changes in
/// the batch overwrite earlier ones.
#[derive(Debug, Default)]
pub struct PendingPhotoValues {
    values: HashMap<String, HashMap<&'static str, SqlValue>>,
}

impl PendingPhotoValues {
    pub fn from_changes(changes: &[ValidatedChange]) -> Self {
        let mut values: HashMap<String, HashMap<&'static str, SqlValue>> = HashMap::new();
        for change in changes.iter().filter(|change| change.table == Table::Photo) {
            if let Some(photo_id) = change.pk.as_text() {
                values
                    .entry(photo_id.to_string())
                    .or_default()
                    .insert(change.column_name(), change.value.clone());
            }
        }
        Self { values }
    }

    pub fn get(&self, photo_id: &str, column: &str) -> Option<&SqlValue> {
        self.values.get(photo_id)?.get(column)
    }
}

/// Cloud objects downloaded for verification, keyed by object name.
///
/// Filled ahead of time with [`ObjectDownloads::fetch_all`] so that slow
/// downloads happen without the database lock held. Keys missing at check
/// time are downloaded on demand.
#[derive(Debug, Default)]
pub struct ObjectDownloads {
    objects: HashMap<String, std::result::Result<Vec<u8>, CloudError>>,
}

impl ObjectDownloads {
    pub fn fetch_all<I>(cloud: &CloudStorageClient, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut downloads = Self::default();
        for key in keys {
            downloads.get_or_fetch(cloud, key);
        }
        downloads
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn get_or_fetch(
        &mut self,
        cloud: &CloudStorageClient,
        key: String,
    ) -> &std::result::Result<Vec<u8>, CloudError> {
        self.objects
            .entry(key)
            .or_insert_with_key(|key| cloud.download(key))
    }
}

/// Guard state for one batch.
pub struct PhotoGuard<'a> {
    conn: &'a Connection,
    cloud: &'a CloudStorageClient,
    pending: PendingPhotoValues,
    downloads: ObjectDownloads,
}

impl<'a> PhotoGuard<'a> {
    pub fn new(
        conn: &'a Connection,
        cloud: &'a CloudStorageClient,
        pending: PendingPhotoValues,
    ) -> Self {
        Self {
            conn,
            cloud,
            pending,
            downloads: ObjectDownloads::default(),
        }
    }

    /// Reuse objects downloaded before the guard was built.
    #[must_use]
    pub fn with_downloads(mut self, downloads: ObjectDownloads) -> Self {
        self.downloads = downloads;
        self
    }

    /// Object names the batch will need to download, without downloading.
    pub fn verification_keys(&self, changes: &[ValidatedChange]) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for change in changes.iter().filter(|change| change.table == Table::Photo) {
            if let Plan::Verify(target) = self.plan(change)? {
                let key = target
                    .url
                    .as_deref()
                    .and_then(|url| self.cloud.object_key_from_url(url));
                keys.extend(key);
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Check one photo change. `Ok(None)` accepts it.
    pub fn check(&mut self, change: &ValidatedChange) -> Result<Option<GuardRejection>> {
        let column = change.column_name();
        let photo_id = change.pk.as_text().unwrap_or_default();
        let target = match self.plan(change)? {
            Plan::Accept => return Ok(None),
            Plan::Reject(rejection) => {
                if let GuardRejection::PendingWindow { .. } = rejection {
                    tracing::info!(photo_id, column, "Rejected change to pending photo");
                }
                return Ok(Some(rejection));
            }
            Plan::Verify(target) => target,
        };
        match self.verify(&target) {
            Ok(()) => Ok(None),
            Err(error) => {
                tracing::warn!(photo_id, column, %error, "Photo verification failed");
                Ok(Some(error.into()))
            }
        }
    }

    /// Decide what a change needs, reading only committed rows and the batch.
    fn plan(&self, change: &ValidatedChange) -> Result<Plan> {
        let Some(photo_id) = change.pk.as_text() else {
            return Ok(Plan::Accept);
        };
        let committed = PhotoRepository::new(self.conn).get(photo_id)?;
        let column = change.column_name();

        let new_status = if column == "upload_status" {
            match change.text_value().map(str::parse::<UploadStatus>) {
                Some(Ok(status)) => Some(status),
                _ => {
                    return Ok(Plan::Reject(GuardRejection::InvalidStatus(
                        change.text_value().unwrap_or("null").to_string(),
                    )))
                }
            }
        } else {
            None
        };

        let pending_window = committed
            .as_ref()
            .is_some_and(|photo| photo.upload_status == UploadStatus::Pending);
        if pending_window
            && PENDING_PROTECTED_COLUMNS.contains(&column)
            && new_status != Some(UploadStatus::Pending)
        {
            return Ok(Plan::Reject(GuardRejection::PendingWindow { column }));
        }

        let effective = Effective {
            photo_id,
            pending: &self.pending,
            committed: committed.as_ref(),
        };
        let check = match column {
            "cloud_url" => change.text_value().filter(|url| !url.trim().is_empty()).map(|url| {
                VerificationTarget {
                    url: Some(url.to_string()),
                    expected_hash: effective.text("hash_value"),
                    expected_size: effective.size(),
                }
            }),
            "hash_value" => non_empty_text(&change.value)
                .filter(|_| effective.status() == Some(UploadStatus::Completed))
                .and_then(|hash| {
                    effective.text("cloud_url").map(|url| VerificationTarget {
                        url: Some(url),
                        expected_hash: Some(hash.to_string()),
                        expected_size: effective.size(),
                    })
                }),
            "upload_status" if new_status == Some(UploadStatus::Completed) => {
                Some(VerificationTarget {
                    url: effective.text("cloud_url"),
                    expected_hash: effective.text("hash_value"),
                    expected_size: effective.size(),
                })
            }
            _ => None,
        };

        Ok(check.map_or(Plan::Accept, Plan::Verify))
    }

    fn verify(&mut self, target: &VerificationTarget) -> std::result::Result<(), VerificationError> {
        let expected = target
            .expected_hash
            .as_deref()
            .ok_or(VerificationError::MissingHash)?;
        let url = target.url.as_deref().ok_or(VerificationError::MissingUrl)?;
        let key = self
            .cloud
            .object_key_from_url(url)
            .ok_or_else(|| VerificationError::InvalidUrl(url.to_string()))?;

        let bytes = self
            .downloads
            .get_or_fetch(self.cloud, key)
            .as_ref()
            .map_err(|error| VerificationError::Unreachable(error.clone()))?;

        let received = hash_bytes(bytes);
        if !received.eq_ignore_ascii_case(expected) {
            return Err(VerificationError::HashMismatch {
                expected: expected.to_string(),
                received,
            });
        }
        let received_size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        match target.expected_size {
            Some(expected) if expected > 0 && expected != received_size => {
                Err(VerificationError::SizeMismatch {
                    expected,
                    received: received_size,
                })
            }
            _ => Ok(()),
        }
    }
}

enum Plan {
    Accept,
    Reject(GuardRejection),
    Verify(VerificationTarget),
}

struct VerificationTarget {
    url: Option<String>,
    expected_hash: Option<String>,
    expected_size: Option<i64>,
}

/// In-batch value of a photo column, falling back to the committed row.
struct Effective<'b> {
    photo_id: &'b str,
    pending: &'b PendingPhotoValues,
    committed: Option<&'b Photo>,
}

impl Effective<'_> {
    fn text(&self, column: &str) -> Option<String> {
        if let Some(value) = self.pending.get(self.photo_id, column) {
            return non_empty_text(value).map(str::to_string);
        }
        let photo = self.committed?;
        let value = match column {
            "cloud_url" => &photo.cloud_url,
            "hash_value" => &photo.hash_value,
            _ => return None,
        };
        Some(value.clone()).filter(|value| !value.trim().is_empty())
    }

    fn size(&self) -> Option<i64> {
        match self.pending.get(self.photo_id, "size_bytes") {
            Some(SqlValue::Integer(size)) => Some(*size),
            Some(_) => None,
            None => self.committed.map(|photo| photo.size_bytes),
        }
    }

    fn status(&self) -> Option<UploadStatus> {
        match self.pending.get(self.photo_id, "upload_status") {
            Some(value) => non_empty_text(value).and_then(|raw| raw.parse().ok()),
            None => self.committed.map(|photo| photo.upload_status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::db::change_fixtures::{change, SITE_A};
    use crate::db::{text, Database};
    use crate::models::PrimaryKey;
    use crate::storage::{BreakerConfig, CircuitBreaker, MemoryObjectStore, ObjectStore};
    use pretty_assertions::assert_eq;

    struct Fixture {
        db: Database,
        store: Arc<MemoryObjectStore>,
        cloud: CloudStorageClient,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryObjectStore::new());
        let breaker = CircuitBreaker::new(BreakerConfig::default(), Arc::new(ManualClock::new(0)));
        Fixture {
            db: Database::open_in_memory().unwrap(),
            cloud: CloudStorageClient::new(store.clone(), breaker),
            store,
        }
    }

    fn seed(db: &Database, id: &str, columns: &[(&str, SqlValue)]) {
        PhotoRepository::new(db.connection()).update(id, columns).unwrap();
    }

    fn photo_change(column: &str, value: SqlValue) -> ValidatedChange {
        change(Table::Photo, PrimaryKey::Text("p1".into()), column, value, 1, 5, SITE_A)
    }

    fn check_batch(fixture: &Fixture, batch: &[ValidatedChange]) -> Vec<Option<GuardRejection>> {
        let mut guard = PhotoGuard::new(
            fixture.db.connection(),
            &fixture.cloud,
            PendingPhotoValues::from_changes(batch),
        );
        batch.iter().map(|change| guard.check(change).unwrap()).collect()
    }

    #[test]
    fn pending_window_protects_upload_fields() {
        let fixture = fixture();
        seed(&fixture.db, "p1", &[("upload_status", text("pending"))]);

        for column in ["cloud_url", "hash_value", "size_bytes", "file_path"] {
            let value = if column == "size_bytes" {
                SqlValue::Integer(10)
            } else {
                text("x")
            };
            let rejected = check_batch(&fixture, &[photo_change(column, value)]);
            assert!(
                matches!(rejected[0], Some(GuardRejection::PendingWindow { .. })),
                "{column} accepted"
            );
        }

        let to_completed = check_batch(&fixture, &[photo_change("upload_status", text("completed"))]);
        assert!(matches!(to_completed[0], Some(GuardRejection::PendingWindow { .. })));

        let stays_pending = check_batch(&fixture, &[photo_change("upload_status", text("pending"))]);
        assert_eq!(stays_pending[0], None);
    }

    #[test]
    fn pending_window_allows_metadata() {
        let fixture = fixture();
        seed(&fixture.db, "p1", &[("upload_status", text("pending"))]);

        for column in PENDING_ALLOWED_COLUMNS {
            let value = match Table::Photo.column(column).unwrap().kind {
                crate::schema::ColumnKind::Real => SqlValue::Real(1.5),
                _ => text("north wall"),
            };
            assert_eq!(check_batch(&fixture, &[photo_change(column, value)])[0], None);
        }
    }

    #[test]
    fn new_rows_are_outside_the_pending_window() {
        let fixture = fixture();
        let result = check_batch(&fixture, &[photo_change("file_path", text("/tmp/p1.jpg"))]);
        assert_eq!(result[0], None);
    }

    #[test]
    fn rejects_unknown_status() {
        let fixture = fixture();
        let result = check_batch(&fixture, &[photo_change("upload_status", text("processing"))]);
        assert_eq!(
            result[0],
            Some(GuardRejection::InvalidStatus("processing".into()))
        );
    }

    #[test]
    fn cloud_url_with_mismatched_object_is_rejected_with_hashes() {
        let fixture = fixture();
        let expected = "a".repeat(64);
        seed(
            &fixture.db,
            "p1",
            &[("upload_status", text("failed")), ("hash_value", text(&expected))],
        );
        fixture.store.insert("x/p1.jpg", b"other bytes".to_vec());
        let url = fixture.store.object_url("x/p1.jpg");

        let rejection = check_batch(&fixture, &[photo_change("cloud_url", text(&url))])
            .remove(0)
            .unwrap();
        assert_eq!(
            rejection,
            GuardRejection::Verification(VerificationError::HashMismatch {
                expected: expected.clone(),
                received: hash_bytes(b"other bytes"),
            })
        );

        let issue = rejection.into_issue(&ChangeRecord::default(), "p1");
        assert_eq!(issue.expected_hash.as_deref(), Some(expected.as_str()));
        assert_eq!(issue.photo_id.as_deref(), Some("p1"));
    }

    #[test]
    fn verification_uses_in_batch_hash_and_url() {
        let fixture = fixture();
        seed(&fixture.db, "p1", &[("upload_status", text("failed"))]);
        fixture.store.insert("7/p1.jpg", b"photo".to_vec());
        let url = fixture.store.object_url("7/p1.jpg");

        let batch = [
            photo_change("cloud_url", text(&url)),
            photo_change("hash_value", text(hash_bytes(b"photo"))),
            photo_change("size_bytes", SqlValue::Integer(5)),
            photo_change("upload_status", text("completed")),
        ];
        assert_eq!(check_batch(&fixture, &batch), vec![None, None, None, None]);
        // cloud_url and completed share one download
        assert_eq!(fixture.store.call_count(), 1);
    }

    #[test]
    fn prefetched_objects_are_not_downloaded_again() {
        let fixture = fixture();
        seed(&fixture.db, "p1", &[("upload_status", text("failed"))]);
        fixture.store.insert("7/p1.jpg", b"photo".to_vec());
        let url = fixture.store.object_url("7/p1.jpg");
        let batch = [
            photo_change("cloud_url", text(&url)),
            photo_change("hash_value", text(hash_bytes(b"photo"))),
            photo_change("upload_status", text("completed")),
            photo_change("description", text("north wall")),
        ];

        let keys = PhotoGuard::new(
            fixture.db.connection(),
            &fixture.cloud,
            PendingPhotoValues::from_changes(&batch),
        )
        .verification_keys(&batch)
        .unwrap();
        assert_eq!(keys, vec!["7/p1.jpg".to_string()]);
        assert_eq!(fixture.store.call_count(), 0);

        let downloads = ObjectDownloads::fetch_all(&fixture.cloud, keys);
        assert_eq!(downloads.len(), 1);
        assert_eq!(fixture.store.call_count(), 1);

        let mut guard = PhotoGuard::new(
            fixture.db.connection(),
            &fixture.cloud,
            PendingPhotoValues::from_changes(&batch),
        )
        .with_downloads(downloads);
        for change in &batch {
            assert_eq!(guard.check(change).unwrap(), None);
        }
        assert_eq!(fixture.store.call_count(), 1);
    }

    #[test]
    fn completed_requires_hash_and_url() {
        let fixture = fixture();
        seed(&fixture.db, "p1", &[("upload_status", text("failed"))]);
        let result = check_batch(&fixture, &[photo_change("upload_status", text("completed"))]);
        assert_eq!(
            result[0],
            Some(GuardRejection::Verification(VerificationError::MissingHash))
        );

        seed(&fixture.db, "p1", &[("hash_value", text("a".repeat(64)))]);
        let result = check_batch(&fixture, &[photo_change("upload_status", text("completed"))]);
        assert_eq!(
            result[0],
            Some(GuardRejection::Verification(VerificationError::MissingUrl))
        );
    }

    #[test]
    fn size_and_reachability_are_checked() {
        let fixture = fixture();
        fixture.store.insert("7/p1.jpg", b"photo".to_vec());
        let url = fixture.store.object_url("7/p1.jpg");
        seed(
            &fixture.db,
            "p1",
            &[
                ("upload_status", text("failed")),
                ("hash_value", text(hash_bytes(b"photo"))),
                ("size_bytes", SqlValue::Integer(99)),
            ],
        );

        let result = check_batch(&fixture, &[photo_change("cloud_url", text(&url))]);
        assert_eq!(
            result[0],
            Some(GuardRejection::Verification(VerificationError::SizeMismatch {
                expected: 99,
                received: 5
            }))
        );

        fixture.store.set_offline(true);
        let result = check_batch(&fixture, &[photo_change("cloud_url", text(&url))]);
        assert!(matches!(
            result[0],
            Some(GuardRejection::Verification(VerificationError::Unreachable(_)))
        ));
    }

    #[test]
    fn new_hash_on_completed_photo_is_verified() {
        let fixture = fixture();
        fixture.store.insert("7/p1.jpg", b"photo".to_vec());
        let url = fixture.store.object_url("7/p1.jpg");
        seed(
            &fixture.db,
            "p1",
            &[
                ("upload_status", text("completed")),
                ("cloud_url", text(&url)),
                ("hash_value", text(hash_bytes(b"photo"))),
            ],
        );

        let wrong = check_batch(&fixture, &[photo_change("hash_value", text("b".repeat(64)))]);
        assert!(matches!(
            wrong[0],
            Some(GuardRejection::Verification(VerificationError::HashMismatch { .. }))
        ));
        let right = check_batch(&fixture, &[photo_change("hash_value", text(hash_bytes(b"photo")))]);
        assert_eq!(right[0], None);
    }
}
