//! Background upload of spooled photos to cloud storage.
//!
//! Photo bytes wait in a local spool until the worker uploads them. The
//! queue never holds the database lock while talking to the cloud; the
//! photo's `pending` status keeps peers away from its upload fields instead.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use thiserror::Error;

use super::worker::BackgroundWorker;
use crate::clock::{duration_millis, Clock};
use crate::db::{text, ChangeStore, PhotoRepository, SharedDatabase, SqliteChangeStore};
use crate::error::{Error, Result};
use crate::models::{is_valid_photo_id, Photo, PrimaryKey, UploadStatus};
use crate::schema::Table;
use crate::storage::{
    generate_thumbnail, hash_bytes, hash_file, BreakerSnapshot, CloudError, CloudStorageClient,
    ThumbnailError, ThumbnailOptions, UploadedPhoto, HASH_ALGORITHM,
};

/// Upload queue tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadQueueConfig {
    /// Worker polling interval.
    pub check_interval: Duration,
    /// Attempts before a photo is permanently failed.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub base_backoff: Duration,
    /// Wait before a permanently failed photo gets one more attempt.
    pub recovery_cooldown: Duration,
    /// Age after which a pending photo with no spooled file is marked failed.
    pub stale_pending_after: Duration,
    pub thumbnail: ThumbnailOptions,
}

impl Default for UploadQueueConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_retries: 5,
            base_backoff: Duration::from_secs(60),
            recovery_cooldown: Duration::from_secs(24 * 60 * 60),
            stale_pending_after: Duration::from_secs(60 * 60),
            thumbnail: ThumbnailOptions::default(),
        }
    }
}

impl UploadQueueConfig {
    fn retry_ceiling(&self) -> i64 {
        i64::from(self.max_retries)
    }
}

/// Whether a failed photo may be retried at `now`.
///
/// The wait after the n-th failure is `base_backoff * 2^n`.
pub fn retry_eligible(photo: &Photo, config: &UploadQueueConfig, now: i64) -> bool {
    if photo.retry_count >= config.retry_ceiling() {
        return false;
    }
    let Some(last_retry_at) = photo.last_retry_at else {
        return true;
    };
    let exponent = u32::try_from(photo.retry_count.max(0)).unwrap_or(u32::MAX);
    let backoff = duration_millis(config.base_backoff).saturating_mul(2_i64.saturating_pow(exponent));
    now.saturating_sub(last_retry_at) >= backoff
}

/// Holding areas of the local spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolArea {
    Pending,
    Processing,
    Completed,
}

impl SpoolArea {
    const fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

/// Local photo spool with `pending/`, `processing/` and `completed/` areas.
#[derive(Debug, Clone)]
pub struct PhotoSpool {
    root: PathBuf,
}

impl PhotoSpool {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let spool = Self { root: root.into() };
        for area in [SpoolArea::Pending, SpoolArea::Processing, SpoolArea::Completed] {
            fs::create_dir_all(spool.root.join(area.dir_name()))?;
        }
        Ok(spool)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn photo_path(&self, area: SpoolArea, photo_id: &str) -> PathBuf {
        self.root.join(area.dir_name()).join(format!("{photo_id}.jpg"))
    }

    pub fn thumbnail_path(&self, area: SpoolArea, photo_id: &str) -> PathBuf {
        self.root
            .join(area.dir_name())
            .join(format!("{photo_id}_thumb.jpg"))
    }

    /// Write photo bytes into `pending/`, replacing older content.
    pub fn store_pending(&self, photo_id: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.photo_path(SpoolArea::Pending, photo_id);
        let staging = path.with_extension("jpg.part");
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &path)?;
        Ok(path)
    }

    /// Whether `path` resolves to a file inside the spool. Symlinks and `..`
    /// segments are resolved before comparing.
    pub fn contains(&self, path: &Path) -> bool {
        let (Ok(root), Ok(path)) = (self.root.canonicalize(), path.canonicalize()) else {
            return false;
        };
        path.starts_with(root) && path.is_file()
    }

    /// Where a photo waiting for upload currently sits. A file left in
    /// `processing/` by an interrupted run is picked up again.
    pub fn find(&self, photo_id: &str) -> Option<SpoolArea> {
        [SpoolArea::Pending, SpoolArea::Processing]
            .into_iter()
            .find(|area| self.photo_path(*area, photo_id).is_file())
    }

    /// Move a photo, and its thumbnail when present, between areas.
    pub fn transfer(&self, photo_id: &str, from: SpoolArea, to: SpoolArea) -> io::Result<PathBuf> {
        let target = self.photo_path(to, photo_id);
        if from == to {
            return Ok(target);
        }
        fs::rename(self.photo_path(from, photo_id), &target)?;
        let thumbnail = self.thumbnail_path(from, photo_id);
        if thumbnail.is_file() {
            fs::rename(thumbnail, self.thumbnail_path(to, photo_id))?;
        }
        Ok(target)
    }
}

/// Why one upload attempt failed.
#[derive(Debug, Error)]
pub enum UploadFailure {
    #[error("no spooled file for photo")]
    MissingFile,

    #[error("spooled file hash {actual} does not match recorded hash {expected}")]
    LocalHashMismatch { expected: String, actual: String },

    #[error("uploaded object hash {received} does not match {expected}")]
    VerificationMismatch { expected: String, received: String },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("Spool error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Storage(#[from] Error),
}

/// Counters of one queue cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Old pending photos without a spooled file, moved to `failed`.
    pub stale_marked: usize,
    /// Permanently failed photos given one more attempt after the cooldown.
    pub recovered: usize,
    /// Failed photos that reached the retry ceiling.
    pub exhausted: usize,
    pub selected: usize,
    pub uploaded: usize,
    pub failed: usize,
}

/// Queue counters for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub counts: BTreeMap<String, i64>,
    pub breaker: BreakerSnapshot,
    pub running: bool,
}

struct VerifiedUpload {
    uploaded: UploadedPhoto,
    hash: String,
    size: u64,
}

pub struct UploadQueue {
    db: SharedDatabase,
    cloud: Arc<CloudStorageClient>,
    spool: PhotoSpool,
    config: UploadQueueConfig,
    clock: Arc<dyn Clock>,
    worker: BackgroundWorker,
}

impl UploadQueue {
    pub fn new(
        db: SharedDatabase,
        cloud: Arc<CloudStorageClient>,
        spool: PhotoSpool,
        config: UploadQueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            cloud,
            spool,
            config,
            clock,
            worker: BackgroundWorker::new("upload-queue"),
        }
    }

    pub const fn config(&self) -> &UploadQueueConfig {
        &self.config
    }

    pub const fn spool(&self) -> &PhotoSpool {
        &self.spool
    }

    /// Start the polling worker. Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let queue: Weak<Self> = Arc::downgrade(self);
        self.worker.start(self.config.check_interval, move || {
            let Some(queue) = queue.upgrade() else {
                return;
            };
            if let Err(error) = queue.process_cycle() {
                tracing::error!(%error, "Upload queue cycle failed");
            }
        })
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Spool photo bytes for upload and wake the worker.
    pub fn enqueue(&self, photo_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        if !is_valid_photo_id(photo_id) {
            return Err(Error::InvalidInput(format!("invalid photo id `{photo_id}`")));
        }
        if bytes.is_empty() {
            return Err(Error::InvalidInput("photo data is empty".into()));
        }
        let photo = {
            let db = self.db.lock()?;
            PhotoRepository::new(db.connection()).get(photo_id)?
        }
        .ok_or_else(|| Error::NotFound(format!("photo `{photo_id}`")))?;

        if photo.upload_status == UploadStatus::Completed {
            return Err(Error::InvalidInput(format!(
                "photo `{photo_id}` is already uploaded"
            )));
        }
        let digest = hash_bytes(bytes);
        if !photo.hash_value.is_empty() && !digest.eq_ignore_ascii_case(&photo.hash_value) {
            return Err(Error::InvalidInput(format!(
                "photo data does not match the recorded hash of `{photo_id}`"
            )));
        }

        let path = self.spool.store_pending(photo_id, bytes)?;
        let mut columns = vec![("file_path", text(path.display().to_string()))];
        if photo.hash_value.is_empty() {
            columns.push(("hash_value", text(digest)));
            columns.push(("hash_algo", text(HASH_ALGORITHM)));
        }
        if photo.size_bytes <= 0 {
            let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
            columns.push(("size_bytes", SqlValue::Integer(size)));
        }
        {
            let db = self.db.lock()?;
            PhotoRepository::new(db.connection()).update(photo_id, &columns)?;
        }

        tracing::info!(photo_id, bytes = bytes.len(), "Queued photo for upload");
        self.worker.wake();
        Ok(path)
    }

    /// Run one cycle: housekeeping, then an attempt for every pending photo
    /// and every failed photo whose backoff has elapsed.
    pub fn process_cycle(&self) -> Result<CycleReport> {
        let (mut report, selected) = self.select_batch()?;
        for photo in &selected {
            if self.process_photo(photo)? {
                report.uploaded += 1;
            } else {
                report.failed += 1;
            }
        }
        if report != CycleReport::default() {
            tracing::info!(?report, "Upload queue cycle finished");
        }
        Ok(report)
    }

    fn select_batch(&self) -> Result<(CycleReport, Vec<Photo>)> {
        let now = self.clock.now_millis();
        let ceiling = self.config.retry_ceiling();
        let mut report = CycleReport::default();

        let mut db = self.db.lock()?;
        let tx = db.connection_mut().transaction()?;
        let photos = PhotoRepository::new(&tx);

        let stale_after = duration_millis(self.config.stale_pending_after);
        for photo in photos.list_by_status(UploadStatus::Pending)? {
            let stale = photo.created_at > 0
                && now.saturating_sub(photo.created_at) > stale_after
                && photo.retry_count == 0
                && photo.last_retry_at.is_none()
                && self.spool.find(&photo.id).is_none();
            if stale {
                tracing::warn!(photo_id = %photo.id, "Pending photo has no spooled file, marking failed");
                photos.update(&photo.id, &[("upload_status", text(UploadStatus::Failed.as_str()))])?;
                report.stale_marked += 1;
            }
        }

        let cooldown = duration_millis(self.config.recovery_cooldown);
        for photo in photos.list_by_status(UploadStatus::PermanentlyFailed)? {
            let cooled = photo
                .last_retry_at
                .is_some_and(|at| now.saturating_sub(at) >= cooldown);
            if cooled {
                tracing::info!(photo_id = %photo.id, "Giving permanently failed photo another attempt");
                photos.update(
                    &photo.id,
                    &[
                        ("upload_status", text(UploadStatus::Failed.as_str())),
                        ("retry_count", SqlValue::Integer((ceiling - 1).max(0))),
                    ],
                )?;
                report.recovered += 1;
            }
        }

        let mut selected = photos.list_by_status(UploadStatus::Pending)?;
        for photo in photos.list_by_status(UploadStatus::Failed)? {
            if photo.retry_count >= ceiling {
                photos.update(
                    &photo.id,
                    &[
                        ("upload_status", text(UploadStatus::PermanentlyFailed.as_str())),
                        ("retry_count", SqlValue::Integer(ceiling)),
                    ],
                )?;
                report.exhausted += 1;
            } else if retry_eligible(&photo, &self.config, now) {
                photos.update(&photo.id, &[("upload_status", text(UploadStatus::Pending.as_str()))])?;
                selected.push(Photo {
                    upload_status: UploadStatus::Pending,
                    ..photo
                });
            }
        }
        tx.commit()?;

        report.selected = selected.len();
        Ok((report, selected))
    }

    /// Attempt one upload; `Ok(false)` means the failure was recorded.
    fn process_photo(&self, photo: &Photo) -> Result<bool> {
        match self.try_upload(photo) {
            Ok(done) => {
                self.complete(photo, &done)?;
                Ok(true)
            }
            Err(failure) => {
                tracing::warn!(photo_id = %photo.id, error = %failure, "Photo upload failed");
                self.record_failure(photo)?;
                Ok(false)
            }
        }
    }

    fn try_upload(&self, photo: &Photo) -> std::result::Result<VerifiedUpload, UploadFailure> {
        let area = self.spool.find(&photo.id).ok_or(UploadFailure::MissingFile)?;
        let path = self
            .spool
            .transfer(&photo.id, area, SpoolArea::Processing)?;

        let (digest, size) = hash_file(&path)?;
        if !photo.hash_value.is_empty() && !digest.eq_ignore_ascii_case(&photo.hash_value) {
            self.flag_corrupted(&photo.id)?;
            return Err(UploadFailure::LocalHashMismatch {
                expected: photo.hash_value.clone(),
                actual: digest,
            });
        }

        let bytes = fs::read(&path)?;
        let thumbnail = self.ensure_thumbnail(&photo.id, &bytes)?;
        let uploaded =
            self.cloud
                .upload_photo(&photo.id, photo.site_id, &bytes, thumbnail.as_deref())?;

        if let Err(failure) = self.verify_upload(&uploaded, &digest) {
            let thumbnail_url = uploaded.thumbnail_url.as_deref().unwrap_or_default();
            self.cloud
                .delete_urls_best_effort(&[&uploaded.photo_url, thumbnail_url]);
            return Err(failure);
        }

        Ok(VerifiedUpload {
            uploaded,
            hash: digest,
            size,
        })
    }

    /// Reuse a spooled thumbnail or generate one. An undecodable photo is
    /// flagged corrupted and uploaded without a thumbnail.
    fn ensure_thumbnail(
        &self,
        photo_id: &str,
        bytes: &[u8],
    ) -> std::result::Result<Option<Vec<u8>>, UploadFailure> {
        let path = self.spool.thumbnail_path(SpoolArea::Processing, photo_id);
        if path.is_file() {
            return Ok(Some(fs::read(&path)?));
        }
        match generate_thumbnail(bytes, self.config.thumbnail) {
            Ok(thumbnail) => {
                fs::write(&path, &thumbnail.bytes)?;
                Ok(Some(thumbnail.bytes))
            }
            Err(ThumbnailError::Corrupted(reason)) => {
                tracing::warn!(photo_id, %reason, "Photo cannot be decoded, flagging as corrupted");
                self.flag_corrupted(photo_id)?;
                Ok(None)
            }
            Err(error) => {
                tracing::warn!(photo_id, %error, "Thumbnail generation failed");
                Ok(None)
            }
        }
    }

    fn verify_upload(
        &self,
        uploaded: &UploadedPhoto,
        expected: &str,
    ) -> std::result::Result<(), UploadFailure> {
        let remote = self.cloud.download(&uploaded.objects.photo)?;
        let received = hash_bytes(&remote);
        if received == expected {
            Ok(())
        } else {
            Err(UploadFailure::VerificationMismatch {
                expected: expected.to_string(),
                received,
            })
        }
    }

    fn flag_corrupted(&self, photo_id: &str) -> Result<()> {
        let db = self.db.lock()?;
        PhotoRepository::new(db.connection()).update(photo_id, &[("corrupted", SqlValue::Integer(1))])
    }

    fn complete(&self, photo: &Photo, done: &VerifiedUpload) -> Result<()> {
        let mut columns = vec![
            ("cloud_url", text(done.uploaded.photo_url.as_str())),
            (
                "thumbnail_url",
                text(done.uploaded.thumbnail_url.clone().unwrap_or_default()),
            ),
            ("upload_status", text(UploadStatus::Completed.as_str())),
            ("retry_count", SqlValue::Integer(0)),
            ("last_retry_at", SqlValue::Null),
            ("file_path", text("")),
        ];
        if photo.hash_value.is_empty() {
            columns.push(("hash_value", text(done.hash.as_str())));
            columns.push(("hash_algo", text(HASH_ALGORITHM)));
        }
        if photo.size_bytes <= 0 {
            let size = i64::try_from(done.size).unwrap_or(i64::MAX);
            columns.push(("size_bytes", SqlValue::Integer(size)));
        }

        {
            let mut db = self.db.lock()?;
            let tx = db.connection_mut().transaction()?;
            PhotoRepository::new(&tx).update(&photo.id, &columns)?;
            // Columns merged while pending were hidden from peers
            SqliteChangeStore::new(&tx)
                .restamp_row(Table::Photo, &PrimaryKey::Text(photo.id.clone()))?;
            tx.commit()?;
        }

        if let Err(error) =
            self.spool
                .transfer(&photo.id, SpoolArea::Processing, SpoolArea::Completed)
        {
            tracing::warn!(photo_id = %photo.id, %error, "Failed to move uploaded photo out of processing");
        }
        tracing::info!(photo_id = %photo.id, url = %done.uploaded.photo_url, "Photo uploaded");
        Ok(())
    }

    fn record_failure(&self, photo: &Photo) -> Result<()> {
        let ceiling = self.config.retry_ceiling();
        let retry_count = (photo.retry_count + 1).min(ceiling);
        let status = if retry_count >= ceiling {
            UploadStatus::PermanentlyFailed
        } else {
            UploadStatus::Failed
        };
        {
            let db = self.db.lock()?;
            PhotoRepository::new(db.connection()).update(
                &photo.id,
                &[
                    ("upload_status", text(status.as_str())),
                    ("retry_count", SqlValue::Integer(retry_count)),
                    ("last_retry_at", SqlValue::Integer(self.clock.now_millis())),
                ],
            )?;
        }

        if self.spool.find(&photo.id) == Some(SpoolArea::Processing) {
            if let Err(error) =
                self.spool
                    .transfer(&photo.id, SpoolArea::Processing, SpoolArea::Pending)
            {
                tracing::warn!(photo_id = %photo.id, %error, "Failed to return photo to pending spool");
            }
        }
        if status == UploadStatus::PermanentlyFailed {
            tracing::error!(photo_id = %photo.id, retry_count, "Photo upload permanently failed");
        }
        Ok(())
    }

    /// Give permanently failed photos a partial retry budget again.
    ///
    /// `None` recovers every permanently failed photo.
    pub fn recover_permanently_failed(&self, photo_ids: Option<&[String]>) -> Result<usize> {
        let retry_count = i64::from(self.config.max_retries.saturating_sub(2));
        let recovered = {
            let mut db = self.db.lock()?;
            let tx = db.connection_mut().transaction()?;
            let photos = PhotoRepository::new(&tx);
            let mut recovered = 0;
            for photo in photos.list_by_status(UploadStatus::PermanentlyFailed)? {
                if photo_ids.is_some_and(|ids| !ids.contains(&photo.id)) {
                    continue;
                }
                photos.update(
                    &photo.id,
                    &[
                        ("upload_status", text(UploadStatus::Failed.as_str())),
                        ("retry_count", SqlValue::Integer(retry_count)),
                        ("last_retry_at", SqlValue::Null),
                    ],
                )?;
                recovered += 1;
            }
            tx.commit()?;
            recovered
        };

        if recovered > 0 {
            tracing::info!(recovered, "Recovered permanently failed uploads");
            self.worker.wake();
        }
        Ok(recovered)
    }

    pub fn status(&self) -> Result<QueueStatus> {
        let counts = {
            let db = self.db.lock()?;
            PhotoRepository::new(db.connection()).status_counts()?
        };
        Ok(QueueStatus {
            counts: counts.into_iter().collect(),
            breaker: self.cloud.breaker_snapshot(),
            running: self.is_running(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{source_png, BreakerConfig, CircuitBreaker, MemoryObjectStore};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const START: i64 = 1_700_000_000_000;

    struct Harness {
        queue: Arc<UploadQueue>,
        db: SharedDatabase,
        store: Arc<MemoryObjectStore>,
        clock: Arc<ManualClock>,
        _spool_dir: TempDir,
    }

    impl Harness {
        fn new(config: UploadQueueConfig) -> Self {
            let spool_dir = tempfile::tempdir().unwrap();
            let db = SharedDatabase::open_in_memory().unwrap();
            let store = Arc::new(MemoryObjectStore::new());
            let clock = Arc::new(ManualClock::new(START));
            let breaker = CircuitBreaker::new(BreakerConfig::default(), clock.clone());
            let cloud = Arc::new(CloudStorageClient::new(store.clone(), breaker));
            let queue = Arc::new(UploadQueue::new(
                db.clone(),
                cloud,
                PhotoSpool::open(spool_dir.path()).unwrap(),
                config,
                clock.clone(),
            ));
            Self {
                queue,
                db,
                store,
                clock,
                _spool_dir: spool_dir,
            }
        }

        fn seed(&self, id: &str, columns: &[(&str, SqlValue)]) {
            let db = self.db.lock().unwrap();
            PhotoRepository::new(db.connection()).update(id, columns).unwrap();
        }

        fn photo(&self, id: &str) -> Photo {
            let db = self.db.lock().unwrap();
            PhotoRepository::new(db.connection()).get(id).unwrap().unwrap()
        }
    }

    fn pending_photo(site_id: i64) -> Vec<(&'static str, SqlValue)> {
        vec![
            ("upload_status", text("pending")),
            ("site_id", SqlValue::Integer(site_id)),
        ]
    }

    #[test]
    fn uploads_enqueued_photo_and_completes_row() {
        let harness = Harness::new(UploadQueueConfig::default());
        harness.seed("p1", &pending_photo(7));
        let bytes = source_png(400, 300);
        harness.queue.enqueue("p1", &bytes).unwrap();

        let report = harness.queue.process_cycle().unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.uploaded, 1);

        let photo = harness.photo("p1");
        assert_eq!(photo.upload_status, UploadStatus::Completed);
        assert_eq!(photo.cloud_url, "memory://objects/7/p1.jpg");
        assert_eq!(photo.thumbnail_url, "memory://objects/7/thumbnails/p1_thumb.jpg");
        assert_eq!(photo.hash_value, hash_bytes(&bytes));
        assert_eq!(photo.size_bytes, i64::try_from(bytes.len()).unwrap());
        assert_eq!(photo.retry_count, 0);
        assert_eq!(photo.file_path, "");
        assert_eq!(harness.store.object("7/p1.jpg").unwrap(), bytes);

        let spool = harness.queue.spool();
        assert!(spool.photo_path(SpoolArea::Completed, "p1").is_file());
        assert!(spool.find("p1").is_none());

        let db = harness.db.lock().unwrap();
        let visible = SqliteChangeStore::new(db.connection())
            .changes_since(0, None)
            .unwrap();
        assert!(visible.iter().any(|change| change.column == "cloud_url"));
    }

    #[test]
    fn missing_file_backs_off_exponentially() {
        let harness = Harness::new(UploadQueueConfig::default());
        harness.seed("p1", &pending_photo(7));

        let report = harness.queue.process_cycle().unwrap();
        assert_eq!(report.failed, 1);
        let photo = harness.photo("p1");
        assert_eq!(photo.upload_status, UploadStatus::Failed);
        assert_eq!(photo.retry_count, 1);
        assert_eq!(photo.last_retry_at, Some(START));

        assert_eq!(harness.queue.process_cycle().unwrap().selected, 0);
        harness.clock.advance(Duration::from_secs(119));
        assert_eq!(harness.queue.process_cycle().unwrap().selected, 0);
        harness.clock.advance(Duration::from_secs(1));
        assert_eq!(harness.queue.process_cycle().unwrap().failed, 1);
        assert_eq!(harness.photo("p1").retry_count, 2);
    }

    #[test]
    fn retry_ceiling_is_never_exceeded() {
        let harness = Harness::new(UploadQueueConfig {
            max_retries: 2,
            base_backoff: Duration::ZERO,
            ..UploadQueueConfig::default()
        });
        harness.seed("p1", &pending_photo(7));

        harness.queue.process_cycle().unwrap();
        harness.queue.process_cycle().unwrap();
        let photo = harness.photo("p1");
        assert_eq!(photo.upload_status, UploadStatus::PermanentlyFailed);
        assert_eq!(photo.retry_count, 2);

        assert_eq!(harness.queue.process_cycle().unwrap().selected, 0);
        assert_eq!(harness.photo("p1").retry_count, 2);

        harness.clock.advance(Duration::from_secs(24 * 60 * 60));
        let report = harness.queue.process_cycle().unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.failed, 1);
        let photo = harness.photo("p1");
        assert_eq!(photo.upload_status, UploadStatus::PermanentlyFailed);
        assert_eq!(photo.retry_count, 2);
    }

    #[test]
    fn cloud_outage_returns_file_to_pending_then_succeeds() {
        let harness = Harness::new(UploadQueueConfig {
            base_backoff: Duration::ZERO,
            ..UploadQueueConfig::default()
        });
        harness.seed("p1", &pending_photo(3));
        harness.queue.enqueue("p1", &source_png(64, 64)).unwrap();

        harness.store.set_offline(true);
        assert_eq!(harness.queue.process_cycle().unwrap().failed, 1);
        assert_eq!(harness.queue.spool().find("p1"), Some(SpoolArea::Pending));
        assert_eq!(harness.photo("p1").upload_status, UploadStatus::Failed);

        harness.store.set_offline(false);
        assert_eq!(harness.queue.process_cycle().unwrap().uploaded, 1);
        assert_eq!(harness.photo("p1").upload_status, UploadStatus::Completed);
    }

    #[test]
    fn undecodable_photo_is_flagged_and_uploaded_without_thumbnail() {
        let harness = Harness::new(UploadQueueConfig::default());
        harness.seed("p1", &pending_photo(7));
        harness.queue.enqueue("p1", b"definitely not a jpeg").unwrap();

        assert_eq!(harness.queue.process_cycle().unwrap().uploaded, 1);
        let photo = harness.photo("p1");
        assert!(photo.corrupted);
        assert_eq!(photo.upload_status, UploadStatus::Completed);
        assert_eq!(photo.thumbnail_url, "");
        assert!(harness.store.contains("7/p1.jpg"));
    }

    #[test]
    fn corrupted_upload_is_deleted_and_retried() {
        let harness = Harness::new(UploadQueueConfig::default());
        harness.seed("p1", &pending_photo(7));
        harness.queue.enqueue("p1", &source_png(32, 32)).unwrap();
        harness.store.set_corrupt_writes(true);

        assert_eq!(harness.queue.process_cycle().unwrap().failed, 1);
        assert!(harness.store.is_empty());
        let photo = harness.photo("p1");
        assert_eq!(photo.upload_status, UploadStatus::Failed);
        assert_eq!(photo.cloud_url, "");
    }

    #[test]
    fn enqueue_checks_row_and_recorded_hash() {
        let harness = Harness::new(UploadQueueConfig::default());
        assert!(matches!(
            harness.queue.enqueue("nope", b"bytes"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            harness.queue.enqueue("../p1", b"bytes"),
            Err(Error::InvalidInput(_))
        ));

        harness.seed("p1", &[("hash_value", text(hash_bytes(b"original")))]);
        assert!(matches!(
            harness.queue.enqueue("p1", b"tampered"),
            Err(Error::InvalidInput(_))
        ));
        harness.queue.enqueue("p1", b"original").unwrap();
        assert_eq!(harness.photo("p1").size_bytes, 8);
    }

    #[test]
    fn stale_pending_photos_are_marked_failed() {
        let harness = Harness::new(UploadQueueConfig::default());
        let two_hours = duration_millis(Duration::from_secs(2 * 60 * 60));
        harness.seed(
            "p1",
            &[
                ("upload_status", text("pending")),
                ("created_at", SqlValue::Integer(START - two_hours)),
            ],
        );

        let report = harness.queue.process_cycle().unwrap();
        assert_eq!(report.stale_marked, 1);
        let photo = harness.photo("p1");
        assert_eq!(photo.upload_status, UploadStatus::Failed);
        assert_eq!(photo.retry_count, 1);
    }

    #[test]
    fn manual_recovery_resets_partial_budget() {
        let harness = Harness::new(UploadQueueConfig::default());
        for id in ["p1", "p2"] {
            harness.seed(
                id,
                &[
                    ("upload_status", text("permanently_failed")),
                    ("retry_count", SqlValue::Integer(5)),
                    ("last_retry_at", SqlValue::Integer(START)),
                ],
            );
        }

        let only_p1 = ["p1".to_string()];
        assert_eq!(harness.queue.recover_permanently_failed(Some(&only_p1)).unwrap(), 1);
        let photo = harness.photo("p1");
        assert_eq!(photo.upload_status, UploadStatus::Failed);
        assert_eq!(photo.retry_count, 3);
        assert_eq!(photo.last_retry_at, None);

        assert_eq!(harness.queue.recover_permanently_failed(None).unwrap(), 1);
        assert_eq!(harness.photo("p2").upload_status, UploadStatus::Failed);

        let status = harness.queue.status().unwrap();
        assert_eq!(status.counts.get("failed"), Some(&2));
        assert!(!status.running);
    }

    #[test]
    fn spool_contains_only_its_own_files() {
        let root = tempfile::tempdir().unwrap();
        let spool = PhotoSpool::open(root.path()).unwrap();
        let stored = spool.store_pending("p1", b"jpeg").unwrap();
        assert!(spool.contains(&stored));
        assert!(!spool.contains(&spool.photo_path(SpoolArea::Completed, "p1")));

        let outside = tempfile::tempdir().unwrap();
        let foreign = outside.path().join("p1.jpg");
        std::fs::write(&foreign, b"jpeg").unwrap();
        assert!(!spool.contains(&foreign));
        let dotted = root.path().join("pending").join("..").join("..");
        let dotted = dotted.join(outside.path().file_name().unwrap()).join("p1.jpg");
        assert!(!spool.contains(&dotted));
    }

    #[test]
    fn retry_eligibility_follows_backoff() {
        let config = UploadQueueConfig::default();
        let mut photo = Photo {
            id: "p1".into(),
            survey_id: None,
            site_id: None,
            question_id: None,
            cloud_url: String::new(),
            thumbnail_url: String::new(),
            upload_status: UploadStatus::Failed,
            retry_count: 3,
            last_retry_at: Some(0),
            description: String::new(),
            category: String::new(),
            tags: Vec::new(),
            created_at: 0,
            hash_algo: HASH_ALGORITHM.into(),
            hash_value: String::new(),
            size_bytes: 0,
            file_path: String::new(),
            corrupted: false,
        };
        // 60 s * 2^3
        assert!(!retry_eligible(&photo, &config, 479_999));
        assert!(retry_eligible(&photo, &config, 480_000));

        photo.last_retry_at = None;
        assert!(retry_eligible(&photo, &config, 0));

        photo.retry_count = 5;
        assert!(!retry_eligible(&photo, &config, i64::MAX));
    }

    #[test]
    fn worker_lifecycle() {
        let harness = Harness::new(UploadQueueConfig::default());
        assert!(harness.queue.start());
        assert!(!harness.queue.start());
        assert!(harness.queue.is_running());
        harness.queue.stop();
        assert!(!harness.queue.is_running());
    }
}
