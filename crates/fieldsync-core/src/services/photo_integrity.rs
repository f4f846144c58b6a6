//! Background verification of stored photo bytes against recorded hashes.
//!
//! Corruption is informational: the auditor sets `corrupted = true` and never
//! clears it or touches the recorded hash.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use serde::Serialize;

use super::upload_queue::PhotoSpool;
use super::worker::BackgroundWorker;
use crate::clock::{duration_millis, Clock};
use crate::db::{PhotoRepository, SharedDatabase, SqliteChangeStore};
use crate::error::{Error, Result};
use crate::models::{Photo, UploadStatus};
use crate::storage::{hash_bytes, hash_file, CloudStorageClient};

/// Where the verified bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSource {
    LocalFile,
    Cloud,
}

/// Outcome of checking one photo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhotoCheck {
    Verified { source: CheckSource },
    Corrupted { source: CheckSource, reason: String },
    /// Nothing to compare against, or no bytes to read.
    Skipped { reason: String },
    /// The bytes exist but could not be read right now.
    Unavailable { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub verified: usize,
    /// Ids of photos found corrupted in this pass.
    pub corrupted: Vec<String>,
    pub skipped: usize,
    pub unavailable: usize,
}

impl IntegrityReport {
    fn record(&mut self, photo_id: &str, check: &PhotoCheck) {
        self.checked += 1;
        match check {
            PhotoCheck::Verified { .. } => self.verified += 1,
            PhotoCheck::Corrupted { .. } => self.corrupted.push(photo_id.to_string()),
            PhotoCheck::Skipped { .. } => self.skipped += 1,
            PhotoCheck::Unavailable { .. } => self.unavailable += 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty()
    }
}

#[derive(Debug, Default)]
struct Cursor {
    /// Database version observed before the last pass listed photos.
    version: i64,
    last_full_at: Option<i64>,
}

pub struct PhotoIntegrityAuditor {
    db: SharedDatabase,
    cloud: Arc<CloudStorageClient>,
    spool: PhotoSpool,
    clock: Arc<dyn Clock>,
    interval: Duration,
    full_pass_every: Duration,
    cursor: Mutex<Cursor>,
    worker: BackgroundWorker,
}

impl PhotoIntegrityAuditor {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);
    pub const FULL_PASS_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(
        db: SharedDatabase,
        cloud: Arc<CloudStorageClient>,
        spool: PhotoSpool,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            cloud,
            spool,
            clock,
            interval,
            full_pass_every: Self::FULL_PASS_EVERY,
            cursor: Mutex::new(Cursor::default()),
            worker: BackgroundWorker::new("photo-integrity"),
        }
    }

    /// Check one photo and flag it when corrupted.
    pub fn check_photo(&self, photo_id: &str) -> Result<PhotoCheck> {
        let photo = {
            let db = self.db.lock()?;
            PhotoRepository::new(db.connection()).get(photo_id)?
        }
        .ok_or_else(|| Error::NotFound(format!("photo `{photo_id}`")))?;
        let check = self.inspect(&photo);
        self.flag_if_corrupted(&photo, &check)?;
        Ok(check)
    }

    /// Check every photo.
    pub fn run_full(&self) -> Result<IntegrityReport> {
        let (mark, photos) = {
            let db = self.db.lock()?;
            let mark = SqliteChangeStore::new(db.connection()).current_db_version()?;
            (mark, PhotoRepository::new(db.connection()).list_all()?)
        };
        let report = self.audit(&photos)?;
        {
            let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
            cursor.version = mark;
            cursor.last_full_at = Some(self.clock.now_millis());
        }
        tracing::info!(?report, "Full photo integrity pass finished");
        Ok(report)
    }

    /// Check photos changed since the previous pass.
    pub fn run_incremental(&self) -> Result<IntegrityReport> {
        let since = self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .version;
        let (mark, photos) = {
            let db = self.db.lock()?;
            let mark = SqliteChangeStore::new(db.connection()).current_db_version()?;
            (mark, PhotoRepository::new(db.connection()).list_changed_since(since)?)
        };
        let report = self.audit(&photos)?;
        self.cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .version = mark;
        if report.checked > 0 {
            tracing::info!(?report, since, "Incremental photo integrity pass finished");
        }
        Ok(report)
    }

    /// One worker tick: a full pass when due, otherwise an incremental one.
    pub fn tick(&self) -> Result<IntegrityReport> {
        let now = self.clock.now_millis();
        let full_due = self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_full_at
            .map_or(true, |at| {
                now.saturating_sub(at) >= duration_millis(self.full_pass_every)
            });
        if full_due {
            self.run_full()
        } else {
            self.run_incremental()
        }
    }

    pub fn start(self: &Arc<Self>) -> bool {
        let auditor: Weak<Self> = Arc::downgrade(self);
        self.worker.start(self.interval, move || {
            let Some(auditor) = auditor.upgrade() else {
                return;
            };
            if let Err(error) = auditor.tick() {
                tracing::error!(%error, "Photo integrity pass failed");
            }
        })
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    fn audit(&self, photos: &[Photo]) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();
        for photo in photos {
            let check = self.inspect(photo);
            self.flag_if_corrupted(photo, &check)?;
            report.record(&photo.id, &check);
        }
        Ok(report)
    }

    fn inspect(&self, photo: &Photo) -> PhotoCheck {
        if photo.hash_value.trim().is_empty() {
            return PhotoCheck::Skipped {
                reason: "no recorded hash".into(),
            };
        }

        // `file_path` is replicated, so only files inside our own spool count.
        if photo.has_local_file() && self.spool.contains(Path::new(&photo.file_path)) {
            return match hash_file(Path::new(&photo.file_path)) {
                Ok((digest, size)) => {
                    let size = i64::try_from(size).unwrap_or(i64::MAX);
                    compare(photo, CheckSource::LocalFile, &digest, size)
                }
                Err(error) => PhotoCheck::Unavailable {
                    reason: format!("cannot read local file: {error}"),
                },
            };
        }

        if photo.upload_status == UploadStatus::Completed && photo.has_cloud_copy() {
            return match self.cloud.download_url(&photo.cloud_url) {
                Ok(bytes) => {
                    let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
                    compare(photo, CheckSource::Cloud, &hash_bytes(&bytes), size)
                }
                Err(error) => PhotoCheck::Unavailable {
                    reason: error.to_string(),
                },
            };
        }

        PhotoCheck::Skipped {
            reason: "no local file or cloud copy".into(),
        }
    }

    fn flag_if_corrupted(&self, photo: &Photo, check: &PhotoCheck) -> Result<()> {
        let PhotoCheck::Corrupted { source, reason } = check else {
            return Ok(());
        };
        tracing::warn!(photo_id = %photo.id, ?source, %reason, "Photo failed integrity check");
        if photo.corrupted {
            return Ok(());
        }
        let db = self.db.lock()?;
        PhotoRepository::new(db.connection()).update(&photo.id, &[("corrupted", SqlValue::Integer(1))])
    }
}

fn compare(photo: &Photo, source: CheckSource, digest: &str, size: i64) -> PhotoCheck {
    if !digest.eq_ignore_ascii_case(photo.hash_value.trim()) {
        return PhotoCheck::Corrupted {
            source,
            reason: format!("hash {digest} does not match recorded {}", photo.hash_value),
        };
    }
    if photo.size_bytes > 0 && photo.size_bytes != size {
        return PhotoCheck::Corrupted {
            source,
            reason: format!("size {size} does not match recorded {}", photo.size_bytes),
        };
    }
    PhotoCheck::Verified { source }
}
