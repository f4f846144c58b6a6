use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fieldsync_core::clock::{Clock, SystemClock};
use fieldsync_core::config::{ServiceConfig, StorageConfig};
use fieldsync_core::db::SharedDatabase;
use fieldsync_core::models::ConflictEntry;
use fieldsync_core::services::{OrphanAuditor, PhotoIntegrityAuditor, PhotoSpool, UploadQueue};
use fieldsync_core::storage::{CircuitBreaker, CloudStorageClient, ObjectStore};
use serde::Serialize;

use crate::error::CliError;

/// Services the commands run against, built from the same environment as the
/// server so both see the same database, spool and object store.
pub struct Toolkit {
    pub db: SharedDatabase,
    pub cloud: Arc<CloudStorageClient>,
    services: ServiceConfig,
    clock: Arc<dyn Clock>,
}

impl Toolkit {
    pub fn from_env(db_path: &Path) -> Result<Self, CliError> {
        let store = StorageConfig::from_env()?.build_object_store()?;
        let services = ServiceConfig::from_env()?;
        Ok(Self::new(
            SharedDatabase::open_path(db_path)?,
            store,
            services,
            Arc::new(SystemClock),
        ))
    }

    pub fn new(
        db: SharedDatabase,
        store: Arc<dyn ObjectStore>,
        services: ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = CircuitBreaker::new(services.breaker, clock.clone());
        Self {
            db,
            cloud: Arc::new(CloudStorageClient::new(store, breaker)),
            services,
            clock,
        }
    }

    pub fn upload_queue(&self) -> Result<UploadQueue, CliError> {
        Ok(UploadQueue::new(
            self.db.clone(),
            self.cloud.clone(),
            self.spool()?,
            self.services.upload,
            self.clock.clone(),
        ))
    }

    pub fn orphan_auditor(&self) -> OrphanAuditor {
        OrphanAuditor::new(
            self.db.clone(),
            self.cloud.clone(),
            self.services.orphan_interval,
        )
    }

    pub fn integrity_auditor(&self) -> Result<PhotoIntegrityAuditor, CliError> {
        Ok(PhotoIntegrityAuditor::new(
            self.db.clone(),
            self.cloud.clone(),
            self.spool()?,
            self.clock.clone(),
            self.services.integrity_interval,
        ))
    }

    fn spool(&self) -> Result<PhotoSpool, CliError> {
        Ok(PhotoSpool::open(&self.services.spool_dir)?)
    }
}

#[derive(Serialize)]
pub struct ConflictItem {
    pub id: i64,
    pub table: String,
    pub pk: String,
    pub column: String,
    pub lost_value: serde_json::Value,
    pub winning_value: serde_json::Value,
    pub origin_site_id: String,
    pub strategy: String,
    pub recorded_at: i64,
    pub recorded_at_iso: String,
}

pub fn conflict_to_item(conflict: &ConflictEntry) -> ConflictItem {
    ConflictItem {
        id: conflict.id,
        table: conflict.table.clone(),
        pk: conflict.pk.clone(),
        column: conflict.column.clone(),
        lost_value: conflict.lost_value.clone(),
        winning_value: conflict.winning_value.clone(),
        origin_site_id: conflict.origin_site_id.clone(),
        strategy: conflict.resolution_strategy.clone(),
        recorded_at: conflict.recorded_at,
        recorded_at_iso: format_timestamp(conflict.recorded_at),
    }
}

pub fn format_conflict_lines(conflicts: &[ConflictEntry]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<4}  {}{}.{}  kept={} lost={}",
                format_timestamp(conflict.recorded_at),
                conflict.resolution_strategy,
                conflict.table,
                conflict.pk,
                conflict.column,
                conflict.winning_value,
                conflict.lost_value
            )
        })
        .collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn normalize_photo_id(id: &str) -> Result<String, CliError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(CliError::EmptyPhotoId);
    }
    Ok(trimmed.to_string())
}

pub fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("FIELDSYNC_DATABASE_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
        .join("fieldsync.db")
}
