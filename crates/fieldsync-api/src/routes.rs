use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use fieldsync_core::clock::{Clock, SystemClock};
use fieldsync_core::config::ServiceConfig;
use fieldsync_core::db::{ChangeStore, SharedDatabase, SqliteChangeStore};
use fieldsync_core::models::{ChangeRecord, IntegrityIssue};
use fieldsync_core::services::{
    scan_orphans, OrphanAuditor, OrphanReport, PhotoIntegrityAuditor, PhotoSpool, UploadQueue,
};
use fieldsync_core::storage::{BreakerSnapshot, CircuitBreaker, CloudStorageClient, ObjectStore};
use fieldsync_core::sync::ChangeApplicator;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::{AppConfig, ConfigError};
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    db: SharedDatabase,
    cloud: Arc<CloudStorageClient>,
    uploads: Arc<UploadQueue>,
    orphans: Arc<OrphanAuditor>,
    integrity: Arc<PhotoIntegrityAuditor>,
    clock: Arc<dyn Clock>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let db = SharedDatabase::open_path(&config.database_path)?;
        let store = config.storage.build_object_store()?;
        let mut state = Self::assemble(db, store, &config.services, Arc::new(SystemClock))?;
        state.max_upload_bytes = config.max_upload_bytes;
        Ok(state)
    }

    /// Wire the services around one database and object store.
    pub fn assemble(
        db: SharedDatabase,
        store: Arc<dyn ObjectStore>,
        services: &ServiceConfig,
        clock: Arc<dyn Clock>,
    ) -> fieldsync_core::Result<Self> {
        let breaker = CircuitBreaker::new(services.breaker, clock.clone());
        let cloud = Arc::new(CloudStorageClient::new(store, breaker));
        let spool = PhotoSpool::open(&services.spool_dir)?;
        let uploads = Arc::new(UploadQueue::new(
            db.clone(),
            cloud.clone(),
            spool.clone(),
            services.upload,
            clock.clone(),
        ));
        let orphans = Arc::new(OrphanAuditor::new(
            db.clone(),
            cloud.clone(),
            services.orphan_interval,
        ));
        let integrity = Arc::new(PhotoIntegrityAuditor::new(
            db.clone(),
            cloud.clone(),
            spool,
            clock.clone(),
            services.integrity_interval,
        ));
        Ok(Self {
            db,
            cloud,
            uploads,
            orphans,
            integrity,
            clock,
            max_upload_bytes: 25 * 1024 * 1024,
        })
    }

    pub fn start_workers(&self) {
        self.uploads.start();
        self.orphans.start();
        self.integrity.start();
    }

    /// Stop every worker, waiting for in-flight passes.
    pub fn stop_workers(&self) {
        self.uploads.stop();
        self.orphans.stop();
        self.integrity.stop();
    }
}

pub fn app_router(state: AppState) -> Router {
    let photo_routes = Router::new()
        .route("/photos/{id}/data", put(upload_photo_data))
        .layer(DefaultBodyLimit::max(state.max_upload_bytes));

    let api_routes = Router::new()
        .route("/changes", post(apply_changes).get(list_changes))
        .route("/photos/recover", post(recover_uploads))
        .route("/integrity/orphans", get(orphan_report))
        .merge(photo_routes);

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

/// Run blocking core work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T, AppError>
where
    F: FnOnce() -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| AppError::internal(format!("blocking task failed: {error}")))?
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    circuit_breaker: BreakerSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: state.clock.now_millis(),
        circuit_breaker: state.cloud.breaker_snapshot(),
    })
}

#[derive(Debug, Serialize)]
struct ApplyResponse {
    message: &'static str,
    applied: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    integrity_issues: Vec<IntegrityIssue>,
}

async fn apply_changes(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ApplyResponse>, AppError> {
    let records: Vec<ChangeRecord> = serde_json::from_slice(&body).map_err(|error| {
        AppError::bad_request(format!("expected a JSON array of changes: {error}"))
    })?;
    let received = records.len();

    let outcome = blocking(move || {
        let applicator = ChangeApplicator::new(&state.cloud).with_clock(state.clock.as_ref());
        let keys = {
            let db = state.db.lock()?;
            applicator.verification_keys(db.connection(), &records)?
        };
        // Photo verification downloads run with the database unlocked.
        let downloads = applicator.fetch_objects(keys);
        let mut db = state.db.lock()?;
        Ok(applicator.process_changes_with(db.connection_mut(), &records, downloads)?)
    })
    .await?;

    tracing::info!(
        endpoint = "apply_changes",
        received,
        applied = outcome.applied,
        issues = outcome.integrity_issues.len(),
        conflicts = outcome.conflicts,
        "Processed change batch"
    );
    let message = if outcome.integrity_issues.is_empty() {
        "Changes applied successfully"
    } else {
        "Changes applied with integrity issues"
    };
    Ok(Json(ApplyResponse {
        message,
        applied: outcome.applied,
        integrity_issues: outcome.integrity_issues,
    }))
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    version: Option<String>,
    site_id: Option<String>,
}

async fn list_changes(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<Vec<ChangeRecord>>, AppError> {
    let version = match query.version.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| AppError::bad_request(format!("version must be an integer, got `{raw}`")))?,
    };
    let site_id = match query.site_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            Uuid::parse_str(raw)
                .map_err(|_| AppError::bad_request(format!("site_id must be a UUID, got `{raw}`")))?,
        ),
    };

    let records = blocking(move || {
        let db = state.db.lock()?;
        let changes = SqliteChangeStore::new(db.connection()).changes_since(version, site_id.as_ref())?;
        Ok(changes.iter().map(|change| change.to_record()).collect::<Vec<_>>())
    })
    .await?;
    Ok(Json(records))
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    photo_id: String,
    queued: bool,
}

async fn upload_photo_data(
    State(state): State<AppState>,
    Path(photo_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<QueuedResponse>), AppError> {
    let uploads = state.uploads.clone();
    let id = photo_id.clone();
    blocking(move || Ok(uploads.enqueue(&id, &body)?)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            photo_id,
            queued: true,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct RecoverRequest {
    #[serde(default)]
    photo_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct RecoverResponse {
    recovered: usize,
}

async fn recover_uploads(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RecoverResponse>, AppError> {
    let request: RecoverRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RecoverRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|error| AppError::bad_request(format!("invalid recover request: {error}")))?
    };
    let recovered = blocking(move || {
        Ok(state
            .uploads
            .recover_permanently_failed(request.photo_ids.as_deref())?)
    })
    .await?;
    Ok(Json(RecoverResponse { recovered }))
}

async fn orphan_report(State(state): State<AppState>) -> Result<Json<OrphanReport>, AppError> {
    let report = blocking(move || {
        let db = state.db.lock()?;
        Ok(scan_orphans(db.connection())?)
    })
    .await?;
    Ok(Json(report))
}
