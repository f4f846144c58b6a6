//! Long-running services built on the core layers.

mod orphan_auditor;
mod photo_integrity;
mod upload_queue;
mod worker;

pub use orphan_auditor::{
    fix as fix_orphans, scan as scan_orphans, AuditRun, CleanupSummary, OrphanAuditor,
    OrphanReport, Relationship,
};
pub use photo_integrity::{CheckSource, IntegrityReport, PhotoCheck, PhotoIntegrityAuditor};
pub use upload_queue::{
    retry_eligible, CycleReport, PhotoSpool, QueueStatus, SpoolArea, UploadFailure, UploadQueue,
    UploadQueueConfig,
};
pub use worker::BackgroundWorker;
