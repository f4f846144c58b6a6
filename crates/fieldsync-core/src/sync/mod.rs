//! CRDT synchronization: validation, soundness checks and merging of peer
//! change batches.

mod applicator;
mod foreign_keys;
mod photo_guard;
mod validator;

pub use applicator::{ApplyOutcome, ChangeApplicator, SyncError};
pub use foreign_keys::ForeignKeyChecker;
pub use photo_guard::{
    GuardRejection, ObjectDownloads, PendingPhotoValues, PhotoGuard, VerificationError,
    PENDING_ALLOWED_COLUMNS, PENDING_PROTECTED_COLUMNS,
};
pub use validator::{validate, validate_batch, ValidationError, ValidationFailure};
