//! Data models for fieldsync

mod change;
mod conflict;
mod issue;
mod photo;

pub use change::{
    as_text, json_to_sql, non_empty_text, sql_to_json, ChangeRecord, PrimaryKey, ValidatedChange,
};
pub use conflict::{ConflictEntry, NewConflict, LWW_STRATEGY};
pub use issue::{IntegrityIssue, IssueAction};
pub use photo::{is_valid_photo_id, parse_tags, Photo, UploadStatus};
