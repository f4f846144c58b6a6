//! Photo model and upload lifecycle states.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upload lifecycle of a photo.
///
/// While the upload queue works on a photo its row stays `Pending`; the
/// in-flight state is only visible in the local spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Completed,
    Failed,
    PermanentlyFailed,
}

impl UploadStatus {
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Completed,
        Self::Failed,
        Self::PermanentlyFailed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown upload status `{s}`"))
    }
}

/// Whether a client-chosen photo id is safe to use in object names and
/// spool file names.
pub fn is_valid_photo_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

/// A photo row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: String,
    pub survey_id: Option<i64>,
    pub site_id: Option<i64>,
    pub question_id: Option<i64>,
    pub cloud_url: String,
    pub thumbnail_url: String,
    pub upload_status: UploadStatus,
    pub retry_count: i64,
    /// Unix ms of the last failed attempt.
    pub last_retry_at: Option<i64>,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub hash_algo: String,
    pub hash_value: String,
    pub size_bytes: i64,
    pub file_path: String,
    pub corrupted: bool,
}

impl Photo {
    pub fn has_cloud_copy(&self) -> bool {
        !self.cloud_url.trim().is_empty()
    }

    pub fn has_local_file(&self) -> bool {
        !self.file_path.trim().is_empty()
    }
}

/// Parse the serialized tag list, tolerating legacy garbage.
pub fn parse_tags(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_status_parses_wire_names() {
        assert_eq!(
            "permanently_failed".parse::<UploadStatus>(),
            Ok(UploadStatus::PermanentlyFailed)
        );
        assert!("processing".parse::<UploadStatus>().is_err());
        assert_eq!(UploadStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn photo_ids_are_restricted() {
        assert!(is_valid_photo_id("p1"));
        assert!(is_valid_photo_id("0190b2c4-7d1e-7aa0-9c1f-3c2b1a0e9f11"));
        assert!(!is_valid_photo_id(""));
        assert!(!is_valid_photo_id("../etc/passwd"));
        assert!(!is_valid_photo_id(".hidden"));
        assert!(!is_valid_photo_id("a/b"));
    }

    #[test]
    fn tags_fall_back_to_empty() {
        assert_eq!(parse_tags(Some(r#"["roof","north"]"#)), vec!["roof", "north"]);
        assert!(parse_tags(Some("roof")).is_empty());
        assert!(parse_tags(None).is_empty());
    }
}
