//! Integrity issues reported back to a syncing peer.

use serde::{Deserialize, Serialize};

use super::ChangeRecord;

/// What happened to the change an issue refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    /// Dropped before storage.
    Rejected,
    /// Applied, but something looks off.
    Warning,
    /// Applied and lost to a stored value; recorded for audit.
    Logged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub action: IssueAction,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_hash: Option<String>,
}

impl IntegrityIssue {
    fn new(action: IssueAction, change: &ChangeRecord, error: impl Into<String>) -> Self {
        Self {
            action,
            error: error.into(),
            change: Some(change.clone()),
            photo_id: None,
            expected_hash: None,
            received_hash: None,
        }
    }

    pub fn rejected(change: &ChangeRecord, error: impl Into<String>) -> Self {
        Self::new(IssueAction::Rejected, change, error)
    }

    pub fn warning(change: &ChangeRecord, error: impl Into<String>) -> Self {
        Self::new(IssueAction::Warning, change, error)
    }

    pub fn logged(change: &ChangeRecord, error: impl Into<String>) -> Self {
        Self::new(IssueAction::Logged, change, error)
    }

    #[must_use]
    pub fn with_photo(mut self, photo_id: impl Into<String>) -> Self {
        self.photo_id = Some(photo_id.into());
        self
    }

    #[must_use]
    pub fn with_hashes(mut self, expected: impl Into<String>, received: impl Into<String>) -> Self {
        self.expected_hash = Some(expected.into());
        self.received_hash = Some(received.into());
        self
    }
}
