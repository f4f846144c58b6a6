//! Conflict audit model

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Resolution strategy recorded for every conflict.
pub const LWW_STRATEGY: &str = "lww";

/// Recorded column conflict where a proposed value lost to the stored one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Audit row identifier
    pub id: i64,
    /// Table of the conflicting column
    pub table: String,
    /// Canonical primary key, e.g. `{"id":"p1"}`
    pub pk: String,
    /// Column name
    pub column: String,
    /// Value the peer proposed
    pub lost_value: JsonValue,
    /// Value that remained stored
    pub winning_value: JsonValue,
    /// Site that proposed the losing value
    pub origin_site_id: String,
    /// Resolution strategy name
    pub resolution_strategy: String,
    /// Unix ms when the conflict was recorded
    pub recorded_at: i64,
}

/// Conflict entry before it is assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub table: String,
    pub pk: String,
    pub column: String,
    pub lost_value: JsonValue,
    pub winning_value: JsonValue,
    pub origin_site_id: String,
    pub recorded_at: i64,
}
