//! Structural validation of incoming change records.
//!
//! A record that fails here marks the submitting client as malformed, so the
//! whole batch is refused before anything is written.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use rusqlite::types::Value as SqlValue;
use uuid::Uuid;

use crate::models::{is_valid_photo_id, json_to_sql, ChangeRecord, PrimaryKey, ValidatedChange};
use crate::schema::{PkKind, Table};
use crate::storage::is_valid_digest;

/// Why a record is structurally invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationFailure {
    #[error("table must be a string")]
    TableNotString,

    #[error("unknown table `{0}`")]
    UnknownTable(String),

    #[error("column must be a string")]
    ColumnNotString,

    #[error("unknown column `{column}` for table `{table}`")]
    UnknownColumn { table: Table, column: String },

    #[error("pk must be a JSON object with exactly the key `id`")]
    MalformedPk,

    #[error("pk id for table `{0}` must be an integer")]
    IntegerPkExpected(Table),

    #[error("photo id `{0}` is not a valid identifier")]
    InvalidPhotoId(String),

    #[error("{field} must be a non-negative integer")]
    InvalidVersion { field: &'static str },

    #[error("site_id must be a UUID string")]
    InvalidSiteId,

    #[error("hash_value `{0}` is not a SHA-256 hex digest")]
    InvalidHash(String),

    #[error("value is not valid for {kind} column `{column}`")]
    IncompatibleValue {
        column: &'static str,
        kind: &'static str,
    },
}

/// A structural failure together with the position of the offending record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("change {index}: {reason}")]
pub struct ValidationError {
    pub index: usize,
    pub reason: ValidationFailure,
}

/// Validate one record at position `index` of its batch.
pub fn validate(index: usize, record: &ChangeRecord) -> Result<ValidatedChange, ValidationError> {
    validate_record(index, record).map_err(|reason| ValidationError { index, reason })
}

/// Validate a whole batch, failing on the first malformed record.
pub fn validate_batch(records: &[ChangeRecord]) -> Result<Vec<ValidatedChange>, ValidationError> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| validate(index, record))
        .collect()
}

fn validate_record(
    index: usize,
    record: &ChangeRecord,
) -> Result<ValidatedChange, ValidationFailure> {
    let table_name = record
        .table
        .as_str()
        .ok_or(ValidationFailure::TableNotString)?;
    let table: Table = table_name
        .parse()
        .map_err(|_| ValidationFailure::UnknownTable(table_name.to_string()))?;

    let column_name = record.cid.as_str().ok_or(ValidationFailure::ColumnNotString)?;
    let column = table
        .column(column_name)
        .ok_or_else(|| ValidationFailure::UnknownColumn {
            table,
            column: column_name.to_string(),
        })?;

    let pk = parse_pk(table, &record.pk)?;
    let col_version = parse_version(&record.col_version, "col_version")?;
    let db_version = parse_version(&record.db_version, "db_version")?;
    let site_id = record
        .site_id
        .as_str()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or(ValidationFailure::InvalidSiteId)?;

    let value =
        json_to_sql(&record.val, column.kind).ok_or(ValidationFailure::IncompatibleValue {
            column: column.name,
            kind: column.kind.as_str(),
        })?;
    if table == Table::Photo && column.name == "hash_value" {
        check_hash(&value)?;
    }

    Ok(ValidatedChange {
        index,
        table,
        pk,
        column,
        value,
        col_version,
        db_version,
        site_id,
    })
}

/// Accept the key either as an object or as its JSON-encoded string form.
fn parse_pk(table: Table, raw: &JsonValue) -> Result<PrimaryKey, ValidationFailure> {
    let decoded;
    let object: &Map<String, JsonValue> = match raw {
        JsonValue::Object(object) => object,
        JsonValue::String(text) => {
            decoded = serde_json::from_str::<JsonValue>(text)
                .map_err(|_| ValidationFailure::MalformedPk)?;
            decoded.as_object().ok_or(ValidationFailure::MalformedPk)?
        }
        _ => return Err(ValidationFailure::MalformedPk),
    };
    if object.len() != 1 {
        return Err(ValidationFailure::MalformedPk);
    }
    let id = object.get("id").ok_or(ValidationFailure::MalformedPk)?;

    match table.pk_kind() {
        PkKind::Integer => id
            .as_i64()
            .map(PrimaryKey::Integer)
            .ok_or(ValidationFailure::IntegerPkExpected(table)),
        PkKind::Text => {
            let id = id
                .as_str()
                .ok_or_else(|| ValidationFailure::InvalidPhotoId(id.to_string()))?;
            if is_valid_photo_id(id) {
                Ok(PrimaryKey::Text(id.to_string()))
            } else {
                Err(ValidationFailure::InvalidPhotoId(id.to_string()))
            }
        }
    }
}

/// An empty hash clears the column; anything else must be a digest.
fn check_hash(value: &SqlValue) -> Result<(), ValidationFailure> {
    match value {
        SqlValue::Text(hash) if !hash.is_empty() && !is_valid_digest(hash) => {
            Err(ValidationFailure::InvalidHash(hash.clone()))
        }
        _ => Ok(()),
    }
}

/// Versions may arrive as numbers or numeric strings.
fn parse_version(raw: &JsonValue, field: &'static str) -> Result<i64, ValidationFailure> {
    let version = match raw {
        JsonValue::Number(number) => number.as_i64(),
        JsonValue::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };
    version
        .filter(|version| *version >= 0)
        .ok_or(ValidationFailure::InvalidVersion { field })
}
