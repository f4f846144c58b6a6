//! Change records exchanged between peers.

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::schema::{ColumnDef, ColumnKind, Table};

/// A column-level change as it travels on the wire.
///
/// Every field is kept as raw JSON so that malformed input surfaces as a
/// validation error naming the offending record rather than a body parse
/// failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(default)]
    pub table: JsonValue,
    #[serde(default)]
    pub pk: JsonValue,
    #[serde(default)]
    pub cid: JsonValue,
    #[serde(default)]
    pub val: JsonValue,
    #[serde(default)]
    pub col_version: JsonValue,
    #[serde(default)]
    pub db_version: JsonValue,
    #[serde(default)]
    pub site_id: JsonValue,
}

impl ChangeRecord {
    /// Build an outgoing record from stored values.
    pub fn outgoing(
        table: Table,
        pk: &PrimaryKey,
        column: &str,
        value: &SqlValue,
        col_version: i64,
        db_version: i64,
        site_id: &Uuid,
    ) -> Self {
        Self {
            table: JsonValue::from(table.name()),
            pk: pk.to_json(),
            cid: JsonValue::from(column),
            val: sql_to_json(value),
            col_version: JsonValue::from(col_version),
            db_version: JsonValue::from(db_version),
            site_id: JsonValue::from(site_id.to_string()),
        }
    }
}

/// Primary key of a replicated row. Every table is keyed by a single `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Integer(i64),
    Text(String),
}

impl PrimaryKey {
    /// Object form, e.g. `{"id": 7}`.
    pub fn to_json(&self) -> JsonValue {
        serde_json::json!({ "id": self })
    }

    /// Canonical string form used as the clock and log key.
    pub fn canonical(&self) -> String {
        self.to_json().to_string()
    }

    /// Parse the canonical string form back.
    pub fn from_canonical(raw: &str) -> Option<Self> {
        let value: JsonValue = serde_json::from_str(raw).ok()?;
        match value.get("id")? {
            JsonValue::Number(number) => number.as_i64().map(Self::Integer),
            JsonValue::String(text) => Some(Self::Text(text.clone())),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Integer(_) => None,
        }
    }

    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(id) => Some(*id),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

impl ToSql for PrimaryKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Integer(id) => ToSqlOutput::from(*id),
            Self::Text(id) => ToSqlOutput::from(id.as_str()),
        })
    }
}

/// A change that passed structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChange {
    /// Position of the record in its batch.
    pub index: usize,
    pub table: Table,
    pub pk: PrimaryKey,
    pub column: &'static ColumnDef,
    pub value: SqlValue,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: Uuid,
}

impl ValidatedChange {
    pub const fn column_name(&self) -> &'static str {
        self.column.name
    }

    /// Text payload, if the value is text.
    pub fn text_value(&self) -> Option<&str> {
        as_text(&self.value)
    }
}

/// Convert a JSON value into the storage value for a column kind.
///
/// Returns `None` when the value cannot be stored in that kind of column.
pub fn json_to_sql(value: &JsonValue, kind: ColumnKind) -> Option<SqlValue> {
    if value.is_null() {
        return Some(SqlValue::Null);
    }
    match kind {
        ColumnKind::Integer => match value {
            JsonValue::Number(number) => number.as_i64().map(SqlValue::Integer),
            JsonValue::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
            _ => None,
        },
        ColumnKind::Boolean => match value {
            JsonValue::Bool(flag) => Some(SqlValue::Integer(i64::from(*flag))),
            JsonValue::Number(number) => match number.as_i64() {
                Some(flag @ (0 | 1)) => Some(SqlValue::Integer(flag)),
                _ => None,
            },
            _ => None,
        },
        ColumnKind::Real => value.as_f64().map(SqlValue::Real),
        ColumnKind::Text => Some(SqlValue::Text(match value {
            JsonValue::String(text) => text.clone(),
            other => other.to_string(),
        })),
    }
}

/// Convert a stored value to JSON for the wire.
pub fn sql_to_json(value: &SqlValue) -> JsonValue {
    match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Integer(number) => JsonValue::from(*number),
        SqlValue::Real(number) => serde_json::Number::from_f64(*number)
            .map_or(JsonValue::Null, JsonValue::Number),
        SqlValue::Text(text) => JsonValue::from(text.as_str()),
        SqlValue::Blob(bytes) => JsonValue::from(hex::encode(bytes)),
    }
}

/// Borrow the text payload of a stored value.
pub fn as_text(value: &SqlValue) -> Option<&str> {
    match value {
        SqlValue::Text(text) => Some(text),
        _ => None,
    }
}

/// Text payload that is present and not blank.
pub fn non_empty_text(value: &SqlValue) -> Option<&str> {
    as_text(value).filter(|text| !text.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn canonical_pk_is_stable() {
        assert_eq!(PrimaryKey::Integer(7).canonical(), r#"{"id":7}"#);
        assert_eq!(PrimaryKey::Text("p1".into()).canonical(), r#"{"id":"p1"}"#);
        assert_eq!(
            PrimaryKey::from_canonical(r#"{"id":"p1"}"#),
            Some(PrimaryKey::Text("p1".into()))
        );
        assert_eq!(PrimaryKey::from_canonical("not json"), None);
    }

    #[test]
    fn json_to_sql_respects_column_kind() {
        assert_eq!(
            json_to_sql(&json!(5), ColumnKind::Integer),
            Some(SqlValue::Integer(5))
        );
        assert_eq!(json_to_sql(&json!("5"), ColumnKind::Integer), None);
        assert_eq!(
            json_to_sql(&json!(true), ColumnKind::Boolean),
            Some(SqlValue::Integer(1))
        );
        assert_eq!(json_to_sql(&json!(2), ColumnKind::Boolean), None);
        assert_eq!(
            json_to_sql(&json!(3), ColumnKind::Real),
            Some(SqlValue::Real(3.0))
        );
        assert_eq!(
            json_to_sql(&json!(["a", "b"]), ColumnKind::Text),
            Some(SqlValue::Text(r#"["a","b"]"#.into()))
        );
        assert_eq!(
            json_to_sql(&JsonValue::Null, ColumnKind::Real),
            Some(SqlValue::Null)
        );
    }

    #[test]
    fn outgoing_record_uses_object_pk() {
        let site = Uuid::nil();
        let record = ChangeRecord::outgoing(
            Table::Photo,
            &PrimaryKey::Text("p1".into()),
            "description",
            &SqlValue::Text("roof".into()),
            2,
            9,
            &site,
        );
        assert_eq!(record.table, json!("photo"));
        assert_eq!(record.pk, json!({"id": "p1"}));
        assert_eq!(record.val, json!("roof"));
        assert_eq!(record.db_version, json!(9));
    }
}
