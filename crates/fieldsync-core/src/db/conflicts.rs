//! Conflict audit repository

use rusqlite::{params, Connection};
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::models::{ConflictEntry, NewConflict, LWW_STRATEGY};

pub struct ConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append an entry. Entries are never updated or deleted.
    pub fn record(&self, conflict: &NewConflict) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO crdt_conflicts
                (tbl, pk, cid, lost_value, winning_value, origin_site_id, resolution_strategy, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                conflict.table,
                conflict.pk,
                conflict.column,
                conflict.lost_value.to_string(),
                conflict.winning_value.to_string(),
                conflict.origin_site_id,
                LWW_STRATEGY,
                conflict.recorded_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent entries first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ConflictEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, tbl, pk, cid, lost_value, winning_value, origin_site_id,
                    resolution_strategy, recorded_at
             FROM crdt_conflicts
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?1",
        )?;
        let conflicts = stmt
            .query_map([limit], |row| {
                Ok(ConflictEntry {
                    id: row.get(0)?,
                    table: row.get(1)?,
                    pk: row.get(2)?,
                    column: row.get(3)?,
                    lost_value: parse_json(row.get(4)?),
                    winning_value: parse_json(row.get(5)?),
                    origin_site_id: row.get(6)?,
                    resolution_strategy: row.get(7)?,
                    recorded_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    pub fn count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM crdt_conflicts", [], |row| row.get(0))?)
    }
}

fn parse_json(raw: Option<String>) -> JsonValue {
    raw.and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(JsonValue::Null)
}
