//! Replicated-changes log and per-column clocks.

use std::cmp::Ordering;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{ChangeRecord, PrimaryKey, ValidatedChange};
use crate::schema::{ColumnDef, Table};

/// Result of merging one change into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The change won and is now the stored value.
    Applied,
    /// A stored change with a higher clock kept its value.
    Superseded,
    /// The exact change was merged before; nothing happened.
    Duplicate,
}

/// A winning column value as served to peers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChange {
    pub table: Table,
    pub pk: PrimaryKey,
    pub column: String,
    pub value: SqlValue,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: Uuid,
}

impl StoredChange {
    pub fn to_record(&self) -> ChangeRecord {
        ChangeRecord::outgoing(
            self.table,
            &self.pk,
            &self.column,
            &self.value,
            self.col_version,
            self.db_version,
            &self.site_id,
        )
    }
}

/// Storage contract for replicated changes.
///
/// Implementations must be read-after-write consistent on the same handle:
/// `read_column` issued after `merge` or `write_local` observes their effect.
/// The change applicator derives conflicts from that observation.
pub trait ChangeStore {
    /// Current value of a column; `None` when the row does not exist.
    fn read_column(&self, table: Table, pk: &PrimaryKey, column: &str)
        -> Result<Option<SqlValue>>;

    /// Allocate the next local database version.
    fn next_db_version(&self) -> Result<i64>;

    /// Merge a peer change under last-writer-wins, stamping it with
    /// `local_db_version` when it wins.
    fn merge(&self, change: &ValidatedChange, local_db_version: i64) -> Result<MergeOutcome>;

    /// Record server-originated column writes so they replicate to peers.
    fn write_local(&self, table: Table, pk: &PrimaryKey, columns: &[(&str, SqlValue)])
        -> Result<()>;

    /// Give every column of a row a fresh local database version.
    fn restamp_row(&self, table: Table, pk: &PrimaryKey) -> Result<()>;

    /// Drop the clocks of a deleted row.
    fn forget_row(&self, table: Table, pk: &PrimaryKey) -> Result<()>;

    /// Winning values stamped after `version`, excluding changes that
    /// originated at `exclude_site` and changes to photos still pending upload.
    fn changes_since(&self, version: i64, exclude_site: Option<&Uuid>)
        -> Result<Vec<StoredChange>>;

    /// This server's replication identity.
    fn local_site_id(&self) -> Result<Uuid>;
}

/// `SQLite` implementation working directly on a connection or transaction.
pub struct SqliteChangeStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteChangeStore<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn column_def(table: Table, column: &str) -> Result<&'static ColumnDef> {
        table.column(column).ok_or_else(|| {
            Error::InvalidInput(format!("unknown column `{column}` for table `{table}`"))
        })
    }

    /// Create the row if needed and set one column.
    fn materialize(
        &self,
        table: Table,
        pk: &PrimaryKey,
        column: &ColumnDef,
        value: &SqlValue,
    ) -> Result<()> {
        self.conn.execute(
            &format!("INSERT OR IGNORE INTO {table} (id) VALUES (?1)"),
            [pk],
        )?;
        self.conn.execute(
            &format!("UPDATE {table} SET {} = ?1 WHERE id = ?2", column.name),
            params![value, pk],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn upsert_clock(
        &self,
        table: Table,
        pk: &str,
        column: &str,
        value: &SqlValue,
        col_version: i64,
        db_version: i64,
        origin_db_version: i64,
        site_id: &Uuid,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO crdt_clock
                (tbl, pk, cid, val, col_version, db_version, origin_db_version, site_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(tbl, pk, cid) DO UPDATE SET
                val = excluded.val,
                col_version = excluded.col_version,
                db_version = excluded.db_version,
                origin_db_version = excluded.origin_db_version,
                site_id = excluded.site_id",
            params![
                table.name(),
                pk,
                column,
                value,
                col_version,
                db_version,
                origin_db_version,
                site_id.to_string()
            ],
        )?;
        Ok(())
    }

    fn append_log(&self, change: &ValidatedChange, pk: &str) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO crdt_changes
                (tbl, pk, cid, val, col_version, db_version, site_id, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                change.table.name(),
                pk,
                change.column_name(),
                change.value,
                change.col_version,
                change.db_version,
                change.site_id.to_string(),
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn current_clock(&self, table: Table, pk: &str, column: &str) -> Result<Option<ColumnClock>> {
        let clock = self
            .conn
            .query_row(
                "SELECT col_version, origin_db_version, site_id FROM crdt_clock
                 WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
                params![table.name(), pk, column],
                |row| {
                    Ok(ColumnClock {
                        col_version: row.get(0)?,
                        origin_db_version: row.get(1)?,
                        site_id: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(clock)
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM crdt_meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Latest allocated database version, 0 before the first write.
    pub fn current_db_version(&self) -> Result<i64> {
        let raw = self.meta("db_version")?;
        Ok(raw.and_then(|raw| raw.parse().ok()).unwrap_or(0))
    }
}

/// Clock of the currently stored value of a column.
#[derive(Debug)]
struct ColumnClock {
    col_version: i64,
    origin_db_version: i64,
    site_id: String,
}

impl ColumnClock {
    /// Lexicographic `(col_version, db_version, site_id)` ordering.
    fn compare_incoming(&self, change: &ValidatedChange) -> Ordering {
        change
            .col_version
            .cmp(&self.col_version)
            .then(change.db_version.cmp(&self.origin_db_version))
            .then_with(|| change.site_id.to_string().cmp(&self.site_id))
    }
}

impl ChangeStore for SqliteChangeStore<'_> {
    fn read_column(
        &self,
        table: Table,
        pk: &PrimaryKey,
        column: &str,
    ) -> Result<Option<SqlValue>> {
        let column = Self::column_def(table, column)?;
        let value = self
            .conn
            .query_row(
                &format!("SELECT {} FROM {table} WHERE id = ?1", column.name),
                [pk],
                |row| row.get::<_, SqlValue>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn next_db_version(&self) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO crdt_meta (key, value) VALUES ('db_version', '1')
             ON CONFLICT(key) DO UPDATE SET value = CAST(value AS INTEGER) + 1",
            [],
        )?;
        let version = self.conn.query_row(
            "SELECT CAST(value AS INTEGER) FROM crdt_meta WHERE key = 'db_version'",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn merge(&self, change: &ValidatedChange, local_db_version: i64) -> Result<MergeOutcome> {
        let pk = change.pk.canonical();
        if !self.append_log(change, &pk)? {
            return Ok(MergeOutcome::Duplicate);
        }

        let wins = match self.current_clock(change.table, &pk, change.column_name())? {
            None => true,
            Some(clock) => clock.compare_incoming(change) == Ordering::Greater,
        };
        if !wins {
            return Ok(MergeOutcome::Superseded);
        }

        self.materialize(change.table, &change.pk, change.column, &change.value)?;
        self.upsert_clock(
            change.table,
            &pk,
            change.column_name(),
            &change.value,
            change.col_version,
            local_db_version,
            change.db_version,
            &change.site_id,
        )?;
        Ok(MergeOutcome::Applied)
    }

    fn write_local(
        &self,
        table: Table,
        pk: &PrimaryKey,
        columns: &[(&str, SqlValue)],
    ) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let site_id = self.local_site_id()?;
        let db_version = self.next_db_version()?;
        let canonical = pk.canonical();

        for (name, value) in columns {
            let column = Self::column_def(table, name)?;
            let col_version = self
                .current_clock(table, &canonical, column.name)?
                .map_or(1, |clock| clock.col_version + 1);
            self.materialize(table, pk, column, value)?;
            self.upsert_clock(
                table,
                &canonical,
                column.name,
                value,
                col_version,
                db_version,
                db_version,
                &site_id,
            )?;
        }
        Ok(())
    }

    fn restamp_row(&self, table: Table, pk: &PrimaryKey) -> Result<()> {
        let db_version = self.next_db_version()?;
        self.conn.execute(
            "UPDATE crdt_clock SET db_version = ?1 WHERE tbl = ?2 AND pk = ?3",
            params![db_version, table.name(), pk.canonical()],
        )?;
        Ok(())
    }

    fn forget_row(&self, table: Table, pk: &PrimaryKey) -> Result<()> {
        self.conn.execute(
            "DELETE FROM crdt_clock WHERE tbl = ?1 AND pk = ?2",
            params![table.name(), pk.canonical()],
        )?;
        Ok(())
    }

    fn changes_since(
        &self,
        version: i64,
        exclude_site: Option<&Uuid>,
    ) -> Result<Vec<StoredChange>> {
        let exclude_site = exclude_site.map(ToString::to_string);
        let mut stmt = self.conn.prepare(
            "SELECT c.tbl, c.pk, c.cid, c.val, c.col_version, c.db_version, c.site_id
             FROM crdt_clock c
             LEFT JOIN photo p
                ON c.tbl = 'photo' AND p.id = json_extract(c.pk, '$.id')
             WHERE c.db_version > ?1
               AND (?2 IS NULL OR c.site_id != ?2)
               AND (c.tbl != 'photo' OR p.upload_status IS NULL OR p.upload_status != 'pending')
             ORDER BY c.db_version, c.tbl, c.pk, c.cid",
        )?;
        let rows = stmt
            .query_map(params![version, exclude_site], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, SqlValue>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(table, pk, column, value, col_version, db_version, site_id)| {
                let table = table
                    .parse::<Table>()
                    .map_err(|err| Error::Database(err.to_string()))?;
                let pk = PrimaryKey::from_canonical(&pk)
                    .ok_or_else(|| Error::Database(format!("malformed clock key `{pk}`")))?;
                let site_id = Uuid::parse_str(&site_id)
                    .map_err(|err| Error::Database(format!("malformed clock site id: {err}")))?;
                Ok(StoredChange {
                    table,
                    pk,
                    column,
                    value,
                    col_version,
                    db_version,
                    site_id,
                })
            })
            .collect()
    }

    fn local_site_id(&self) -> Result<Uuid> {
        if let Some(raw) = self.meta("site_id")? {
            return Uuid::parse_str(&raw)
                .map_err(|err| Error::Database(format!("malformed local site id: {err}")));
        }
        let site_id = Uuid::now_v7();
        self.conn.execute(
            "INSERT INTO crdt_meta (key, value) VALUES ('site_id', ?1)",
            [site_id.to_string()],
        )?;
        tracing::info!(%site_id, "Generated local site id");
        Ok(site_id)
    }
}
