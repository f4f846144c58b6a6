//! Photo repository

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::changes::{ChangeStore, SqliteChangeStore};
use crate::error::Result;
use crate::models::{parse_tags, Photo, PrimaryKey, UploadStatus};
use crate::schema::Table;

const PHOTO_COLUMNS: &str = "id, survey_id, site_id, question_id, cloud_url, thumbnail_url,
    upload_status, retry_count, last_retry_at, description, category, tags, created_at,
    hash_algo, hash_value, size_bytes, file_path, corrupted";

/// Photo reads and lifecycle writes.
///
/// Writes go through the change store so they replicate like peer edits.
pub struct PhotoRepository<'a> {
    conn: &'a Connection,
}

impl<'a> PhotoRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn row_to_photo(row: &Row<'_>) -> rusqlite::Result<Photo> {
        let status: Option<String> = row.get(6)?;
        let upload_status = match status.as_deref() {
            None | Some("") => UploadStatus::Pending,
            Some(raw) => raw.parse().unwrap_or(UploadStatus::Failed),
        };
        let tags: Option<String> = row.get(11)?;

        Ok(Photo {
            id: row.get(0)?,
            survey_id: row.get(1)?,
            site_id: row.get(2)?,
            question_id: row.get(3)?,
            cloud_url: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            thumbnail_url: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            upload_status,
            retry_count: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
            last_retry_at: row.get(8)?,
            description: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            category: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            tags: parse_tags(tags.as_deref()),
            created_at: row.get::<_, Option<i64>>(12)?.unwrap_or_default(),
            hash_algo: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
            hash_value: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
            size_bytes: row.get::<_, Option<i64>>(15)?.unwrap_or_default(),
            file_path: row.get::<_, Option<String>>(16)?.unwrap_or_default(),
            corrupted: row.get::<_, Option<bool>>(17)?.unwrap_or_default(),
        })
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Photo>> {
        let mut stmt = self.conn.prepare(sql)?;
        let photos = stmt
            .query_map(params, Self::row_to_photo)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    pub fn get(&self, id: &str) -> Result<Option<Photo>> {
        let photo = self
            .conn
            .query_row(
                &format!("SELECT {PHOTO_COLUMNS} FROM photo WHERE id = ?1"),
                [id],
                Self::row_to_photo,
            )
            .optional()?;
        Ok(photo)
    }

    pub fn list_all(&self) -> Result<Vec<Photo>> {
        self.query(
            &format!("SELECT {PHOTO_COLUMNS} FROM photo ORDER BY created_at, id"),
            [],
        )
    }

    pub fn list_by_status(&self, status: UploadStatus) -> Result<Vec<Photo>> {
        self.query(
            &format!(
                "SELECT {PHOTO_COLUMNS} FROM photo WHERE upload_status = ?1 ORDER BY created_at, id"
            ),
            [status.as_str()],
        )
    }

    /// Photos with any column stamped after `db_version`.
    pub fn list_changed_since(&self, db_version: i64) -> Result<Vec<Photo>> {
        self.query(
            &format!(
                "SELECT {PHOTO_COLUMNS} FROM photo WHERE id IN (
                    SELECT json_extract(pk, '$.id') FROM crdt_clock
                    WHERE tbl = 'photo' AND db_version > ?1
                ) ORDER BY created_at, id"
            ),
            [db_version],
        )
    }

    /// Number of photos per upload status.
    pub fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT COALESCE(upload_status, 'pending'), COUNT(*) FROM photo
             GROUP BY 1 ORDER BY 1",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// Set lifecycle columns as a replicated local write.
    pub fn update(&self, id: &str, columns: &[(&str, SqlValue)]) -> Result<()> {
        SqliteChangeStore::new(self.conn).write_local(
            Table::Photo,
            &PrimaryKey::Text(id.to_string()),
            columns,
        )
    }

    /// Delete a photo row and its clocks, returning what was deleted.
    pub fn delete(&self, id: &str) -> Result<Option<Photo>> {
        let Some(photo) = self.get(id)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM photo WHERE id = ?1", params![id])?;
        SqliteChangeStore::new(self.conn)
            .forget_row(Table::Photo, &PrimaryKey::Text(id.to_string()))?;
        Ok(Some(photo))
    }
}

/// Shorthand for a text column value.
pub fn text(value: impl Into<String>) -> SqlValue {
    SqlValue::Text(value.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    fn seed(conn: &Connection, id: &str, status: UploadStatus) {
        PhotoRepository::new(conn)
            .update(
                id,
                &[
                    ("upload_status", text(status.as_str())),
                    ("hash_value", text("ab".repeat(32))),
                    ("tags", text(r#"["roof"]"#)),
                ],
            )
            .unwrap();
    }

    #[test]
    fn get_reads_defaults_and_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        seed(db.connection(), "p1", UploadStatus::Failed);

        let photo = PhotoRepository::new(db.connection()).get("p1").unwrap().unwrap();
        assert_eq!(photo.upload_status, UploadStatus::Failed);
        assert_eq!(photo.hash_algo, "sha256");
        assert_eq!(photo.tags, vec!["roof".to_string()]);
        assert_eq!(photo.retry_count, 0);
        assert!(!photo.corrupted);
        assert!(!photo.has_cloud_copy());
    }

    #[test]
    fn list_and_count_by_status() {
        let db = Database::open_in_memory().unwrap();
        seed(db.connection(), "p1", UploadStatus::Pending);
        seed(db.connection(), "p2", UploadStatus::Pending);
        seed(db.connection(), "p3", UploadStatus::Completed);
        let repo = PhotoRepository::new(db.connection());

        assert_eq!(repo.list_by_status(UploadStatus::Pending).unwrap().len(), 2);
        assert_eq!(
            repo.status_counts().unwrap(),
            vec![("completed".to_string(), 1), ("pending".to_string(), 2)]
        );
    }

    #[test]
    fn list_changed_since_tracks_clock() {
        let db = Database::open_in_memory().unwrap();
        seed(db.connection(), "p1", UploadStatus::Pending);
        let store = SqliteChangeStore::new(db.connection());
        let mark = store.next_db_version().unwrap();
        seed(db.connection(), "p2", UploadStatus::Pending);

        let changed = PhotoRepository::new(db.connection())
            .list_changed_since(mark)
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, "p2");
    }

    #[test]
    fn delete_returns_row_and_drops_clocks() {
        let db = Database::open_in_memory().unwrap();
        seed(db.connection(), "p1", UploadStatus::Completed);
        let repo = PhotoRepository::new(db.connection());

        let deleted = repo.delete("p1").unwrap().unwrap();
        assert_eq!(deleted.id, "p1");
        assert!(repo.get("p1").unwrap().is_none());
        assert!(repo.delete("p1").unwrap().is_none());
        assert!(SqliteChangeStore::new(db.connection())
            .changes_since(0, None)
            .unwrap()
            .is_empty());
    }
}
