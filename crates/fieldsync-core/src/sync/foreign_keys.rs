//! Foreign-key soundness checks for incoming changes.
//!
//! Replication tolerates dangling references, so a failed check only
//! produces a warning. The orphan auditor repairs them later.

use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{PrimaryKey, ValidatedChange};
use crate::schema::Table;

pub struct ForeignKeyChecker<'a> {
    conn: &'a Connection,
    batch_rows: HashSet<(Table, PrimaryKey)>,
}

impl<'a> ForeignKeyChecker<'a> {
    /// Rows touched anywhere in `batch` count as existing parents, since
    /// applying any change materializes its row.
    pub fn new(conn: &'a Connection, batch: &[ValidatedChange]) -> Self {
        let batch_rows = batch
            .iter()
            .map(|change| (change.table, change.pk.clone()))
            .collect();
        Self { conn, batch_rows }
    }

    /// Describe the dangling reference a change would create, if any.
    pub fn check(&self, change: &ValidatedChange) -> Result<Option<String>> {
        let Some(foreign_key) = change.table.foreign_key(change.column_name()) else {
            return Ok(None);
        };
        let SqlValue::Integer(parent_id) = change.value else {
            return Ok(None);
        };
        let parent = PrimaryKey::Integer(parent_id);
        if self
            .batch_rows
            .contains(&(foreign_key.references, parent.clone()))
        {
            return Ok(None);
        }

        let exists = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE id = ?1", foreign_key.references),
                [&parent],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(None);
        }

        tracing::debug!(
            table = %change.table,
            column = foreign_key.column,
            parent = parent_id,
            "Change references a missing parent row"
        );
        Ok(Some(format!(
            "{}.{} references missing {} row {parent_id}",
            change.table, foreign_key.column, foreign_key.references
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::change_fixtures::{change, SITE_A};
    use crate::db::{ChangeStore, Database, SqliteChangeStore};

    fn text(value: &str) -> SqlValue {
        SqlValue::Text(value.into())
    }

    #[test]
    fn warns_on_missing_parent() {
        let db = Database::open_in_memory().unwrap();
        let site = change(
            Table::Sites,
            PrimaryKey::Integer(1),
            "project_id",
            SqlValue::Integer(42),
            1,
            1,
            SITE_A,
        );
        let checker = ForeignKeyChecker::new(db.connection(), std::slice::from_ref(&site));

        let warning = checker.check(&site).unwrap().unwrap();
        assert!(warning.contains("sites.project_id"));
        assert!(warning.contains("projects row 42"));
    }

    #[test]
    fn accepts_committed_and_in_batch_parents() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteChangeStore::new(db.connection());
        store
            .write_local(Table::Projects, &PrimaryKey::Integer(1), &[("name", text("Depot"))])
            .unwrap();

        let committed_parent = change(
            Table::Sites,
            PrimaryKey::Integer(1),
            "project_id",
            SqlValue::Integer(1),
            1,
            1,
            SITE_A,
        );
        let new_project = change(
            Table::Projects,
            PrimaryKey::Integer(2),
            "name",
            text("Yard"),
            1,
            1,
            SITE_A,
        );
        let batch_parent = change(
            Table::Sites,
            PrimaryKey::Integer(2),
            "project_id",
            SqlValue::Integer(2),
            1,
            1,
            SITE_A,
        );
        let batch = vec![committed_parent.clone(), new_project, batch_parent.clone()];
        let checker = ForeignKeyChecker::new(db.connection(), &batch);

        assert_eq!(checker.check(&committed_parent).unwrap(), None);
        assert_eq!(checker.check(&batch_parent).unwrap(), None);
    }

    #[test]
    fn ignores_null_references_and_plain_columns() {
        let db = Database::open_in_memory().unwrap();
        let unlink = change(
            Table::Survey,
            PrimaryKey::Integer(1),
            "template_id",
            SqlValue::Null,
            1,
            1,
            SITE_A,
        );
        let title = change(
            Table::Survey,
            PrimaryKey::Integer(1),
            "title",
            text("Roof"),
            1,
            1,
            SITE_A,
        );
        let checker = ForeignKeyChecker::new(db.connection(), &[]);

        assert_eq!(checker.check(&unlink).unwrap(), None);
        assert_eq!(checker.check(&title).unwrap(), None);
    }
}
