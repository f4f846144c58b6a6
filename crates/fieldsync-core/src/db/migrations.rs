//! Database migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &mut Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, MIGRATION_V1)?;
    }
    if version < 2 {
        apply(conn, 2, MIGRATION_V2)?;
    }
    if version < 3 {
        apply(conn, 3, MIGRATION_V3)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Run one migration atomically and record its version.
fn apply(conn: &mut Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.transaction()?;
    for stmt in statements {
        tx.execute_batch(stmt)?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    tx.commit()?;

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Version 1: replicated tables.
///
/// No `REFERENCES` clauses: replication may deliver children before parents,
/// referential integrity is repaired by the orphan auditor. Every column has
/// a default so a row can be materialized from a single column change.
const MIGRATION_V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS projects (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT DEFAULT '',
        description TEXT DEFAULT '',
        status TEXT DEFAULT 'draft',
        client_info TEXT DEFAULT '',
        due_date INTEGER,
        priority TEXT DEFAULT 'medium',
        created_at INTEGER DEFAULT 0,
        updated_at INTEGER DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS sites (
        id INTEGER PRIMARY KEY NOT NULL,
        project_id INTEGER,
        name TEXT DEFAULT 'Untitled',
        address TEXT DEFAULT '',
        latitude REAL DEFAULT 0.0,
        longitude REAL DEFAULT 0.0,
        notes TEXT DEFAULT '',
        created_at INTEGER DEFAULT 0,
        updated_at INTEGER DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_sites_project_id ON sites(project_id)",
    "CREATE TABLE IF NOT EXISTS survey (
        id INTEGER PRIMARY KEY NOT NULL,
        site_id INTEGER,
        template_id INTEGER,
        title TEXT DEFAULT 'Untitled Survey',
        description TEXT DEFAULT '',
        status TEXT DEFAULT 'draft',
        created_at INTEGER DEFAULT 0,
        updated_at INTEGER DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_survey_site_id ON survey(site_id)",
    "CREATE INDEX IF NOT EXISTS idx_survey_template_id ON survey(template_id)",
    "CREATE TABLE IF NOT EXISTS survey_response (
        id INTEGER PRIMARY KEY NOT NULL,
        survey_id INTEGER,
        question_id INTEGER,
        question TEXT DEFAULT '',
        answer TEXT DEFAULT '',
        response_type TEXT DEFAULT '',
        field_type TEXT DEFAULT '',
        latitude REAL DEFAULT 0.0,
        longitude REAL DEFAULT 0.0,
        created_at INTEGER DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_response_survey_question
        ON survey_response(survey_id, question_id)",
    "CREATE TABLE IF NOT EXISTS survey_template (
        id INTEGER PRIMARY KEY NOT NULL,
        name TEXT DEFAULT 'Untitled Template',
        description TEXT DEFAULT '',
        category TEXT DEFAULT '',
        is_default INTEGER DEFAULT 0,
        section_tags TEXT DEFAULT '{}',
        created_at INTEGER DEFAULT 0,
        updated_at INTEGER DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS template_field (
        id INTEGER PRIMARY KEY NOT NULL,
        template_id INTEGER,
        field_type TEXT DEFAULT '',
        question TEXT DEFAULT '',
        description TEXT DEFAULT '',
        required INTEGER DEFAULT 0,
        options TEXT DEFAULT '',
        order_index INTEGER DEFAULT 0,
        section TEXT DEFAULT '',
        section_weight INTEGER DEFAULT 1,
        conditions TEXT DEFAULT '',
        photo_requirements TEXT DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_template_field_order
        ON template_field(template_id, order_index)",
    "CREATE TABLE IF NOT EXISTS photo (
        id TEXT PRIMARY KEY NOT NULL,
        survey_id INTEGER,
        site_id INTEGER,
        question_id INTEGER,
        cloud_url TEXT DEFAULT '',
        thumbnail_url TEXT DEFAULT '',
        upload_status TEXT DEFAULT 'pending',
        retry_count INTEGER DEFAULT 0,
        last_retry_at INTEGER,
        latitude REAL DEFAULT 0.0,
        longitude REAL DEFAULT 0.0,
        description TEXT DEFAULT '',
        category TEXT DEFAULT 'general',
        section TEXT DEFAULT '',
        created_at INTEGER DEFAULT 0,
        hash_algo TEXT DEFAULT 'sha256',
        hash_value TEXT DEFAULT '',
        size_bytes INTEGER DEFAULT 0,
        file_path TEXT DEFAULT '',
        requirement_id TEXT DEFAULT '',
        fulfills_requirement INTEGER DEFAULT 0,
        tags TEXT DEFAULT '[]',
        corrupted INTEGER DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_photo_survey_site ON photo(survey_id, site_id)",
    "CREATE INDEX IF NOT EXISTS idx_photo_upload_status ON photo(upload_status)",
    "CREATE INDEX IF NOT EXISTS idx_photo_hash_value ON photo(hash_value)",
];

/// Version 2: change log, column clocks and replication metadata.
///
/// `val` columns are untyped so stored values keep the type they arrived with.
const MIGRATION_V2: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS crdt_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS crdt_clock (
        tbl TEXT NOT NULL,
        pk TEXT NOT NULL,
        cid TEXT NOT NULL,
        val,
        col_version INTEGER NOT NULL,
        db_version INTEGER NOT NULL,
        origin_db_version INTEGER NOT NULL,
        site_id TEXT NOT NULL,
        PRIMARY KEY (tbl, pk, cid)
    )",
    "CREATE INDEX IF NOT EXISTS idx_crdt_clock_db_version ON crdt_clock(db_version)",
    "CREATE TABLE IF NOT EXISTS crdt_changes (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        tbl TEXT NOT NULL,
        pk TEXT NOT NULL,
        cid TEXT NOT NULL,
        val,
        col_version INTEGER NOT NULL,
        db_version INTEGER NOT NULL,
        site_id TEXT NOT NULL,
        received_at INTEGER NOT NULL,
        UNIQUE (tbl, pk, cid, col_version, db_version, site_id)
    )",
];

/// Version 3: append-only conflict audit.
const MIGRATION_V3: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS crdt_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tbl TEXT NOT NULL,
        pk TEXT NOT NULL,
        cid TEXT NOT NULL,
        lost_value TEXT,
        winning_value TEXT,
        origin_site_id TEXT NOT NULL,
        resolution_strategy TEXT NOT NULL,
        recorded_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_crdt_conflicts_recorded_at
        ON crdt_conflicts(recorded_at DESC)",
    "CREATE TRIGGER IF NOT EXISTS crdt_conflicts_no_update BEFORE UPDATE ON crdt_conflicts
     BEGIN
         SELECT RAISE(ABORT, 'crdt_conflicts is append-only');
     END",
    "CREATE TRIGGER IF NOT EXISTS crdt_conflicts_no_delete BEFORE DELETE ON crdt_conflicts
     BEGIN
         SELECT RAISE(ABORT, 'crdt_conflicts is append-only');
     END",
];
