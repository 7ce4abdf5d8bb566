use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

pub const DB_FILE: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    // Older workspaces only stored a display name per class.
    ensure_classes_label_columns(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff(
            id TEXT PRIMARY KEY,
            employee_no TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            middle_name TEXT,
            last_name TEXT NOT NULL,
            email TEXT UNIQUE,
            phone TEXT,
            gender TEXT,
            role TEXT NOT NULL,
            date_joined TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            admission_no TEXT NOT NULL UNIQUE,
            first_name TEXT NOT NULL,
            middle_name TEXT,
            last_name TEXT NOT NULL,
            gender TEXT NOT NULL,
            date_of_birth TEXT,
            email TEXT UNIQUE,
            guardian_phone TEXT,
            class_id TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_questions(
            id TEXT PRIMARY KEY,
            question_code TEXT NOT NULL UNIQUE,
            subject_id TEXT NOT NULL,
            class_id TEXT,
            question_type TEXT NOT NULL,
            difficulty TEXT,
            marks REAL NOT NULL,
            question_text TEXT NOT NULL,
            correct_answer TEXT,
            updated_at TEXT,
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_questions_subject ON exam_questions(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS staff_subjects(
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(staff_id) REFERENCES staff(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(staff_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_staff_subjects_staff ON staff_subjects(staff_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_runs(
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            mode TEXT NOT NULL,
            source_name TEXT,
            source_sha256 TEXT NOT NULL,
            rows_total INTEGER NOT NULL,
            created INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            links_created INTEGER NOT NULL,
            finished_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_runs_entity ON import_runs(entity_type, finished_at)",
        [],
    )?;

    Ok(())
}

fn ensure_classes_label_columns(conn: &Connection) -> anyhow::Result<()> {
    for column in ["code", "level", "stream", "updated_at"] {
        if !table_has_column(conn, "classes", column)? {
            conn.execute(&format!("ALTER TABLE classes ADD COLUMN {} TEXT", column), [])?;
        }
    }
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    Ok(table_columns(conn, table)?.iter().any(|c| c == column))
}

pub fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row.get::<_, String>(1)?);
    }
    Ok(out)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("malformed setting {}", key))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ImportRun<'a> {
    pub entity_type: &'a str,
    pub mode: &'a str,
    pub source_name: Option<&'a str>,
    pub source_sha256: &'a str,
    pub rows_total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub links_created: usize,
}

pub fn record_import_run(conn: &Connection, run: &ImportRun<'_>) -> anyhow::Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO import_runs(id, entity_type, mode, source_name, source_sha256, rows_total,
                                 created, updated, skipped, failed, links_created, finished_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            run.entity_type,
            run.mode,
            run.source_name,
            run.source_sha256,
            run.rows_total as i64,
            run.created as i64,
            run.updated as i64,
            run.skipped as i64,
            run.failed as i64,
            run.links_created as i64,
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .context("failed to record import run")?;
    Ok(id)
}

pub fn list_import_runs(
    conn: &Connection,
    entity_type: Option<&str>,
    limit: usize,
) -> anyhow::Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, mode, source_name, source_sha256, rows_total,
                created, updated, skipped, failed, links_created, finished_at
         FROM import_runs
         WHERE ?1 IS NULL OR entity_type = ?1
         ORDER BY finished_at DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map((entity_type, limit as i64), |r| {
            Ok(serde_json::json!({
                "id": r.get::<_, String>(0)?,
                "entityType": r.get::<_, String>(1)?,
                "mode": r.get::<_, String>(2)?,
                "sourceName": r.get::<_, Option<String>>(3)?,
                "sourceSha256": r.get::<_, String>(4)?,
                "rowsTotal": r.get::<_, i64>(5)?,
                "created": r.get::<_, i64>(6)?,
                "updated": r.get::<_, i64>(7)?,
                "skipped": r.get::<_, i64>(8)?,
                "failed": r.get::<_, i64>(9)?,
                "linksCreated": r.get::<_, i64>(10)?,
                "finishedAt": r.get::<_, String>(11)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
