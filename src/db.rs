use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DB_FILE_NAME: &str = "timetable.sqlite3";

pub fn db_path(workspace: &Path) -> PathBuf {
    workspace.join(DB_FILE_NAME)
}

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let conn = Connection::open(db_path(workspace))?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    ensure_schema(&conn)?;
    info!(workspace = %workspace.to_string_lossy(), "database opened");
    Ok(conn)
}

/// Creates every application table that is missing. Safe to run repeatedly, including
/// right after a full schema reset.
pub fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            kakao_id TEXT NOT NULL UNIQUE,
            nickname TEXT NOT NULL,
            grade INTEGER,
            class_no INTEGER,
            role TEXT NOT NULL DEFAULT 'student',
            banned INTEGER NOT NULL DEFAULT 0,
            ban_reason TEXT,
            created_at TEXT NOT NULL,
            last_seen_at TEXT
        )",
        [],
    )?;
    ensure_users_last_seen_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_class ON users(grade, class_no)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS banned_ips(
            ip TEXT PRIMARY KEY,
            reason TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS access_logs(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ip TEXT NOT NULL,
            user_id TEXT,
            path TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_access_logs_created ON access_logs(created_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_access_logs_ip ON access_logs(ip)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_slots(
            grade INTEGER NOT NULL,
            class_no INTEGER NOT NULL,
            weekday INTEGER NOT NULL,
            period INTEGER NOT NULL,
            subject TEXT NOT NULL,
            teacher TEXT,
            updated_at TEXT,
            PRIMARY KEY(grade, class_no, weekday, period)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            grade INTEGER NOT NULL,
            class_no INTEGER NOT NULL,
            subject TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            due_date TEXT NOT NULL,
            created_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(created_by) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_class_due ON assessments(grade, class_no, due_date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_checks(
            assessment_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            done INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            PRIMARY KEY(assessment_id, user_id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_checks_user ON assessment_checks(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_users_last_seen_at(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate activity tracking.
    if table_has_column(conn, "users", "last_seen_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN last_seen_at TEXT", [])?;
    Ok(())
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("setting {key} is not valid JSON"))?,
        )),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
