use rusqlite::Connection;
use std::path::Path;

/// Opens (and creates as needed) the workspace database. The tables mirror
/// the document layout of the hosted deployment: a singleton global config,
/// per-term subtrees for groups/students/days/records/notices, per-identity
/// user docs, plus the local identity-provider and device-preference state.
pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("attend.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS global_config(
            id INTEGER PRIMARY KEY CHECK(id = 1),
            system_enabled INTEGER NOT NULL,
            current_term_id TEXT NOT NULL,
            global_epoch INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS admin_emails(
            email TEXT PRIMARY KEY
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            term_id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            term_id TEXT NOT NULL,
            id TEXT NOT NULL,
            name TEXT NOT NULL,
            ord INTEGER NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(term_id, id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            term_id TEXT NOT NULL,
            no4 TEXT NOT NULL,
            email TEXT NOT NULL,
            group_id TEXT NOT NULL,
            active INTEGER NOT NULL,
            uid TEXT,
            must_logout_epoch INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(term_id, no4)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_term_group ON students(term_id, group_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS days(
            term_id TEXT NOT NULL,
            date_id TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(term_id, date_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            term_id TEXT NOT NULL,
            date_id TEXT NOT NULL,
            no4 TEXT NOT NULL,
            status TEXT NOT NULL,
            note TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY(term_id, date_id, no4)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_term_day ON attendance_records(term_id, date_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notices(
            id TEXT PRIMARY KEY,
            term_id TEXT NOT NULL,
            title TEXT,
            body TEXT,
            text TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notices_term ON notices(term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS user_docs(
            uid TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            term_id TEXT NOT NULL,
            no4 TEXT NOT NULL,
            group_id TEXT NOT NULL,
            must_logout_epoch INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS auth_accounts(
            uid TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            pass_salt TEXT NOT NULL,
            pass_hash TEXT NOT NULL,
            disabled INTEGER NOT NULL DEFAULT 0,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS password_resets(
            token TEXT PRIMARY KEY,
            uid TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS device_prefs(
            device_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY(device_id, key)
        )",
        [],
    )?;

    // Early workspaces predate the per-student kick column. Add if needed.
    ensure_students_must_logout_epoch(&conn)?;

    Ok(conn)
}

fn ensure_students_must_logout_epoch(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "must_logout_epoch")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN must_logout_epoch INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
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
