use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("roster.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            max_students INTEGER NOT NULL DEFAULT 30,
            student_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE(code, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_grade_year ON classes(grade_level, academic_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            class_id TEXT,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_students_updated_at(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_status ON students(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            enrollment_date TEXT NOT NULL,
            status TEXT NOT NULL,
            notes TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_enrollments_notes(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_class_year ON enrollments(class_id, academic_year)",
        [],
    )?;
    // One live (pending or approved) enrollment per student per year. The
    // handlers check this first for a clean conflict message; the index is
    // the backstop under concurrent writers.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_live
         ON enrollments(student_id, academic_year)
         WHERE status IN ('pending', 'approved')",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            actor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            resource_kind TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            details TEXT,
            logged_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_resource ON audit_log(resource_kind, resource_id)",
        [],
    )?;

    // Occupancy counters are derived state; recompute from the approved rows
    // so a crash mid-batch can never leave them drifted across restarts.
    reconcile_student_counts(conn)?;

    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_enrollments_notes(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "enrollments", "notes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE enrollments ADD COLUMN notes TEXT", [])?;
    Ok(())
}

pub fn reconcile_student_counts(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE classes SET student_count = (
            SELECT COUNT(*) FROM enrollments e
            WHERE e.class_id = classes.id
              AND e.academic_year = classes.academic_year
              AND e.status = 'approved'
         )",
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
