use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculties(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            city TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS study_programs(
            id TEXT PRIMARY KEY,
            faculty_id TEXT NOT NULL,
            name TEXT NOT NULL,
            degree TEXT NOT NULL,
            duration_semesters INTEGER NOT NULL,
            FOREIGN KEY(faculty_id) REFERENCES faculties(id),
            UNIQUE(faculty_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_study_programs_faculty ON study_programs(faculty_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            study_program_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            semester INTEGER NOT NULL,
            ects INTEGER NOT NULL,
            FOREIGN KEY(study_program_id) REFERENCES study_programs(id),
            UNIQUE(study_program_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_program ON subjects(study_program_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS syllabus_sections(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(subject_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_syllabus_sections_subject ON syllabus_sections(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            index_no TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            email TEXT,
            study_program_id TEXT NOT NULL,
            enrollment_year INTEGER NOT NULL,
            active INTEGER NOT NULL,
            FOREIGN KEY(study_program_id) REFERENCES study_programs(id)
        )",
        [],
    )?;
    // Existing workspaces may have a students table without email. Add if needed.
    ensure_students_email(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_program ON students(study_program_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            created_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, academic_year)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_subject ON enrollments(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_registrations(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            exam_period TEXT NOT NULL,
            registered_at TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            UNIQUE(enrollment_id, exam_period)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_registrations_enrollment
         ON exam_registrations(enrollment_id)",
        [],
    )?;

    // Stores the submitted component scores next to the derived result so a
    // sheet or transcript never recomputes from partial data.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            registration_id TEXT NOT NULL UNIQUE,
            midterm1 REAL NOT NULL,
            midterm2 REAL NOT NULL,
            final_exam REAL NOT NULL,
            attendance REAL NOT NULL,
            exam_points REAL NOT NULL,
            attendance_bonus REAL NOT NULL,
            total_points REAL NOT NULL,
            grade INTEGER NOT NULL,
            passed INTEGER NOT NULL,
            graded_at TEXT,
            FOREIGN KEY(registration_id) REFERENCES exam_registrations(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS requests(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL,
            response TEXT,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_requests_response(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_requests_student ON requests(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS library_items(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT,
            inventory_code TEXT UNIQUE,
            copies INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS library_loans(
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            issued_on TEXT NOT NULL,
            due_on TEXT NOT NULL,
            returned_on TEXT,
            FOREIGN KEY(item_id) REFERENCES library_items(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_library_loans_item ON library_loans(item_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_library_loans_student ON library_loans(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS inventory_items(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            location TEXT,
            quantity INTEGER NOT NULL
        )",
        [],
    )?;
    ensure_inventory_items_location(&conn)?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS inventory_assignments(
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            assigned_to TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            assigned_on TEXT NOT NULL,
            returned_on TEXT,
            FOREIGN KEY(item_id) REFERENCES inventory_items(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_inventory_assignments_item
         ON inventory_assignments(item_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_email(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "email")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN email TEXT", [])?;
    Ok(())
}

fn ensure_requests_response(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "requests", "response")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE requests ADD COLUMN response TEXT", [])?;
    Ok(())
}

fn ensure_inventory_items_location(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "inventory_items", "location")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE inventory_items ADD COLUMN location TEXT", [])?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
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
