//! SQLite-backed roster, session registry and attendance ledger.

use rollcall_core::attendance::{
    AttendanceLedger, AttendanceStatus, CourseId, Roster, RosterError, SectionId, Session,
    SessionId, SessionRegistry, Student, StudentId,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS students (
        id          INTEGER PRIMARY KEY,
        code        TEXT NOT NULL UNIQUE,
        name        TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS enrollments (
        student_id  INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
        course_id   INTEGER NOT NULL,
        section_id  INTEGER NOT NULL,
        PRIMARY KEY (student_id, course_id, section_id)
    );
    CREATE TABLE IF NOT EXISTS attendance_sessions (
        id          INTEGER PRIMARY KEY,
        course_id   INTEGER NOT NULL,
        section_id  INTEGER,
        closed      INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS attendance (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id  INTEGER NOT NULL REFERENCES attendance_sessions(id) ON DELETE CASCADE,
        student_id  INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
        status      TEXT NOT NULL,
        marked_at   TEXT NOT NULL,
        UNIQUE (session_id, student_id)
    );
    CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id, section_id);
";

/// One connection per owner; stream threads each open their own.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database and its schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "database opened");
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }
}

fn backend(e: rusqlite::Error) -> RosterError {
    RosterError::Backend(Box::new(e))
}

fn student_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
    })
}

impl Roster for SqliteStore {
    fn student_by_code(&self, code: &str) -> Result<Option<Student>, RosterError> {
        self.conn
            .query_row(
                "SELECT id, code, name FROM students WHERE code = ?1",
                [code],
                student_from_row,
            )
            .optional()
            .map_err(backend)
    }

    fn is_enrolled(
        &self,
        student: StudentId,
        course: CourseId,
        section: Option<SectionId>,
    ) -> Result<bool, RosterError> {
        self.conn
            .query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM enrollments
                     WHERE student_id = ?1 AND course_id = ?2
                       AND (?3 IS NULL OR section_id = ?3)
                 )",
                params![student, course, section],
                |row| row.get(0),
            )
            .map_err(backend)
    }

    fn enrolled_students(
        &self,
        course: CourseId,
        section: Option<SectionId>,
    ) -> Result<Vec<Student>, RosterError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT s.id, s.code, s.name
                 FROM students s JOIN enrollments e ON e.student_id = s.id
                 WHERE e.course_id = ?1 AND (?2 IS NULL OR e.section_id = ?2)
                 ORDER BY s.name",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![course, section], student_from_row)
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}

impl SessionRegistry for SqliteStore {
    fn session(&self, id: SessionId) -> Result<Option<Session>, RosterError> {
        self.conn
            .query_row(
                "SELECT id, course_id, section_id, closed FROM attendance_sessions WHERE id = ?1",
                [id],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        course_id: row.get(1)?,
                        section_id: row.get(2)?,
                        closed: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(backend)
    }
}

impl AttendanceLedger for SqliteStore {
    fn insert_if_absent(
        &self,
        session: SessionId,
        student: StudentId,
        status: AttendanceStatus,
    ) -> Result<bool, RosterError> {
        let written = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO attendance (session_id, student_id, status, marked_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session, student, status.as_str(), chrono::Utc::now().to_rfc3339()],
            )
            .map_err(backend)?;
        Ok(written == 1)
    }

    fn students_with_status(
        &self,
        session: SessionId,
        status: AttendanceStatus,
    ) -> Result<Vec<StudentId>, RosterError> {
        let mut stmt = self
            .conn
            .prepare("SELECT student_id FROM attendance WHERE session_id = ?1 AND status = ?2")
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![session, status.as_str()], |row| row.get(0))
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }
}

/// Fixture helpers; rows are otherwise written by the school's own tooling.
#[cfg(test)]
impl SqliteStore {
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    pub fn add_student(&self, id: StudentId, code: &str, name: &str) {
        self.conn
            .execute(
                "INSERT INTO students (id, code, name) VALUES (?1, ?2, ?3)",
                params![id, code, name],
            )
            .unwrap();
    }

    pub fn enroll(&self, student: StudentId, course: CourseId, section: SectionId) {
        self.conn
            .execute(
                "INSERT INTO enrollments (student_id, course_id, section_id) VALUES (?1, ?2, ?3)",
                params![student, course, section],
            )
            .unwrap();
    }

    pub fn add_session(&self, id: SessionId, course: CourseId, section: Option<SectionId>) {
        self.conn
            .execute(
                "INSERT INTO attendance_sessions (id, course_id, section_id) VALUES (?1, ?2, ?3)",
                params![id, course, section],
            )
            .unwrap();
    }

    pub fn close_session(&self, id: SessionId) {
        self.conn
            .execute("UPDATE attendance_sessions SET closed = 1 WHERE id = ?1", [id])
            .unwrap();
    }
}
