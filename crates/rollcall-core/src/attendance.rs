//! Attendance policy: collaborator contracts, cooldown gate, marking rules and
//! the presence report.
//!
//! The roster, session registry and ledger are owned by the surrounding
//! application; the core only reads the first two and inserts into the third.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;

pub type StudentId = i64;
pub type SessionId = i64;
pub type CourseId = i64;
pub type SectionId = i64;

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("attendance backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Student {
    pub id: StudentId,
    /// Identity code, the directory name in the dataset.
    pub code: String,
    pub name: String,
}

impl Student {
    /// "Name (code)", as shown on frames and in presence lists.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.name, self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub course_id: CourseId,
    /// `None` accepts students from any section of the course.
    pub section_id: Option<SectionId>,
    pub closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }
}

pub trait Roster {
    fn student_by_code(&self, code: &str) -> Result<Option<Student>, RosterError>;

    /// A `None` section matches enrollment in any section of the course.
    fn is_enrolled(
        &self,
        student: StudentId,
        course: CourseId,
        section: Option<SectionId>,
    ) -> Result<bool, RosterError>;

    fn enrolled_students(
        &self,
        course: CourseId,
        section: Option<SectionId>,
    ) -> Result<Vec<Student>, RosterError>;
}

pub trait SessionRegistry {
    fn session(&self, id: SessionId) -> Result<Option<Session>, RosterError>;
}

pub trait AttendanceLedger {
    /// Insert a row unless one exists for `(session, student)`.
    /// Returns whether a row was written.
    fn insert_if_absent(
        &self,
        session: SessionId,
        student: StudentId,
        status: AttendanceStatus,
    ) -> Result<bool, RosterError>;

    fn students_with_status(
        &self,
        session: SessionId,
        status: AttendanceStatus,
    ) -> Result<Vec<StudentId>, RosterError>;
}

/// Everything a recognition stream needs from the outside world.
pub trait AttendanceBackend: Roster + SessionRegistry + AttendanceLedger {}

impl<T: Roster + SessionRegistry + AttendanceLedger + ?Sized> AttendanceBackend for T {}

/// Per-stream record of each student's last accepted recognition.
#[derive(Debug)]
pub struct CooldownStore {
    window: Duration,
    last: HashMap<StudentId, Instant>,
}

impl CooldownStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: HashMap::new(),
        }
    }

    /// True when the student has no entry or the window has elapsed.
    pub fn admit(&self, student: StudentId, now: Instant) -> bool {
        match self.last.get(&student) {
            Some(&prev) => now.saturating_duration_since(prev) > self.window,
            None => true,
        }
    }

    /// Start a new window for `student` at `now`.
    pub fn record(&mut self, student: StudentId, now: Instant) {
        self.last.insert(student, now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkOutcome {
    Recorded,
    AlreadyPresent,
    CoolingDown,
    NotEnrolled,
    SessionClosed,
    SessionMissing,
}

/// Turns accepted recognitions into at most one "present" row per student.
#[derive(Debug)]
pub struct AttendanceMarker {
    session: SessionId,
    cooldown: CooldownStore,
    mark_closed_sessions: bool,
}

impl AttendanceMarker {
    pub fn new(session: SessionId, cooldown: Duration, mark_closed_sessions: bool) -> Self {
        Self {
            session,
            cooldown: CooldownStore::new(cooldown),
            mark_closed_sessions,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Gate, then re-read the session (it may have closed mid-stream), check
    /// enrollment and insert. The cooldown window only restarts once the
    /// student holds a row for the session; refusals and backend errors leave
    /// it untouched so the next sighting retries.
    pub fn mark<B: AttendanceBackend + ?Sized>(
        &mut self,
        backend: &B,
        student: &Student,
        now: Instant,
    ) -> Result<MarkOutcome, RosterError> {
        if !self.cooldown.admit(student.id, now) {
            return Ok(MarkOutcome::CoolingDown);
        }

        let Some(session) = backend.session(self.session)? else {
            return Ok(MarkOutcome::SessionMissing);
        };
        if session.closed && !self.mark_closed_sessions {
            return Ok(MarkOutcome::SessionClosed);
        }
        if !backend.is_enrolled(student.id, session.course_id, session.section_id)? {
            return Ok(MarkOutcome::NotEnrolled);
        }

        let written = backend.insert_if_absent(session.id, student.id, AttendanceStatus::Present)?;
        self.cooldown.record(student.id, now);
        let outcome = if written {
            MarkOutcome::Recorded
        } else {
            MarkOutcome::AlreadyPresent
        };
        tracing::info!(
            session = session.id,
            student = %student.code,
            ?outcome,
            "attendance mark"
        );
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceReport {
    pub present_names: Vec<String>,
    pub remaining_names: Vec<String>,
}

/// Split the session's enrolled students into present and remaining.
/// `None` when the session does not exist.
pub fn presence<B: AttendanceBackend + ?Sized>(
    backend: &B,
    session_id: SessionId,
) -> Result<Option<PresenceReport>, RosterError> {
    let Some(session) = backend.session(session_id)? else {
        return Ok(None);
    };

    let present: HashSet<StudentId> = backend
        .students_with_status(session_id, AttendanceStatus::Present)?
        .into_iter()
        .collect();

    let mut report = PresenceReport::default();
    for student in backend.enrolled_students(session.course_id, session.section_id)? {
        let label = student.display_name();
        if present.contains(&student.id) {
            report.present_names.push(label);
        } else {
            report.remaining_names.push(label);
        }
    }
    Ok(Some(report))
}
