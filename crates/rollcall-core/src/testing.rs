//! Hand-written fakes shared by the unit tests.

use crate::attendance::{
    AttendanceLedger, AttendanceStatus, CourseId, Roster, RosterError, SectionId, Session,
    SessionId, SessionRegistry, Student, StudentId,
};
use crate::detector::{Detector, DetectorError};
use crate::lbph::{FaceClassifier, LbphError};
use crate::types::{FaceBox, FaceSample, Prediction};
use image::{GrayImage, ImageFormat, RgbImage};
use rollcall_hw::{CameraError, CaptureDevice, Frame};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Cursor;

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Plays back a scripted sequence of frames and read failures.
pub struct FakeCamera {
    script: VecDeque<Result<RgbImage, ()>>,
    repeat: Option<RgbImage>,
    sequence: u32,
}

impl FakeCamera {
    pub fn new(script: Vec<Result<RgbImage, ()>>) -> Self {
        Self {
            script: script.into(),
            repeat: None,
            sequence: 0,
        }
    }

    pub fn repeating(image: RgbImage) -> Self {
        Self {
            script: VecDeque::new(),
            repeat: Some(image),
            sequence: 0,
        }
    }

    pub fn broken() -> Self {
        Self::new(Vec::new())
    }
}

impl CaptureDevice for FakeCamera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.sequence += 1;
        let next = match self.script.pop_front() {
            Some(step) => step,
            None => self.repeat.clone().ok_or(()),
        };
        next.map(|img| Frame::new(img, self.sequence))
            .map_err(|_| CameraError::CaptureFailed("scripted failure".into()))
    }

    fn describe(&self) -> String {
        "fake camera".into()
    }
}

/// Returns scripted detections call by call, then either repeats the last
/// entry (`always`) or returns nothing.
pub struct FixedDetector {
    script: VecDeque<Vec<FaceBox>>,
    repeat: Option<Vec<FaceBox>>,
    fail: bool,
    pub min_sizes: Vec<Option<u32>>,
}

impl FixedDetector {
    pub fn face(x: u32, y: u32, w: u32, h: u32) -> FaceBox {
        FaceBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            neighbors: 3,
        }
    }

    pub fn script(script: Vec<Vec<FaceBox>>) -> Self {
        Self {
            script: script.into(),
            repeat: None,
            fail: false,
            min_sizes: Vec::new(),
        }
    }

    pub fn always(faces: Vec<FaceBox>) -> Self {
        Self {
            repeat: Some(faces),
            ..Self::script(Vec::new())
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::script(Vec::new())
        }
    }
}

impl Detector for FixedDetector {
    fn detect(
        &mut self,
        _gray: &GrayImage,
        min_size: Option<u32>,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        self.min_sizes.push(min_size);
        if self.fail {
            return Err(DetectorError::InferenceFailed("scripted failure".into()));
        }
        Ok(self
            .script
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or_default())
    }
}

/// Always predicts the same thing, or always fails.
pub struct FixedClassifier(pub Option<Prediction>);

impl FaceClassifier for FixedClassifier {
    fn predict(&self, _sample: &FaceSample) -> Result<Prediction, LbphError> {
        self.0.ok_or(LbphError::NotTrained)
    }
}

/// In-memory roster, session registry and ledger.
#[derive(Default)]
pub struct MemoryBackend {
    students: Vec<Student>,
    enrollments: Vec<(StudentId, CourseId, SectionId)>,
    sessions: HashMap<SessionId, Session>,
    marks: RefCell<BTreeMap<(SessionId, StudentId), AttendanceStatus>>,
    pub fail: bool,
}

impl MemoryBackend {
    pub fn add_student(&mut self, id: StudentId, code: &str, name: &str) {
        self.students.push(Student {
            id,
            code: code.into(),
            name: name.into(),
        });
    }

    pub fn enroll(&mut self, student: StudentId, course: CourseId, section: SectionId) {
        self.enrollments.push((student, course, section));
    }

    pub fn add_session(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn close_session(&mut self, id: SessionId) {
        if let Some(s) = self.sessions.get_mut(&id) {
            s.closed = true;
        }
    }

    pub fn student(&self, id: StudentId) -> Student {
        self.students.iter().find(|s| s.id == id).cloned().unwrap()
    }

    pub fn marks(&self) -> BTreeMap<(SessionId, StudentId), AttendanceStatus> {
        self.marks.borrow().clone()
    }

    fn check(&self) -> Result<(), RosterError> {
        if self.fail {
            return Err(RosterError::Backend("backend offline".into()));
        }
        Ok(())
    }
}

impl Roster for MemoryBackend {
    fn student_by_code(&self, code: &str) -> Result<Option<Student>, RosterError> {
        self.check()?;
        Ok(self.students.iter().find(|s| s.code == code).cloned())
    }

    fn is_enrolled(
        &self,
        student: StudentId,
        course: CourseId,
        section: Option<SectionId>,
    ) -> Result<bool, RosterError> {
        self.check()?;
        Ok(self
            .enrollments
            .iter()
            .any(|&(s, c, sec)| s == student && c == course && section.map_or(true, |want| want == sec)))
    }

    fn enrolled_students(
        &self,
        course: CourseId,
        section: Option<SectionId>,
    ) -> Result<Vec<Student>, RosterError> {
        self.check()?;
        let mut out: Vec<Student> = self
            .students
            .iter()
            .filter(|st| self.is_enrolled(st.id, course, section).unwrap_or(false))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

impl SessionRegistry for MemoryBackend {
    fn session(&self, id: SessionId) -> Result<Option<Session>, RosterError> {
        self.check()?;
        Ok(self.sessions.get(&id).copied())
    }
}

impl AttendanceLedger for MemoryBackend {
    fn insert_if_absent(
        &self,
        session: SessionId,
        student: StudentId,
        status: AttendanceStatus,
    ) -> Result<bool, RosterError> {
        self.check()?;
        let mut marks = self.marks.borrow_mut();
        if marks.contains_key(&(session, student)) {
            return Ok(false);
        }
        marks.insert((session, student), status);
        Ok(true)
    }

    fn students_with_status(
        &self,
        session: SessionId,
        status: AttendanceStatus,
    ) -> Result<Vec<StudentId>, RosterError> {
        self.check()?;
        Ok(self
            .marks
            .borrow()
            .iter()
            .filter(|(&(s, _), &st)| s == session && st == status)
            .map(|(&(_, student), _)| student)
            .collect())
    }
}
