//! rollcall-core — face capture, training and recognition for attendance.
//!
//! Uses SCRFD (via ONNX Runtime) for face detection and a local binary
//! pattern histogram classifier for recognition. Attendance storage is
//! reached through the traits in [`attendance`].

pub mod annotate;
pub mod artifact;
pub mod attendance;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod lbph;
pub mod normalize;
pub mod stream;
pub mod trainer;
pub mod types;

#[cfg(test)]
mod testing;

pub use attendance::{
    AttendanceBackend, AttendanceLedger, AttendanceMarker, AttendanceStatus, MarkOutcome,
    PresenceReport, Roster, RosterError, Session, SessionRegistry, Student,
};
pub use config::{Config, ConfigError};
pub use dataset::{DatasetBuilder, DatasetError, UploadItem, UploadOutcome, UploadSummary};
pub use detector::{DetectionParams, Detector, DetectorError, ScrfdDetector};
pub use lbph::{FaceClassifier, LbphParams, LbphRecognizer, TrainingEngine};
pub use normalize::Normalizer;
pub use stream::RecognitionStream;
pub use trainer::{DatasetReport, Trainer, TrainingError, TrainingSummary};
pub use types::{FaceBox, FaceSample, LabelMap, Prediction, SampleSize};
