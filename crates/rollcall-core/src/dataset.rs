//! Dataset builder: guided three-pose capture and bulk upload ingestion.
//!
//! Layout: `<root>/<identity_code>/<millis>.png`, every file a canonical
//! sample written by the [`Normalizer`].

use crate::detector::Detector;
use crate::normalize::{crop, prepare_frame, to_gray, Normalizer};
use crate::types::{largest_face, FaceBox, FaceSample};
use image::{GrayImage, ImageFormat};
use rollcall_hw::{CameraError, CaptureDevice, Frame};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("invalid identity code {0:?}")]
    InvalidIdentity(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write sample {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// One step of the guided capture script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pose {
    pub name: &'static str,
    pub prompt: &'static str,
}

pub const POSES: [Pose; 3] = [
    Pose {
        name: "front",
        prompt: "Look straight ahead.",
    },
    Pose {
        name: "left",
        prompt: "Turn your head slightly LEFT.",
    },
    Pose {
        name: "right",
        prompt: "Turn your head slightly RIGHT.",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureControl {
    Continue,
    Cancel,
}

/// Receives progress from [`DatasetBuilder::capture_guided`]. Every callback
/// may cancel the capture.
pub trait CaptureObserver {
    fn pose(&mut self, _index: usize, _pose: &Pose) -> CaptureControl {
        CaptureControl::Continue
    }

    fn frame(&mut self, _frame: &Frame, _faces: &[FaceBox]) -> CaptureControl {
        CaptureControl::Continue
    }

    fn read_failed(&mut self, _error: &CameraError) -> CaptureControl {
        CaptureControl::Continue
    }

    fn saved(&mut self, _path: &Path) -> CaptureControl {
        CaptureControl::Continue
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureReport {
    pub saved: usize,
    pub paths: Vec<PathBuf>,
    pub cancelled: bool,
}

/// A raw upload: file contents plus the name shown in the summary.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Undecodable,
    NoFace,
    InvalidImage,
    DetectorFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Saved(PathBuf),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadSummary {
    pub saved: usize,
    pub skipped: usize,
    pub items: Vec<(String, UploadOutcome)>,
}

/// Identity directories under `root`, sorted by code.
pub fn list_identities(root: &Path) -> Result<Vec<(String, PathBuf)>, DatasetError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(root).map_err(|source| DatasetError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut identities: Vec<(String, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let code = e.file_name().to_str()?.to_string();
            Some((code, e.path()))
        })
        .collect();
    identities.sort();
    Ok(identities)
}

/// Image files in `dir` with one of `extensions` (case-insensitive), sorted.
pub fn list_samples(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, DatasetError> {
    let entries = fs::read_dir(dir).map_err(|source| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
        })
        .collect();
    files.sort();
    Ok(files)
}

pub fn validate_identity(code: &str) -> Result<(), DatasetError> {
    if code.is_empty() || code == "." || code == ".." || code.contains(['/', '\\']) {
        return Err(DatasetError::InvalidIdentity(code.to_string()));
    }
    Ok(())
}

pub struct DatasetBuilder {
    root: PathBuf,
    normalizer: Normalizer,
}

impl DatasetBuilder {
    pub fn new(root: impl Into<PathBuf>, normalizer: Normalizer) -> Self {
        Self {
            root: root.into(),
            normalizer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (if needed) and return the directory for `code`.
    pub fn identity_dir(&self, code: &str) -> Result<PathBuf, DatasetError> {
        validate_identity(code)?;
        let dir = self.root.join(code);
        fs::create_dir_all(&dir).map_err(|source| DatasetError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Persist one sample as `<millis>.png`, bumping the timestamp past any
    /// existing file.
    pub fn save_sample(&self, code: &str, sample: &FaceSample) -> Result<PathBuf, DatasetError> {
        let dir = self.identity_dir(code)?;
        let mut millis = chrono::Utc::now().timestamp_millis();
        let mut path = dir.join(format!("{millis}.png"));
        while path.exists() {
            millis += 1;
            path = dir.join(format!("{millis}.png"));
        }

        sample
            .to_image()
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|source| DatasetError::Write {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(identity = code, path = %path.display(), "sample saved");
        Ok(path)
    }

    /// Walk the three-pose script, saving the largest face of the first frame
    /// with a detection for each pose.
    pub fn capture_guided<D, O>(
        &self,
        code: &str,
        camera: &mut dyn CaptureDevice,
        detector: &mut D,
        observer: &mut O,
        pose_pause: Duration,
    ) -> Result<CaptureReport, DatasetError>
    where
        D: Detector + ?Sized,
        O: CaptureObserver + ?Sized,
    {
        validate_identity(code)?;
        let mut report = CaptureReport::default();

        for (index, pose) in POSES.iter().enumerate() {
            tracing::info!(identity = code, pose = pose.name, "capture pose");
            if observer.pose(index, pose) == CaptureControl::Cancel {
                report.cancelled = true;
                return Ok(report);
            }

            loop {
                let frame = match camera.read_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(error = %e, "capture read failed");
                        if observer.read_failed(&e) == CaptureControl::Cancel {
                            report.cancelled = true;
                            return Ok(report);
                        }
                        continue;
                    }
                };

                let gray = to_gray(&frame.image);
                let faces = detector
                    .detect(&prepare_frame(&gray), None)
                    .unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "detector failed during capture");
                        Vec::new()
                    });

                if observer.frame(&frame, &faces) == CaptureControl::Cancel {
                    report.cancelled = true;
                    return Ok(report);
                }

                let Some(sample) = self.sample_from(&gray, &faces) else {
                    continue;
                };

                let path = self.save_sample(code, &sample)?;
                report.saved += 1;
                report.paths.push(path.clone());
                if observer.saved(&path) == CaptureControl::Cancel {
                    report.cancelled = true;
                    return Ok(report);
                }
                break;
            }

            if index + 1 < POSES.len() {
                std::thread::sleep(pose_pause);
            }
        }

        tracing::info!(identity = code, saved = report.saved, "guided capture complete");
        Ok(report)
    }

    /// Decode, detect and save each upload. Bad items are skipped, never fatal.
    pub fn ingest_uploads<D>(
        &self,
        code: &str,
        items: &[UploadItem],
        detector: &mut D,
    ) -> Result<UploadSummary, DatasetError>
    where
        D: Detector + ?Sized,
    {
        validate_identity(code)?;
        let mut summary = UploadSummary::default();

        for item in items {
            let outcome = match self.ingest_one(item, detector) {
                Ok(sample) => UploadOutcome::Saved(self.save_sample(code, &sample)?),
                Err(reason) => {
                    tracing::info!(identity = code, file = %item.name, ?reason, "upload skipped");
                    UploadOutcome::Skipped(reason)
                }
            };
            match outcome {
                UploadOutcome::Saved(_) => summary.saved += 1,
                UploadOutcome::Skipped(_) => summary.skipped += 1,
            }
            summary.items.push((item.name.clone(), outcome));
        }

        tracing::info!(
            identity = code,
            saved = summary.saved,
            skipped = summary.skipped,
            "upload ingestion complete"
        );
        Ok(summary)
    }

    fn ingest_one<D>(&self, item: &UploadItem, detector: &mut D) -> Result<FaceSample, SkipReason>
    where
        D: Detector + ?Sized,
    {
        if item.bytes.is_empty() {
            return Err(SkipReason::Undecodable);
        }
        let decoded = image::load_from_memory(&item.bytes).map_err(|_| SkipReason::Undecodable)?;
        let gray = decoded.to_luma8();

        let faces = detector
            .detect(&prepare_frame(&gray), None)
            .map_err(|e| {
                tracing::warn!(file = %item.name, error = %e, "detector failed on upload");
                SkipReason::DetectorFailed
            })?;
        let face = largest_face(&faces).ok_or(SkipReason::NoFace)?;
        let region = crop(&gray, face).ok_or(SkipReason::InvalidImage)?;
        self.normalizer
            .normalize_gray(&region)
            .map_err(|_| SkipReason::InvalidImage)
    }

    fn sample_from(&self, gray: &GrayImage, faces: &[FaceBox]) -> Option<FaceSample> {
        let face = largest_face(faces)?;
        let region = crop(gray, face)?;
        match self.normalizer.normalize_gray(&region) {
            Ok(sample) => Some(sample),
            Err(e) => {
                tracing::warn!(error = %e, "could not normalize captured face");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_png, FakeCamera, FixedDetector};
    use crate::types::SampleSize;
    use image::RgbImage;

    fn builder(root: &Path) -> DatasetBuilder {
        DatasetBuilder::new(root, Normalizer::new(SampleSize::default()))
    }

    #[derive(Default)]
    struct Recorder {
        prompts: Vec<&'static str>,
        frames: usize,
        failures: usize,
        saved: Vec<PathBuf>,
        cancel_after_frames: Option<usize>,
    }

    impl CaptureObserver for Recorder {
        fn pose(&mut self, _index: usize, pose: &Pose) -> CaptureControl {
            self.prompts.push(pose.prompt);
            CaptureControl::Continue
        }

        fn frame(&mut self, _frame: &Frame, _faces: &[FaceBox]) -> CaptureControl {
            self.frames += 1;
            match self.cancel_after_frames {
                Some(n) if self.frames >= n => CaptureControl::Cancel,
                _ => CaptureControl::Continue,
            }
        }

        fn read_failed(&mut self, _error: &CameraError) -> CaptureControl {
            self.failures += 1;
            CaptureControl::Continue
        }

        fn saved(&mut self, path: &Path) -> CaptureControl {
            self.saved.push(path.to_path_buf());
            CaptureControl::Continue
        }
    }

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("21CS042").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(validate_identity(bad), Err(DatasetError::InvalidIdentity(_))));
        }
    }

    #[test]
    fn test_guided_capture_saves_three_poses() {
        let dir = tempfile::tempdir().unwrap();
        // Frames 0 and 2 have no face; one read fails.
        let mut camera = FakeCamera::new(vec![
            Ok(RgbImage::new(320, 240)),
            Err(()),
            Ok(RgbImage::new(320, 240)),
            Ok(RgbImage::new(320, 240)),
            Ok(RgbImage::new(320, 240)),
            Ok(RgbImage::new(320, 240)),
        ]);
        let mut detector = FixedDetector::script(vec![
            vec![],
            vec![],
            vec![FixedDetector::face(10, 10, 100, 100)],
            vec![FixedDetector::face(10, 10, 50, 50), FixedDetector::face(100, 50, 120, 120)],
            vec![FixedDetector::face(0, 0, 80, 80)],
        ]);
        let mut observer = Recorder::default();

        let report = builder(dir.path())
            .capture_guided("alice", &mut camera, &mut detector, &mut observer, Duration::ZERO)
            .unwrap();

        assert_eq!(report.saved, 3);
        assert!(!report.cancelled);
        assert_eq!(observer.prompts, POSES.iter().map(|p| p.prompt).collect::<Vec<_>>());
        assert_eq!(observer.failures, 1);
        assert_eq!(observer.saved, report.paths);

        let files = list_samples(&dir.path().join("alice"), &["png".into()]).unwrap();
        assert_eq!(files.len(), 3);
        let img = image::open(&files[0]).unwrap();
        assert_eq!((img.width(), img.height()), (200, 200));
    }

    #[test]
    fn test_guided_capture_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = FakeCamera::repeating(RgbImage::new(64, 64));
        let mut detector = FixedDetector::script(vec![]);
        let mut observer = Recorder {
            cancel_after_frames: Some(5),
            ..Default::default()
        };

        let report = builder(dir.path())
            .capture_guided("bob", &mut camera, &mut detector, &mut observer, Duration::ZERO)
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.saved, 0);
        assert_eq!(observer.frames, 5);
    }

    #[test]
    fn test_upload_counts_saved_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let face_png = encode_png(&RgbImage::from_fn(160, 120, |x, y| {
            image::Rgb([(x % 255) as u8, (y % 255) as u8, 90])
        }));
        let items = vec![
            UploadItem {
                name: "a.png".into(),
                bytes: face_png.clone(),
            },
            UploadItem {
                name: "garbage.jpg".into(),
                bytes: b"definitely not an image".to_vec(),
            },
            UploadItem {
                name: "empty.png".into(),
                bytes: Vec::new(),
            },
            UploadItem {
                name: "noface.png".into(),
                bytes: face_png.clone(),
            },
            UploadItem {
                name: "b.png".into(),
                bytes: face_png,
            },
        ];
        // Decodable items are detected in order: a, noface, b.
        let mut detector = FixedDetector::script(vec![
            vec![FixedDetector::face(20, 10, 80, 80)],
            vec![],
            vec![FixedDetector::face(0, 0, 40, 60)],
        ]);

        let summary = builder(dir.path())
            .ingest_uploads("carol", &items, &mut detector)
            .unwrap();

        assert_eq!(summary.saved, 2);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.items[1].1, UploadOutcome::Skipped(SkipReason::Undecodable));
        assert_eq!(summary.items[2].1, UploadOutcome::Skipped(SkipReason::Undecodable));
        assert_eq!(summary.items[3].1, UploadOutcome::Skipped(SkipReason::NoFace));
        assert!(matches!(summary.items[0].1, UploadOutcome::Saved(_)));

        let files = list_samples(&dir.path().join("carol"), &["png".into()]).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_upload_detector_failure_is_skip() {
        let dir = tempfile::tempdir().unwrap();
        let items = vec![UploadItem {
            name: "x.png".into(),
            bytes: encode_png(&RgbImage::new(32, 32)),
        }];
        let mut detector = FixedDetector::failing();
        let summary = builder(dir.path())
            .ingest_uploads("dave", &items, &mut detector)
            .unwrap();
        assert_eq!(summary.items[0].1, UploadOutcome::Skipped(SkipReason::DetectorFailed));
    }

    #[test]
    fn test_upload_invalid_identity_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = FixedDetector::script(vec![]);
        let err = builder(dir.path())
            .ingest_uploads("../escape", &[], &mut detector)
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidIdentity(_)));
    }

    #[test]
    fn test_save_sample_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let b = builder(dir.path());
        let sample = Normalizer::new(SampleSize::default())
            .normalize_gray(&GrayImage::new(10, 10))
            .unwrap();
        let first = b.save_sample("erin", &sample).unwrap();
        let second = b.save_sample("erin", &sample).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_list_identities_sorted_and_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        for code in ["zed", "amy", "mo"] {
            fs::create_dir_all(dir.path().join(code)).unwrap();
        }
        fs::write(dir.path().join("stray.txt"), b"x").unwrap();

        let codes: Vec<String> = list_identities(dir.path())
            .unwrap()
            .into_iter()
            .map(|(c, _)| c)
            .collect();
        assert_eq!(codes, vec!["amy", "mo", "zed"]);
        assert!(list_identities(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_list_samples_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["2.PNG", "1.jpg", "3.txt", "0.jpeg"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let exts: Vec<String> = vec!["png".into(), "jpg".into(), "jpeg".into()];
        let names: Vec<String> = list_samples(dir.path(), &exts)
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0.jpeg", "1.jpg", "2.PNG"]);
    }
}
