//! Live recognition stream: camera → detect → classify → mark → annotated
//! JPEG parts of a `multipart/x-mixed-replace` response.
//!
//! A stream never fails towards its consumer. Setup problems degrade it to
//! synthetic error frames; per-frame problems are logged and rendered.

use crate::annotate::{Annotator, GREEN, RED};
use crate::artifact;
use crate::attendance::{AttendanceBackend, AttendanceMarker, SessionId};
use crate::config::Config;
use crate::detector::{Detector, DetectorError, ScrfdDetector};
use crate::lbph::FaceClassifier;
use crate::normalize::{crop, prepare_frame, to_gray, Normalizer};
use crate::types::{FaceBox, LabelMap, Prediction, SampleSize};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, RgbImage};
use rollcall_hw::{CameraManager, CaptureDevice};
use std::time::{Duration, Instant};

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const FALLBACK_WIDTH: u32 = 640;
const FALLBACK_HEIGHT: u32 = 480;
const DIAGNOSTIC_CHARS: usize = 48;
const UNKNOWN: &str = "Unknown";
const CAMERA_UNAVAILABLE: &str = "Camera not available";
const DETECTOR_UNAVAILABLE: &str = "Face detector not available";

/// Wrap one JPEG as a multipart part.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    image.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Streaming,
    Ended,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub distance_threshold: f64,
    pub min_face: u32,
    pub sample_size: SampleSize,
    pub cooldown: Duration,
    pub mark_closed_sessions: bool,
    pub jpeg_quality: u8,
    pub unavailable_interval: Duration,
    /// Append the distance to recognized captions.
    pub debug: bool,
}

impl StreamSettings {
    pub fn from_config(config: &Config, debug: bool) -> Self {
        Self {
            distance_threshold: config.recognition.distance_threshold,
            min_face: config.detector.live_min_size,
            sample_size: config.recognition.sample_size,
            cooldown: Duration::from_secs(config.recognition.cooldown_secs),
            mark_closed_sessions: config.recognition.mark_closed_sessions,
            jpeg_quality: config.stream.jpeg_quality,
            unavailable_interval: Duration::from_millis(config.stream.unavailable_interval_ms),
            debug,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from_config(&Config::default(), false)
    }
}

/// A classifier together with the identity codes its labels stand for.
pub struct LoadedModel {
    pub classifier: Box<dyn FaceClassifier>,
    pub labels: LabelMap,
}

enum FrameSource {
    Live {
        camera: Box<dyn CaptureDevice>,
        detector: Box<dyn Detector>,
        normalizer: Normalizer,
        /// `None` renders every face as unknown.
        model: Option<LoadedModel>,
    },
    Unavailable {
        lines: [String; 2],
        last: Option<Instant>,
    },
}

/// One consumer's recognition stream for one attendance session.
///
/// Iterating yields multipart parts forever; dropping it ends the stream and
/// releases the camera.
pub struct RecognitionStream<B> {
    source: FrameSource,
    marker: AttendanceMarker,
    annotator: Annotator,
    settings: StreamSettings,
    backend: B,
    state: StreamState,
}

impl<B: AttendanceBackend> RecognitionStream<B> {
    /// Open the camera, detector and model described by `config`. Never fails:
    /// a missing camera or detector yields error frames, a missing or
    /// inconsistent model makes every face unknown.
    pub fn from_config(config: &Config, session: SessionId, debug: bool, backend: B) -> Self {
        let settings = StreamSettings::from_config(config, debug);
        let annotator = Annotator::load(config.stream.font_path.as_deref());

        let camera = CameraManager::new(config.camera.clone())
            .open()
            .map(|opened| opened.device)
            .map_err(|unavailable| {
                unavailable
                    .errors
                    .first()
                    .cloned()
                    .unwrap_or_else(|| unavailable.to_string())
            });

        Self::assemble(
            session,
            settings,
            camera,
            || {
                ScrfdDetector::load(&config.paths.detector_model, config.detector.clone())
                    .map(|d| Box::new(d) as Box<dyn Detector>)
            },
            || load_model(&config.paths.model_dir),
            backend,
        )
        .with_annotator(annotator)
    }

    /// Pick live or degraded mode from the setup results. The detector and
    /// model are only loaded once a camera is open.
    fn assemble(
        session: SessionId,
        settings: StreamSettings,
        camera: Result<Box<dyn CaptureDevice>, String>,
        detector: impl FnOnce() -> Result<Box<dyn Detector>, DetectorError>,
        model: impl FnOnce() -> Option<LoadedModel>,
        backend: B,
    ) -> Self {
        let camera = match camera {
            Ok(camera) => camera,
            Err(diagnostic) => return Self::unavailable(session, settings, &diagnostic, backend),
        };

        let detector = match detector() {
            Ok(detector) => detector,
            Err(e) => {
                tracing::error!(error = %e, "face detector unavailable");
                return Self::degraded(session, settings, DETECTOR_UNAVAILABLE, &e.to_string(), backend);
            }
        };

        Self::live(session, settings, camera, detector, model(), backend)
    }

    pub fn live(
        session: SessionId,
        settings: StreamSettings,
        camera: Box<dyn CaptureDevice>,
        detector: Box<dyn Detector>,
        model: Option<LoadedModel>,
        backend: B,
    ) -> Self {
        let source = FrameSource::Live {
            camera,
            detector,
            normalizer: Normalizer::new(settings.sample_size),
            model,
        };
        Self::with_source(session, settings, source, backend)
    }

    /// A stream that only ever shows "Camera not available" and `diagnostic`.
    pub fn unavailable(session: SessionId, settings: StreamSettings, diagnostic: &str, backend: B) -> Self {
        Self::degraded(session, settings, CAMERA_UNAVAILABLE, diagnostic, backend)
    }

    /// Error frames headed by `headline`, with `diagnostic` cut to one line.
    pub fn degraded(
        session: SessionId,
        settings: StreamSettings,
        headline: &str,
        diagnostic: &str,
        backend: B,
    ) -> Self {
        let detail: String = diagnostic.chars().take(DIAGNOSTIC_CHARS).collect();
        tracing::warn!(headline, diagnostic, "stream degraded to error frames");
        let source = FrameSource::Unavailable {
            lines: [headline.to_string(), detail],
            last: None,
        };
        Self::with_source(session, settings, source, backend)
    }

    fn with_source(session: SessionId, settings: StreamSettings, source: FrameSource, backend: B) -> Self {
        Self {
            source,
            marker: AttendanceMarker::new(session, settings.cooldown, settings.mark_closed_sessions),
            annotator: Annotator::default(),
            settings,
            backend,
            state: StreamState::Starting,
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.source, FrameSource::Unavailable { .. })
    }

    /// Stop yielding parts.
    pub fn end(&mut self) {
        if self.state != StreamState::Ended {
            tracing::info!(session = self.marker.session(), "recognition stream ended");
            self.state = StreamState::Ended;
        }
    }

    /// Produce the next annotated frame.
    pub fn next_frame(&mut self) -> RgbImage {
        match &mut self.source {
            FrameSource::Unavailable { lines, last } => {
                if let Some(prev) = *last {
                    let elapsed = prev.elapsed();
                    if elapsed < self.settings.unavailable_interval {
                        std::thread::sleep(self.settings.unavailable_interval - elapsed);
                    }
                }
                *last = Some(Instant::now());
                let lines = [lines[0].as_str(), lines[1].as_str()];
                self.annotator.message_frame(FALLBACK_WIDTH, FALLBACK_HEIGHT, &lines)
            }
            FrameSource::Live {
                camera,
                detector,
                normalizer,
                model,
            } => {
                let mut frame = match camera.read_frame() {
                    Ok(frame) => frame.image,
                    Err(e) => {
                        tracing::warn!(error = %e, "camera read failed");
                        return self.annotator.message_frame(
                            FALLBACK_WIDTH,
                            FALLBACK_HEIGHT,
                            &["Camera read() failed"],
                        );
                    }
                };

                let gray = to_gray(&frame);
                let faces = match detector.detect(&prepare_frame(&gray), Some(self.settings.min_face)) {
                    Ok(faces) => faces,
                    Err(e) => {
                        tracing::warn!(error = %e, "detection failed");
                        Vec::new()
                    }
                };

                for face in &faces {
                    let verdict = recognize(normalizer, model.as_ref(), &gray, face, self.settings.distance_threshold);
                    let (label, color) = match verdict {
                        Some((code, prediction)) => {
                            match identify(&mut self.marker, &self.backend, &code) {
                                Some(name) if self.settings.debug => {
                                    (format!("{name} conf:{:.1}", prediction.distance), GREEN)
                                }
                                Some(name) => (name, GREEN),
                                None => (UNKNOWN.to_string(), RED),
                            }
                        }
                        None => (UNKNOWN.to_string(), RED),
                    };
                    self.annotator.face(&mut frame, face, &label, color);
                }
                frame
            }
        }
    }
}

fn load_model(dir: &std::path::Path) -> Option<LoadedModel> {
    match artifact::load(dir) {
        Ok(artifacts) => {
            tracing::info!(identities = artifacts.labels.len(), "recognition model loaded");
            Some(LoadedModel {
                classifier: Box::new(artifacts.recognizer),
                labels: artifacts.labels,
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "no usable model; all faces will be unknown");
            None
        }
    }
}

/// Classify one face. Returns the identity code when the prediction is both
/// known and within the threshold.
fn recognize(
    normalizer: &Normalizer,
    model: Option<&LoadedModel>,
    gray: &image::GrayImage,
    face: &FaceBox,
    threshold: f64,
) -> Option<(String, Prediction)> {
    let model = model?;
    let region = crop(gray, face)?;
    let sample = match normalizer.normalize_gray(&region) {
        Ok(sample) => sample,
        Err(e) => {
            tracing::debug!(error = %e, "face not normalizable");
            return None;
        }
    };

    let prediction = model.classifier.predict(&sample).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "classifier failed");
        Prediction::DEFEAT
    });
    tracing::trace!(label = prediction.label, distance = prediction.distance, "prediction");

    let code = model.labels.get(&prediction.label)?;
    (prediction.distance <= threshold).then(|| (code.clone(), prediction))
}

/// Resolve an accepted code to a student label and try to mark them present.
/// `None` when the code is not on the roster.
fn identify<B: AttendanceBackend + ?Sized>(
    marker: &mut AttendanceMarker,
    backend: &B,
    code: &str,
) -> Option<String> {
    let student = match backend.student_by_code(code) {
        Ok(Some(student)) => student,
        Ok(None) => {
            tracing::debug!(code, "recognized code is not on the roster");
            return None;
        }
        Err(e) => {
            tracing::error!(code, error = %e, "roster lookup failed");
            return None;
        }
    };

    if let Err(e) = marker.mark(backend, &student, Instant::now()) {
        tracing::error!(student = %student.code, error = %e, "attendance mark failed");
    }
    Some(student.display_name())
}

impl<B: AttendanceBackend> Iterator for RecognitionStream<B> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        match self.state {
            StreamState::Ended => return None,
            StreamState::Starting => {
                tracing::info!(
                    session = self.marker.session(),
                    degraded = self.is_degraded(),
                    "recognition stream started"
                );
                self.state = StreamState::Streaming;
            }
            StreamState::Streaming => {}
        }

        let frame = self.next_frame();
        let jpeg = encode_jpeg(&frame, self.settings.jpeg_quality).unwrap_or_else(|e| {
            tracing::error!(error = %e, "jpeg encoding failed");
            Vec::new()
        });
        Some(multipart_part(&jpeg))
    }
}

impl<B> Drop for RecognitionStream<B> {
    fn drop(&mut self) {
        if self.state != StreamState::Ended {
            tracing::info!(session = self.marker.session(), "recognition stream ended");
            self.state = StreamState::Ended;
        }
    }
}
