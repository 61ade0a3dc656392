//! Camera acquisition: open the first working device from a ranked list of
//! strategies and report why every other attempt failed.

use crate::camera::{Camera, CameraError, CaptureBackend, CaptureDevice, Resolution};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operator-facing advice attached to every total failure.
pub const REMEDIATION_HINT: &str = "check that a camera is connected and not held by another \
     process; the daemon user needs read/write access to /dev/video* (usually the 'video' group)";

/// Primary camera source: a device index or a device node path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CameraSource {
    Index(usize),
    Path(String),
}

impl Default for CameraSource {
    fn default() -> Self {
        CameraSource::Index(0)
    }
}

impl CameraSource {
    /// Parse an operator-supplied value: digits are an index, anything else a path.
    pub fn parse(value: &str) -> Self {
        match value.trim().parse::<usize>() {
            Ok(index) => CameraSource::Index(index),
            Err(_) => CameraSource::Path(value.trim().to_string()),
        }
    }
}

/// `[camera]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub source: CameraSource,
    /// Streaming I/O methods to try, in order.
    pub backends: Vec<CaptureBackend>,
    /// Device indices to try for every backend.
    pub indices: Vec<usize>,
    pub resolution: Resolution,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            source: CameraSource::default(),
            backends: vec![CaptureBackend::Mmap, CaptureBackend::Userptr],
            indices: vec![0, 1, 2, 3],
            resolution: Resolution::default(),
        }
    }
}

/// Opens capture devices. [`V4lOpener`] talks to real hardware; tests substitute fakes.
pub trait DeviceOpener {
    fn open_path(
        &self,
        path: &str,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureDevice>, CameraError>;

    fn open_index(
        &self,
        index: usize,
        backend: Option<CaptureBackend>,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct V4lOpener;

impl DeviceOpener for V4lOpener {
    fn open_path(
        &self,
        path: &str,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureDevice>, CameraError> {
        Ok(Box::new(Camera::open_path(path, None, resolution)?))
    }

    fn open_index(
        &self,
        index: usize,
        backend: Option<CaptureBackend>,
        resolution: Resolution,
    ) -> Result<Box<dyn CaptureDevice>, CameraError> {
        Ok(Box::new(Camera::open_index(index, backend, resolution)?))
    }
}

/// How a camera was successfully opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Source { path: String },
    Device {
        index: usize,
        backend: Option<CaptureBackend>,
    },
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Source { path } => write!(f, "source={path}"),
            Strategy::Device {
                index,
                backend: Some(backend),
            } => write!(f, "index={index} backend={backend}"),
            Strategy::Device {
                index,
                backend: None,
            } => write!(f, "index={index} backend=auto"),
        }
    }
}

pub struct OpenedCamera {
    pub device: Box<dyn CaptureDevice>,
    pub strategy: Strategy,
}

/// Every strategy failed. Carried as data so callers can degrade instead of abort.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("camera unavailable after {} attempts", errors.len())]
pub struct CameraUnavailable {
    pub errors: Vec<String>,
    pub hint: String,
}

/// Result of a one-frame probe, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct CameraDiagnostics {
    pub ok: bool,
    pub strategy: Option<String>,
    pub errors: Vec<String>,
    pub hint: Option<String>,
    pub platform: String,
    /// `[width, height]` of the probe frame.
    pub shape: Option<[u32; 2]>,
}

pub struct CameraManager<O = V4lOpener> {
    config: AcquisitionConfig,
    opener: O,
}

impl CameraManager<V4lOpener> {
    pub fn new(config: AcquisitionConfig) -> Self {
        Self::with_opener(config, V4lOpener)
    }
}

impl<O: DeviceOpener> CameraManager<O> {
    pub fn with_opener(config: AcquisitionConfig, opener: O) -> Self {
        Self { config, opener }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Indices to try: the primary source index first, then the configured
    /// list, without repeats.
    pub fn candidate_indices(&self) -> Vec<usize> {
        let mut indices = Vec::with_capacity(self.config.indices.len() + 1);
        if let CameraSource::Index(primary) = self.config.source {
            indices.push(primary);
        }
        for &index in &self.config.indices {
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        indices
    }

    /// Open the first camera that works.
    ///
    /// Order: configured source path, then every backend × index pair
    /// (backend-major), then each index with the driver defaults.
    pub fn open(&self) -> Result<OpenedCamera, CameraUnavailable> {
        let resolution = self.config.resolution;
        let mut errors = Vec::new();

        if let CameraSource::Path(path) = &self.config.source {
            let path = path.trim();
            if !path.is_empty() {
                tracing::debug!(source = path, "trying camera source");
                match self.opener.open_path(path, resolution) {
                    Ok(device) => {
                        return Ok(self.opened(
                            device,
                            Strategy::Source {
                                path: path.to_string(),
                            },
                        ))
                    }
                    Err(e) => {
                        tracing::debug!(source = path, error = %e, "camera source failed");
                        errors.push(format!("source={path} error={e}"));
                    }
                }
            }
        }

        let indices = self.candidate_indices();
        let explicit = self.config.backends.iter().copied().map(Some);
        for backend in explicit.chain(std::iter::once(None)) {
            for &index in &indices {
                let strategy = Strategy::Device { index, backend };
                tracing::debug!(strategy = %strategy, "trying camera");
                match self.opener.open_index(index, backend, resolution) {
                    Ok(device) => return Ok(self.opened(device, strategy)),
                    Err(e) => {
                        tracing::debug!(strategy = %strategy, error = %e, "camera attempt failed");
                        errors.push(format!("{strategy} error={e}"));
                    }
                }
            }
        }

        tracing::warn!(attempts = errors.len(), "no camera could be opened");
        Err(CameraUnavailable {
            errors,
            hint: REMEDIATION_HINT.to_string(),
        })
    }

    fn opened(&self, device: Box<dyn CaptureDevice>, strategy: Strategy) -> OpenedCamera {
        tracing::info!(strategy = %strategy, device = %device.describe(), "camera opened");
        OpenedCamera { device, strategy }
    }

    /// Open a camera, read one frame and release it. Never fails.
    pub fn diagnostics(&self) -> CameraDiagnostics {
        let platform = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);

        let mut opened = match self.open() {
            Ok(opened) => opened,
            Err(unavailable) => {
                return CameraDiagnostics {
                    ok: false,
                    strategy: None,
                    errors: unavailable.errors,
                    hint: Some(unavailable.hint),
                    platform,
                    shape: None,
                }
            }
        };

        let strategy = Some(opened.strategy.to_string());
        match opened.device.read_frame() {
            Ok(frame) => CameraDiagnostics {
                ok: true,
                strategy,
                errors: Vec::new(),
                hint: None,
                platform,
                shape: Some([frame.width(), frame.height()]),
            },
            Err(e) => CameraDiagnostics {
                ok: false,
                strategy,
                errors: vec![format!("read failed: {e}")],
                hint: Some(REMEDIATION_HINT.to_string()),
                platform,
                shape: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use image::RgbImage;
    use std::cell::RefCell;

    struct FakeDevice {
        fail_reads: bool,
    }

    impl CaptureDevice for FakeDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            if self.fail_reads {
                return Err(CameraError::CaptureFailed("timeout".into()));
            }
            Ok(Frame::new(RgbImage::new(64, 48), 0))
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    /// Succeeds only for the listed path or (index, backend) pair.
    #[derive(Default)]
    struct FakeOpener {
        path: Option<String>,
        device: Option<(usize, Option<CaptureBackend>)>,
        fail_reads: bool,
        attempts: RefCell<Vec<String>>,
    }

    impl DeviceOpener for FakeOpener {
        fn open_path(
            &self,
            path: &str,
            _resolution: Resolution,
        ) -> Result<Box<dyn CaptureDevice>, CameraError> {
            self.attempts.borrow_mut().push(format!("path:{path}"));
            if self.path.as_deref() == Some(path) {
                Ok(Box::new(FakeDevice {
                    fail_reads: self.fail_reads,
                }))
            } else {
                Err(CameraError::DeviceNotFound(path.to_string()))
            }
        }

        fn open_index(
            &self,
            index: usize,
            backend: Option<CaptureBackend>,
            _resolution: Resolution,
        ) -> Result<Box<dyn CaptureDevice>, CameraError> {
            let label = backend.map_or("auto".to_string(), |b| b.to_string());
            self.attempts.borrow_mut().push(format!("{index}:{label}"));
            if self.device == Some((index, backend)) {
                Ok(Box::new(FakeDevice {
                    fail_reads: self.fail_reads,
                }))
            } else {
                Err(CameraError::DeviceNotFound(format!("/dev/video{index}")))
            }
        }
    }

    fn manager(source: CameraSource, opener: FakeOpener) -> CameraManager<FakeOpener> {
        let config = AcquisitionConfig {
            source,
            ..AcquisitionConfig::default()
        };
        CameraManager::with_opener(config, opener)
    }

    #[test]
    fn test_candidate_indices_primary_first_without_duplicates() {
        let mgr = manager(CameraSource::Index(2), FakeOpener::default());
        assert_eq!(mgr.candidate_indices(), vec![2, 0, 1, 3]);

        let mgr = manager(CameraSource::Path("/dev/video9".into()), FakeOpener::default());
        assert_eq!(mgr.candidate_indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_source_path_tried_first() {
        let opener = FakeOpener {
            path: Some("/dev/v4l/by-id/cam".into()),
            ..Default::default()
        };
        let mgr = manager(CameraSource::Path("/dev/v4l/by-id/cam".into()), opener);
        let opened = mgr.open().unwrap();
        assert_eq!(
            opened.strategy,
            Strategy::Source {
                path: "/dev/v4l/by-id/cam".into()
            }
        );
        assert_eq!(mgr.opener.attempts.borrow().len(), 1);
    }

    #[test]
    fn test_blank_source_path_is_ignored() {
        let opener = FakeOpener {
            device: Some((0, Some(CaptureBackend::Mmap))),
            ..Default::default()
        };
        let mgr = manager(CameraSource::Path("   ".into()), opener);
        let opened = mgr.open().unwrap();
        assert_eq!(opened.strategy.to_string(), "index=0 backend=mmap");
        assert!(mgr
            .opener
            .attempts
            .borrow()
            .iter()
            .all(|a| !a.starts_with("path:")));
    }

    #[test]
    fn test_backend_major_order_then_auto_pass() {
        let opener = FakeOpener {
            device: Some((1, None)),
            ..Default::default()
        };
        let mgr = manager(CameraSource::Index(0), opener);
        let opened = mgr.open().unwrap();
        assert_eq!(opened.strategy.to_string(), "index=1 backend=auto");

        let attempts = mgr.opener.attempts.borrow();
        assert_eq!(
            attempts[..],
            [
                "0:mmap", "1:mmap", "2:mmap", "3:mmap", "0:userptr", "1:userptr", "2:userptr",
                "3:userptr", "0:auto", "1:auto",
            ]
        );
    }

    #[test]
    fn test_total_failure_collects_every_attempt() {
        let mgr = manager(CameraSource::Path("rtsp://nowhere".into()), FakeOpener::default());
        let err = mgr.open().err().unwrap();
        // 1 source + 2 backends × 4 indices + 4 auto
        assert_eq!(err.errors.len(), 13);
        assert!(err.errors[0].starts_with("source=rtsp://nowhere error="));
        assert!(err.errors[1].starts_with("index=0 backend=mmap error="));
        assert!(!err.hint.is_empty());
    }

    #[test]
    fn test_diagnostics_success() {
        let opener = FakeOpener {
            device: Some((0, Some(CaptureBackend::Mmap))),
            ..Default::default()
        };
        let diag = manager(CameraSource::Index(0), opener).diagnostics();
        assert!(diag.ok);
        assert_eq!(diag.shape, Some([64, 48]));
        assert_eq!(diag.strategy.as_deref(), Some("index=0 backend=mmap"));
        assert!(diag.platform.contains('-'));
    }

    #[test]
    fn test_diagnostics_failure_is_data() {
        let diag = manager(CameraSource::Index(0), FakeOpener::default()).diagnostics();
        assert!(!diag.ok);
        assert!(diag.shape.is_none());
        assert!(!diag.errors.is_empty());
        assert!(diag.hint.is_some());

        let json = serde_json::to_value(&diag).unwrap();
        assert_eq!(json["ok"], false);
    }

    #[test]
    fn test_diagnostics_read_failure() {
        let opener = FakeOpener {
            device: Some((0, Some(CaptureBackend::Mmap))),
            fail_reads: true,
            ..Default::default()
        };
        let diag = manager(CameraSource::Index(0), opener).diagnostics();
        assert!(!diag.ok);
        assert!(diag.strategy.is_some());
        assert!(diag.errors[0].starts_with("read failed"));
    }

    #[test]
    fn test_camera_source_parsing() {
        assert_eq!(CameraSource::parse("2"), CameraSource::Index(2));
        assert_eq!(
            CameraSource::parse(" /dev/video0 "),
            CameraSource::Path("/dev/video0".into())
        );
        assert_eq!(
            serde_json::from_str::<CameraSource>("1").unwrap(),
            CameraSource::Index(1)
        );
        assert_eq!(
            serde_json::from_str::<CameraSource>("\"/dev/video4\"").unwrap(),
            CameraSource::Path("/dev/video4".into())
        );
    }
}
