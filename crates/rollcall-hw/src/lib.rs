//! rollcall-hw — camera capture for the rollcall pipeline.
//!
//! Provides V4L2-based camera access, pixel format decoding and a ranked
//! acquisition strategy with operator diagnostics.

pub mod acquire;
pub mod camera;
pub mod frame;

pub use acquire::{
    AcquisitionConfig, CameraDiagnostics, CameraManager, CameraSource, CameraUnavailable,
    DeviceOpener, OpenedCamera, Strategy, V4lOpener,
};
pub use camera::{
    Camera, CameraError, CaptureBackend, CaptureDevice, DeviceInfo, PixelFormat, Resolution,
};
pub use frame::Frame;
