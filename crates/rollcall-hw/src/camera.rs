//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// V4L2 streaming I/O method used to move buffers out of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Driver-allocated buffers mapped into our address space.
    Mmap,
    /// Application-allocated buffers handed to the driver.
    Userptr,
}

impl fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureBackend::Mmap => f.write_str("mmap"),
            CaptureBackend::Userptr => f.write_str("userptr"),
        }
    }
}

/// Requested capture resolution. Drivers may round to the nearest mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion-JPEG, one complete JPEG per buffer.
    Mjpg,
    /// 8-bit grayscale (1 byte/pixel, native IR camera output).
    Grey,
}

impl PixelFormat {
    /// Formats we request, in order, when the caller picks an explicit backend.
    const PREFERENCE: [PixelFormat; 3] = [PixelFormat::Yuyv, PixelFormat::Mjpg, PixelFormat::Grey];

    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Mjpg => FourCC::new(b"MJPG"),
            PixelFormat::Grey => FourCC::new(b"GREY"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpg),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// A source of decoded frames. Implemented by [`Camera`] and by test doubles.
pub trait CaptureDevice {
    /// Block until the next frame is available and return it decoded.
    fn read_frame(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable description of the device (path or index).
    fn describe(&self) -> String;
}

enum BufferStream {
    Mmap(MmapStream<'static>),
    Userptr(UserptrStream),
}

/// V4L2 camera device handle with an active capture stream.
pub struct Camera {
    // Keeps the device handle alive for the lifetime of the stream.
    _device: Device,
    stream: BufferStream,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a camera by device node (e.g., "/dev/video2" or a /dev/v4l/by-id link).
    ///
    /// `backend = None` keeps the driver's current pixel format and uses
    /// memory-mapped streaming.
    pub fn open_path(
        device_path: &str,
        backend: Option<CaptureBackend>,
        resolution: Resolution,
    ) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| map_open_error(device_path, e))?;
        Self::start(device, device_path.to_string(), backend, resolution)
    }

    /// Open `/dev/video{index}`.
    pub fn open_index(
        index: usize,
        backend: Option<CaptureBackend>,
        resolution: Resolution,
    ) -> Result<Self, CameraError> {
        let device_path = format!("/dev/video{index}");
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::new(index).map_err(|e| map_open_error(&device_path, e))?;
        Self::start(device, device_path, backend, resolution)
    }

    fn start(
        device: Device,
        device_path: String,
        backend: Option<CaptureBackend>,
        resolution: Resolution,
    ) -> Result<Self, CameraError> {
        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        let cap_flags = caps.capabilities;
        if !cap_flags.contains(v4l::capability::Flags::VIDEO_CAPTURE)
            || !cap_flags.contains(v4l::capability::Flags::STREAMING)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let negotiated = match backend {
            Some(_) => negotiate_preferred(&device, resolution)?,
            None => negotiate_best_effort(&device, resolution)?,
        };

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc} (need YUYV, MJPG, or GREY)"
            ))
        })?;

        let backend_label = backend.map_or_else(|| "auto".to_string(), |b| b.to_string());
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = %fourcc,
            backend = %backend_label,
            "negotiated format"
        );

        // Creating the stream requests and maps the buffers; a backend the
        // driver does not support fails here rather than on the first read.
        let stream = match backend.unwrap_or(CaptureBackend::Mmap) {
            CaptureBackend::Mmap => BufferStream::Mmap(
                MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                })?,
            ),
            CaptureBackend::Userptr => BufferStream::Userptr(
                UserptrStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
                    CameraError::CaptureFailed(format!("failed to create userptr stream: {e}"))
                })?,
            ),
        };

        Ok(Self {
            _device: device,
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            fourcc,
            pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CaptureDevice for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let (width, height, format) = (self.width, self.height, self.pixel_format);

        let (buf, meta) = match &mut self.stream {
            BufferStream::Mmap(s) => s.next(),
            BufferStream::Userptr(s) => s.next(),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        // Drivers report the payload size; MJPEG buffers are padded past it.
        let used = meta.bytesused as usize;
        let payload = if used > 0 && used <= buf.len() { &buf[..used] } else { buf };

        let image = decode(payload, format, width, height)?;
        Ok(Frame::new(image, meta.sequence))
    }

    fn describe(&self) -> String {
        format!("{} ({}x{} {})", self.device_path, self.width, self.height, self.fourcc)
    }
}

fn decode(
    payload: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<image::RgbImage, CameraError> {
    let decoded = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(payload, width, height),
        PixelFormat::Grey => frame::grey_to_rgb(payload, width, height),
        PixelFormat::Mjpg => frame::mjpeg_to_rgb(payload),
    };
    decoded.map_err(|e| CameraError::CaptureFailed(format!("{format:?} conversion failed: {e}")))
}

fn map_open_error(device_path: &str, e: std::io::Error) -> CameraError {
    if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

/// Request the resolution with the first pixel format the device advertises
/// from our preference list.
fn negotiate_preferred(device: &Device, resolution: Resolution) -> Result<v4l::format::Format, CameraError> {
    let advertised: Vec<FourCC> = device
        .enum_formats()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to enumerate formats: {e}")))?
        .into_iter()
        .map(|d| d.fourcc)
        .collect();

    let wanted = PixelFormat::PREFERENCE
        .iter()
        .map(|p| p.fourcc())
        .find(|fcc| advertised.contains(fcc))
        .ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "device advertises none of YUYV/MJPG/GREY (has {advertised:?})"
            ))
        })?;

    let mut fmt = device.format().map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
    })?;
    fmt.fourcc = wanted;
    fmt.width = resolution.width;
    fmt.height = resolution.height;

    device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))
}

/// Keep the driver's pixel format and only ask for the resolution. A refused
/// resolution is not an error: the current format is used as-is.
fn negotiate_best_effort(device: &Device, resolution: Resolution) -> Result<v4l::format::Format, CameraError> {
    let mut fmt = device.format().map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
    })?;
    fmt.width = resolution.width;
    fmt.height = resolution.height;

    match device.set_format(&fmt) {
        Ok(negotiated) => Ok(negotiated),
        Err(e) => {
            tracing::debug!(error = %e, "resolution request refused; keeping driver format");
            device.format().map_err(|e| {
                CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"JPEG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"NV12")), None);
    }

    #[test]
    fn test_pixel_format_fourcc_roundtrip() {
        for fmt in PixelFormat::PREFERENCE {
            assert_eq!(PixelFormat::from_fourcc(fmt.fourcc()), Some(fmt));
        }
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(CaptureBackend::Mmap.to_string(), "mmap");
        assert_eq!(CaptureBackend::Userptr.to_string(), "userptr");
    }

    #[test]
    fn test_open_missing_device() {
        let result = Camera::open_path("/dev/does-not-exist-video", None, Resolution::default());
        assert!(matches!(result, Err(CameraError::DeviceNotFound(_))));
    }

    #[test]
    fn test_decode_grey_payload() {
        let img = decode(&[10, 20, 30, 40], PixelFormat::Grey, 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 1).0, [40, 40, 40]);
    }

    #[test]
    fn test_decode_short_yuyv_payload() {
        let err = decode(&[1, 2], PixelFormat::Yuyv, 2, 2).unwrap_err();
        assert!(matches!(err, CameraError::CaptureFailed(_)));
    }
}
