//! Frame type and pixel format conversion: YUYV, GREY and MJPEG to RGB.

use image::{ImageFormat, RgbImage};

/// A captured camera frame, decoded to 8-bit RGB.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the
/// chroma pair. Uses the BT.601 studio-swing integer approximation.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = (298 * c + 409 * e + 128) >> 8;
    let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
    let b = (298 * c + 516 * d + 128) >> 8;

    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

/// Expand 8-bit grayscale (native IR / GREY output) to RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }

    let rgb: Vec<u8> = gray[..expected].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: gray.len(),
    })
}

/// Decode one MJPEG buffer (a complete JPEG image) to RGB.
pub fn mjpeg_to_rgb(buf: &[u8]) -> Result<RgbImage, FrameError> {
    if buf.is_empty() {
        return Err(FrameError::InvalidLength {
            expected: 1,
            actual: 0,
        });
    }
    let decoded = image::load_from_memory_with_format(buf, ImageFormat::Jpeg)?;
    Ok(decoded.to_rgb8())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::Rgb;

    #[test]
    fn test_yuyv_to_rgb_white_and_black() {
        // 2x1 image: both pixels share U=V=128 (no chroma)
        let yuyv = vec![235, 128, 16, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_yuyv_to_rgb_red_dominant() {
        // Strong V (Cr) with neutral U pushes red up and green down
        let yuyv = vec![81, 90, 81, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        let px = rgb.get_pixel(0, 0);
        assert!(px[0] > 200, "red channel should dominate: {px:?}");
        assert!(px[1] < 60, "green channel should be low: {px:?}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(matches!(
            yuyv_to_rgb(&yuyv, 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_to_rgb_replicates_channels() {
        let gray = vec![0u8, 77, 255, 12];
        let rgb = grey_to_rgb(&gray, 2, 2).unwrap();
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([77, 77, 77]));
        assert_eq!(rgb.get_pixel(0, 1), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_grey_to_rgb_short_buffer() {
        assert!(grey_to_rgb(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn test_mjpeg_decode() {
        let src = RgbImage::from_pixel(16, 8, Rgb([120, 120, 120]));
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&src)
            .unwrap();

        let decoded = mjpeg_to_rgb(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
        let px = decoded.get_pixel(4, 4);
        assert!((px[0] as i32 - 120).abs() <= 3);
    }

    #[test]
    fn test_mjpeg_garbage_is_error() {
        assert!(mjpeg_to_rgb(&[0xde, 0xad, 0xbe, 0xef]).is_err());
        assert!(mjpeg_to_rgb(&[]).is_err());
    }
}
