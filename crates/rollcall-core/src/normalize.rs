//! Face normalization: the one path every sample takes before it reaches the
//! classifier, whether it came from capture, upload, disk or a live frame.

use crate::types::{FaceBox, FaceSample, SampleSize};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
}

/// Converts face regions into canonical samples.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    size: SampleSize,
}

impl Normalizer {
    pub fn new(size: SampleSize) -> Self {
        Self { size }
    }

    pub fn size(&self) -> SampleSize {
        self.size
    }

    /// Normalize an image of any color type.
    pub fn normalize(&self, image: &DynamicImage) -> Result<FaceSample, NormalizeError> {
        match image {
            DynamicImage::ImageLuma8(gray) => self.normalize_gray(gray),
            other => self.normalize_gray(&other.to_luma8()),
        }
    }

    /// Resize (bilinear, only when needed), equalize, and copy into a
    /// row-major array.
    pub fn normalize_gray(&self, gray: &GrayImage) -> Result<FaceSample, NormalizeError> {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            return Err(NormalizeError::InvalidImage(format!("empty region {w}x{h}")));
        }

        let mut canonical = if (w, h) == (self.size.width, self.size.height) {
            gray.clone()
        } else {
            imageops::resize(gray, self.size.width, self.size.height, FilterType::Triangle)
        };
        equalize_histogram(&mut canonical);

        let pixels = Array2::from_shape_vec(self.size.shape(), canonical.into_raw())
            .map_err(|e| NormalizeError::InvalidImage(e.to_string()))?;
        Ok(FaceSample::new(pixels))
    }
}

/// Histogram equalization: level `p` becomes `floor(255 * cdf(p) / N)`.
///
/// Images with a single grey level are left untouched. Applying it twice
/// gives the same bytes as applying it once.
pub fn equalize_histogram(gray: &mut GrayImage) {
    let mut hist = [0u64; 256];
    for px in gray.pixels() {
        hist[px.0[0] as usize] += 1;
    }

    let total: u64 = hist.iter().sum();
    if total == 0 || hist.iter().filter(|&&c| c > 0).count() < 2 {
        return;
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    for (level, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[level] = (255 * cdf / total) as u8;
    }

    for px in gray.pixels_mut() {
        px.0[0] = lut[px.0[0] as usize];
    }
}

/// Grayscale + equalized copy of a frame, as the detector wants it.
pub fn prepare_frame(gray: &GrayImage) -> GrayImage {
    let mut prepared = gray.clone();
    equalize_histogram(&mut prepared);
    prepared
}

pub fn to_gray(frame: &RgbImage) -> GrayImage {
    imageops::grayscale(frame)
}

/// Cut a detected region out of the frame, clamped to its bounds.
pub fn crop(gray: &GrayImage, face: &FaceBox) -> Option<GrayImage> {
    let (fw, fh) = gray.dimensions();
    if face.x >= fw || face.y >= fh {
        return None;
    }
    let w = face.width.min(fw - face.x);
    let h = face.height.min(fh - face.y);
    if w == 0 || h == 0 {
        return None;
    }
    Some(imageops::crop_imm(gray, face.x, face.y, w, h).to_image())
}
