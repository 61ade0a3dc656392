use image::GrayImage;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Integer label → identity code. Keys are assigned 0..N-1 at training time.
pub type LabelMap = BTreeMap<i32, String>;

/// Bounding box for a detected face, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
    /// Raw candidates that supported this box during grouping.
    pub neighbors: u32,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Pick the box with the largest area. Ties keep the earlier box.
pub fn largest_face(faces: &[FaceBox]) -> Option<&FaceBox> {
    faces.iter().fold(None, |best: Option<&FaceBox>, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(face),
    })
}

/// Canonical sample dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSize {
    pub width: u32,
    pub height: u32,
}

impl Default for SampleSize {
    fn default() -> Self {
        Self {
            width: 200,
            height: 200,
        }
    }
}

impl SampleSize {
    /// `(rows, cols)` as ndarray orders them.
    pub fn shape(&self) -> (usize, usize) {
        (self.height as usize, self.width as usize)
    }
}

/// A normalized face: grayscale, 8-bit, canonical size, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceSample(Array2<u8>);

impl FaceSample {
    pub fn new(pixels: Array2<u8>) -> Self {
        Self(pixels)
    }

    pub fn view(&self) -> ArrayView2<'_, u8> {
        self.0.view()
    }

    pub fn pixels(&self) -> &Array2<u8> {
        &self.0
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        self.0.dim()
    }

    pub fn is_contiguous(&self) -> bool {
        self.0.is_standard_layout()
    }

    pub fn to_image(&self) -> GrayImage {
        let (rows, cols) = self.0.dim();
        GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
            image::Luma([self.0[[y as usize, x as usize]]])
        })
    }
}

/// Classifier output: nearest label and its distance. Lower is closer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    pub distance: f64,
}

impl Prediction {
    /// Returned in place of a real prediction when inference fails.
    pub const DEFEAT: Prediction = Prediction {
        label: -1,
        distance: 9999.0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: u32, w: u32, h: u32) -> FaceBox {
        FaceBox {
            x,
            y: 0,
            width: w,
            height: h,
            confidence: 0.9,
            neighbors: 3,
        }
    }

    #[test]
    fn test_largest_face_by_area() {
        let faces = [face(0, 10, 10), face(50, 30, 20), face(100, 20, 20)];
        assert_eq!(largest_face(&faces).unwrap().x, 50);
    }

    #[test]
    fn test_largest_face_tie_keeps_first() {
        let faces = [face(0, 20, 10), face(50, 10, 20)];
        assert_eq!(largest_face(&faces).unwrap().x, 0);
    }

    #[test]
    fn test_largest_face_empty() {
        assert!(largest_face(&[]).is_none());
    }

    #[test]
    fn test_sample_to_image_keeps_orientation() {
        let pixels = Array2::from_shape_vec((2, 3), vec![1, 2, 3, 4, 5, 6]).unwrap();
        let img = FaceSample::new(pixels).to_image();
        assert_eq!(img.dimensions(), (3, 2));
        assert_eq!(img.get_pixel(2, 0).0, [3]);
        assert_eq!(img.get_pixel(0, 1).0, [4]);
    }
}
