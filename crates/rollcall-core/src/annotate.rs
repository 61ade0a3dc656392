//! Frame annotation: face boxes, captions and synthetic error frames.

use crate::types::FaceBox;
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

pub const GREEN: Rgb<u8> = Rgb([0, 200, 0]);
pub const RED: Rgb<u8> = Rgb([220, 30, 30]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// DejaVu Sans, Bitstream Vera license (assets/DejaVuSans.LICENSE).
static EMBEDDED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

const LABEL_SCALE: f32 = 22.0;
const BOX_THICKNESS: u32 = 2;

pub struct Annotator {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::embedded()
    }
}

impl Annotator {
    /// Load `preferred` if given and usable, else the embedded font.
    pub fn load(preferred: Option<&Path>) -> Self {
        let Some(path) = preferred else {
            return Self::embedded();
        };
        let loaded = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontArc::try_from_vec(bytes).map_err(|e| e.to_string()));
        match loaded {
            Ok(font) => {
                tracing::debug!(font = %path.display(), "annotation font loaded");
                Self::with_font(Some(font))
            }
            Err(error) => {
                tracing::warn!(font = %path.display(), %error, "unusable font; using built-in");
                Self::embedded()
            }
        }
    }

    pub fn embedded() -> Self {
        match FontArc::try_from_slice(EMBEDDED_FONT) {
            Ok(font) => Self::with_font(Some(font)),
            Err(e) => {
                tracing::error!(error = %e, "built-in font unreadable; captions disabled");
                Self::with_font(None)
            }
        }
    }

    fn with_font(font: Option<FontArc>) -> Self {
        Self {
            font,
            scale: PxScale::from(LABEL_SCALE),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Box a face and write `label` just above it (inside the frame).
    pub fn face(&self, canvas: &mut RgbImage, face: &FaceBox, label: &str, color: Rgb<u8>) {
        for inset in 0..BOX_THICKNESS {
            let w = face.width.saturating_sub(2 * inset);
            let h = face.height.saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((face.x + inset) as i32, (face.y + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(canvas, rect, color);
        }

        let text_y = face.y as i32 - LABEL_SCALE as i32 - 4;
        self.caption(canvas, label, face.x as i32, text_y.max(0), color);
    }

    pub fn caption(&self, canvas: &mut RgbImage, text: &str, x: i32, y: i32, color: Rgb<u8>) {
        if let Some(font) = &self.font {
            draw_text_mut(canvas, color, x, y, self.scale, font, text);
        }
    }

    /// Black frame carrying one or more lines of text.
    pub fn message_frame(&self, width: u32, height: u32, lines: &[&str]) -> RgbImage {
        let mut canvas = RgbImage::new(width, height);
        for (i, line) in lines.iter().enumerate() {
            let y = 30 + i as i32 * (LABEL_SCALE as i32 + 8);
            self.caption(&mut canvas, line, 20, y, WHITE);
        }
        canvas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn face() -> FaceBox {
        FaceBox {
            x: 10,
            y: 40,
            width: 30,
            height: 40,
            confidence: 1.0,
            neighbors: 3,
        }
    }

    #[test]
    fn test_face_box_and_label_drawn() {
        let annotator = Annotator::default();
        assert!(annotator.has_font());
        let mut canvas = RgbImage::new(100, 100);
        annotator.face(&mut canvas, &face(), "Unknown", RED);

        assert_eq!(*canvas.get_pixel(10, 40), RED);
        assert_eq!(*canvas.get_pixel(39, 79), RED);
        assert_eq!(*canvas.get_pixel(11, 41), RED);
        assert_eq!(*canvas.get_pixel(25, 60), BLACK);
        // Caption sits above the box.
        assert!((0..40).any(|y| (0..100).any(|x| *canvas.get_pixel(x, y) != BLACK)));
    }

    #[test]
    fn test_message_frame_carries_caption() {
        let frame = Annotator::embedded().message_frame(640, 480, &["Camera not available"]);
        assert_eq!(frame.dimensions(), (640, 480));
        let lit = frame.pixels().filter(|p| **p != BLACK).count();
        assert!(lit > 50, "only {lit} caption pixels");
        // Only the caption band is drawn on.
        assert!((100..480).all(|y| (0..640).all(|x| *frame.get_pixel(x, y) == BLACK)));
    }

    #[test]
    fn test_missing_preferred_font_falls_back_to_builtin() {
        let annotator = Annotator::load(Some(Path::new("/nonexistent/font.ttf")));
        assert!(annotator.has_font());
        let mut canvas = RgbImage::new(200, 60);
        annotator.caption(&mut canvas, "hello", 5, 5, WHITE);
        assert!(canvas.pixels().any(|p| *p != BLACK));
    }

    #[test]
    fn test_invalid_preferred_font_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.ttf");
        std::fs::write(&path, b"not a font").unwrap();
        assert!(Annotator::load(Some(&path)).has_font());
    }
}
