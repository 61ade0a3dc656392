//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD anchor-free detector over a small image pyramid and groups
//! the raw candidates by overlap. The Haar-style knobs (scale factor, minimum
//! neighbors, minimum size) map onto the pyramid step, the group support
//! threshold and a final size floor.

use crate::types::FaceBox;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const PYRAMID_MAX_LEVELS: usize = 3;
const PYRAMID_MIN_SHRINK: f32 = 0.5;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// `[detector]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    /// Pyramid step; must be greater than 1.0.
    pub scale_factor: f32,
    /// Overlapping candidates required to keep a detection.
    pub min_neighbors: u32,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Size floor applied during live recognition.
    pub live_min_size: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            live_min_size: 70,
        }
    }
}

/// A face detector over grayscale, equalized frames.
pub trait Detector {
    /// Boxes in descending confidence order. Boxes smaller than `min_size`
    /// on either side are dropped.
    fn detect(
        &mut self,
        gray: &GrayImage,
        min_size: Option<u32>,
    ) -> Result<Vec<FaceBox>, DetectorError>;
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(
        &mut self,
        gray: &GrayImage,
        min_size: Option<u32>,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        (**self).detect(gray, min_size)
    }
}

/// Raw detection in frame coordinates, before grouping.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    confidence: f32,
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
    params: DetectionParams,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, params: DetectionParams) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            scale_factor = params.scale_factor,
            min_neighbors = params.min_neighbors,
            "loaded SCRFD model"
        );

        // 6 outputs for the landmark-free export, 9 with keypoints.
        if num_outputs < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
            params,
        })
    }

    /// One SCRFD pass with the frame letterboxed at `shrink` × its natural fit.
    fn detect_level(&mut self, gray: &GrayImage, shrink: f32) -> Result<Vec<Candidate>, DetectorError> {
        let (input, letterbox) = self.preprocess(gray, shrink);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
                self.params.confidence_threshold,
            ));
        }

        Ok(candidates)
    }

    /// Letterbox a grayscale frame into an NCHW float tensor.
    ///
    /// `shrink < 1.0` places the frame smaller inside the canvas so faces
    /// that fill the frame fit the detector's receptive fields.
    fn preprocess(&self, gray: &GrayImage, shrink: f32) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        let frame = gray.as_raw();

        let scale_w = self.input_width as f32 / width as f32;
        let scale_h = self.input_height as f32 / height as f32;
        let scale = scale_w.min(scale_h) * shrink;

        let new_w = ((width as f32 * scale).round() as usize).clamp(1, self.input_width);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, self.input_height);
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };
        let resized = resize_bilinear(frame, width, height, new_w, new_h);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));

        for y in 0..self.input_height {
            for x in 0..self.input_width {
                let pixel = if y >= pad_y_start
                    && y < pad_y_start + new_h
                    && x >= pad_x_start
                    && x < pad_x_start + new_w
                {
                    resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
                } else {
                    SCRFD_MEAN // pad value normalizes to 0.0
                };

                let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, letterbox)
    }
}

impl Detector for ScrfdDetector {
    fn detect(
        &mut self,
        gray: &GrayImage,
        min_size: Option<u32>,
    ) -> Result<Vec<FaceBox>, DetectorError> {
        if gray.width() == 0 || gray.height() == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for shrink in pyramid_shrinks(self.params.scale_factor) {
            candidates.extend(self.detect_level(gray, shrink)?);
        }

        let grouped = group_candidates(
            candidates,
            self.params.nms_threshold,
            self.params.min_neighbors,
        );
        let faces = finalize(&grouped, gray.width(), gray.height(), min_size.unwrap_or(0));
        tracing::trace!(faces = faces.len(), "detection complete");
        Ok(faces)
    }
}

/// Canvas shrink per pyramid level: 1, 1/s, 1/s², … at most
/// [`PYRAMID_MAX_LEVELS`] levels and never below one half.
fn pyramid_shrinks(scale_factor: f32) -> Vec<f32> {
    let mut shrinks = vec![1.0f32];
    if scale_factor <= 1.0 {
        return shrinks;
    }
    let mut shrink = 1.0 / scale_factor;
    while shrinks.len() < PYRAMID_MAX_LEVELS && shrink >= PYRAMID_MIN_SHRINK {
        shrinks.push(shrink);
        shrink /= scale_factor;
    }
    shrinks
}

/// Bilinear resize of a packed 8-bit single-channel buffer.
fn resize_bilinear(frame: &[u8], width: usize, height: usize, new_w: usize, new_h: usize) -> Vec<u8> {
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;
    let mut resized = vec![0u8; new_w * new_h];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = frame[y0 * width + x0] as f32;
            let tr = frame[y0 * width + x1] as f32;
            let bl = frame[y1 * width + x0] as f32;
            let br = frame[y1 * width + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            resized[y * new_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }
    resized
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped by name; anything
/// else falls back to the standard positional layout where scores occupy
/// [0-2] and bboxes [3-5].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode candidates for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;

    let mut candidates = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w * stride) as f32;
        let anchor_cy = (anchor_idx / grid_w * stride) as f32;

        // [left, top, right, bottom] distances in stride units
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        let orig_x1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let orig_y1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let orig_x2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let orig_y2 = (y2 - letterbox.pad_y) / letterbox.scale;

        candidates.push(Candidate {
            x: orig_x1,
            y: orig_y1,
            width: orig_x2 - orig_x1,
            height: orig_y2 - orig_y1,
            confidence: score,
        });
    }

    candidates
}

/// Greedy overlap grouping: the strongest remaining candidate absorbs every
/// candidate overlapping it by more than `iou_threshold`. A group survives
/// when it absorbed at least `min_neighbors` others.
fn group_candidates(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    min_neighbors: u32,
) -> Vec<(Candidate, u32)> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut absorbed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if absorbed[i] {
            continue;
        }
        let mut neighbors = 0u32;
        for j in (i + 1)..candidates.len() {
            if !absorbed[j] && iou(&candidates[i], &candidates[j]) > iou_threshold {
                absorbed[j] = true;
                neighbors += 1;
            }
        }
        if neighbors >= min_neighbors {
            keep.push((candidates[i], neighbors));
        }
    }

    keep
}

/// Clamp grouped candidates to the frame and apply the size floor.
fn finalize(grouped: &[(Candidate, u32)], frame_w: u32, frame_h: u32, min_size: u32) -> Vec<FaceBox> {
    grouped
        .iter()
        .filter_map(|(c, neighbors)| {
            let x1 = c.x.max(0.0).min(frame_w as f32);
            let y1 = c.y.max(0.0).min(frame_h as f32);
            let x2 = (c.x + c.width).max(0.0).min(frame_w as f32);
            let y2 = (c.y + c.height).max(0.0).min(frame_h as f32);
            let width = (x2 - x1).round() as u32;
            let height = (y2 - y1).round() as u32;
            if width == 0 || height == 0 || width < min_size || height < min_size {
                return None;
            }
            Some(FaceBox {
                x: x1.round() as u32,
                y: y1.round() as u32,
                width,
                height,
                confidence: c.confidence,
                neighbors: *neighbors,
            })
        })
        .collect()
}

/// Intersection-over-Union between two candidates.
fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
