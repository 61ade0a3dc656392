//! Local binary pattern histogram (LBPH) face classifier.
//!
//! Circular extended LBP with bilinear sampling, a grid of per-cell
//! histograms normalized by cell area, and chi-square (alternative form)
//! nearest-template matching. Defaults match the common OpenCV parameters:
//! radius 1, 8 neighbors, 8×8 grid.

use crate::types::{FaceSample, Prediction};
use ndarray::{Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LbphError {
    #[error("empty training batch")]
    EmptyBatch,
    #[error("sample count {samples} does not match label count {labels}")]
    CountMismatch { samples: usize, labels: usize },
    #[error("label matrix must be a single column, got {rows}x{cols}")]
    LabelShape { rows: usize, cols: usize },
    #[error("samples have mixed sizes: {first:?} vs {other:?}")]
    MixedSizes {
        first: (usize, usize),
        other: (usize, usize),
    },
    #[error("sample {rows}x{cols} too small for radius {radius} and a {grid_x}x{grid_y} grid")]
    SampleTooSmall {
        rows: usize,
        cols: usize,
        radius: u32,
        grid_x: u32,
        grid_y: u32,
    },
    #[error("probe is {actual:?}, model was trained on {expected:?}")]
    ProbeSize {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("model has not been trained")]
    NotTrained,
}

/// LBPH operator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    fn bins(&self) -> usize {
        1usize << self.neighbors
    }
}

/// Training samples in one of the container layouts a backend may accept.
pub enum SampleBatch<'a> {
    /// Ordered, growable sequence of owned samples.
    Sequence(&'a [FaceSample]),
    /// Fixed-length boxed slice of borrowed views.
    Frozen(Box<[ArrayView2<'a, u8>]>),
    /// One contiguous N×H×W block.
    Packed(Array3<u8>),
}

impl SampleBatch<'_> {
    pub fn len(&self) -> usize {
        match self {
            SampleBatch::Sequence(s) => s.len(),
            SampleBatch::Frozen(v) => v.len(),
            SampleBatch::Packed(a) => a.len_of(Axis(0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn views(&self) -> Vec<ArrayView2<'_, u8>> {
        match self {
            SampleBatch::Sequence(s) => s.iter().map(FaceSample::view).collect(),
            SampleBatch::Frozen(v) => v.iter().map(|view| view.view()).collect(),
            SampleBatch::Packed(a) => a.outer_iter().collect(),
        }
    }
}

/// Training labels, flat or as an N×1 column.
pub enum LabelBatch<'a> {
    Flat(ArrayView1<'a, i32>),
    Column(ArrayView2<'a, i32>),
}

impl LabelBatch<'_> {
    fn to_vec(&self) -> Result<Vec<i32>, LbphError> {
        match self {
            LabelBatch::Flat(v) => Ok(v.to_vec()),
            LabelBatch::Column(m) => {
                let (rows, cols) = m.dim();
                if cols != 1 {
                    return Err(LbphError::LabelShape { rows, cols });
                }
                Ok(m.column(0).to_vec())
            }
        }
    }
}

/// An engine that can be fitted on a labeled batch.
pub trait TrainingEngine {
    /// Replace all learned state with a fit on `samples`/`labels`.
    /// On error the previous state is kept.
    fn fit(&mut self, samples: &SampleBatch<'_>, labels: &LabelBatch<'_>) -> Result<(), LbphError>;
}

/// Inference side of a trained model.
pub trait FaceClassifier {
    fn predict(&self, sample: &FaceSample) -> Result<Prediction, LbphError>;
}

/// Trained LBPH state: one spatial histogram per training sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LbphRecognizer {
    params: LbphParams,
    /// `(rows, cols)` every training sample had.
    sample_shape: Option<(usize, usize)>,
    histograms: Vec<Vec<f32>>,
    labels: Vec<i32>,
}

impl LbphRecognizer {
    pub fn new(params: LbphParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn is_trained(&self) -> bool {
        !self.histograms.is_empty()
    }

    /// Number of stored templates.
    pub fn templates(&self) -> usize {
        self.histograms.len()
    }

    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    /// Nearest template for a raw view.
    pub fn predict_view(&self, probe: ArrayView2<'_, u8>) -> Result<Prediction, LbphError> {
        let expected = self.sample_shape.ok_or(LbphError::NotTrained)?;
        if self.histograms.is_empty() {
            return Err(LbphError::NotTrained);
        }
        if probe.dim() != expected {
            return Err(LbphError::ProbeSize {
                expected,
                actual: probe.dim(),
            });
        }

        let query = spatial_histogram(&elbp(probe, &self.params), &self.params);

        let mut best = Prediction {
            label: -1,
            distance: f64::MAX,
        };
        for (hist, &label) in self.histograms.iter().zip(&self.labels) {
            let distance = chi_square_alt(hist, &query);
            if distance < best.distance {
                best = Prediction { label, distance };
            }
        }
        Ok(best)
    }
}

impl TrainingEngine for LbphRecognizer {
    fn fit(&mut self, samples: &SampleBatch<'_>, labels: &LabelBatch<'_>) -> Result<(), LbphError> {
        let labels = labels.to_vec()?;
        let views = samples.views();

        if views.is_empty() || labels.is_empty() {
            return Err(LbphError::EmptyBatch);
        }
        if views.len() != labels.len() {
            return Err(LbphError::CountMismatch {
                samples: views.len(),
                labels: labels.len(),
            });
        }

        let first = views[0].dim();
        if let Some(other) = views.iter().map(|v| v.dim()).find(|&d| d != first) {
            return Err(LbphError::MixedSizes { first, other });
        }

        let p = &self.params;
        let border = 2 * p.radius as usize;
        let (rows, cols) = first;
        if rows <= border
            || cols <= border
            || rows - border < p.grid_y as usize
            || cols - border < p.grid_x as usize
        {
            return Err(LbphError::SampleTooSmall {
                rows,
                cols,
                radius: p.radius,
                grid_x: p.grid_x,
                grid_y: p.grid_y,
            });
        }

        let histograms = views
            .iter()
            .map(|v| spatial_histogram(&elbp(*v, p), p))
            .collect();

        self.sample_shape = Some(first);
        self.histograms = histograms;
        self.labels = labels;
        tracing::debug!(
            templates = self.histograms.len(),
            rows,
            cols,
            "LBPH model fitted"
        );
        Ok(())
    }
}

impl FaceClassifier for LbphRecognizer {
    fn predict(&self, sample: &FaceSample) -> Result<Prediction, LbphError> {
        self.predict_view(sample.view())
    }
}

/// Circular extended LBP codes. The output is smaller than the input by
/// `radius` on every side.
fn elbp(src: ArrayView2<'_, u8>, params: &LbphParams) -> Array2<u32> {
    let (rows, cols) = src.dim();
    let r = params.radius as usize;
    let mut dst = Array2::<u32>::zeros((rows - 2 * r, cols - 2 * r));

    for n in 0..params.neighbors {
        let angle = 2.0 * PI * n as f64 / params.neighbors as f64;
        let x = params.radius as f64 * angle.cos();
        let y = -(params.radius as f64) * angle.sin();

        let (fx, fy) = (x.floor() as isize, y.floor() as isize);
        let (cx, cy) = (x.ceil() as isize, y.ceil() as isize);
        let (tx, ty) = (x - x.floor(), y - y.floor());
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;

        for i in r..rows - r {
            for j in r..cols - r {
                let at = |dy: isize, dx: isize| {
                    src[[(i as isize + dy) as usize, (j as isize + dx) as usize]] as f64
                };
                let t = w1 * at(fy, fx) + w2 * at(fy, cx) + w3 * at(cy, fx) + w4 * at(cy, cx);
                let center = src[[i, j]] as f64;
                if t > center || (t - center).abs() < f32::EPSILON as f64 {
                    dst[[i - r, j - r]] += 1 << n;
                }
            }
        }
    }

    dst
}

/// Concatenated per-cell histograms, each normalized by its cell area.
fn spatial_histogram(codes: &Array2<u32>, params: &LbphParams) -> Vec<f32> {
    let bins = params.bins();
    let (rows, cols) = codes.dim();
    let cell_h = rows / params.grid_y as usize;
    let cell_w = cols / params.grid_x as usize;
    let area = (cell_h * cell_w) as f32;

    let mut out = vec![0.0f32; params.grid_x as usize * params.grid_y as usize * bins];
    for gy in 0..params.grid_y as usize {
        for gx in 0..params.grid_x as usize {
            let base = (gy * params.grid_x as usize + gx) * bins;
            for y in gy * cell_h..(gy + 1) * cell_h {
                for x in gx * cell_w..(gx + 1) * cell_w {
                    out[base + codes[[y, x]] as usize] += 1.0;
                }
            }
            for v in &mut out[base..base + bins] {
                *v /= area;
            }
        }
    }
    out
}

/// `2 · Σ (a - b)² / (a + b)`, skipping empty bin pairs.
fn chi_square_alt(a: &[f32], b: &[f32]) -> f64 {
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let denom = x + y;
            if denom.abs() > f64::EPSILON {
                (x - y).powi(2) / denom
            } else {
                0.0
            }
        })
        .sum();
    2.0 * sum
}
