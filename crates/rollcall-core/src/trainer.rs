//! Model training from the on-disk dataset.
//!
//! Loads every sample through the [`Normalizer`], validates the set, fits the
//! classifier through an ordered ladder of input layouts and persists the
//! result. Nothing is written unless the fit succeeds.

use crate::artifact::{self, ArtifactError};
use crate::config::Config;
use crate::dataset::{list_identities, list_samples, DatasetError};
use crate::lbph::{LabelBatch, LbphParams, LbphRecognizer, SampleBatch, TrainingEngine};
use crate::normalize::Normalizer;
use crate::types::{FaceSample, LabelMap, SampleSize};
use ndarray::{Array1, Axis};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Samples inspected by validation and by the dataset report.
const INSPECTED_SAMPLES: usize = 5;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("dataset is empty: no loadable samples under {0}")]
    EmptyDataset(PathBuf),
    #[error("{samples} samples but {labels} labels")]
    LabelMismatch { samples: usize, labels: usize },
    #[error("sample {index} is malformed: {reason}")]
    SampleShape { index: usize, reason: String },
    #[error("every training layout was rejected: {0}")]
    TrainingBackend(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Samples, their labels and the code each label stands for.
#[derive(Debug, Default)]
pub struct TrainingSet {
    pub samples: Vec<FaceSample>,
    pub labels: Vec<i32>,
    pub label_map: LabelMap,
    /// Identity code of each sample, parallel to `samples`.
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub identities: usize,
    pub samples: usize,
    /// Name of the layout the engine accepted.
    pub layout: &'static str,
    pub label_map: LabelMap,
    pub model_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SampleStats {
    pub identity: String,
    pub shape: [usize; 2],
    pub contiguous: bool,
    pub min: u8,
    pub max: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub dataset: PathBuf,
    pub identities: usize,
    pub total_samples: usize,
    pub label_map: LabelMap,
    pub first_samples: Vec<SampleStats>,
}

#[derive(Debug, Clone, Copy)]
enum SampleLayout {
    List,
    Tuple,
    Packed,
}

#[derive(Debug, Clone, Copy)]
enum LabelLayout {
    Flat,
    Column,
}

/// Tried in order; the first layout the engine accepts wins.
const LADDER: [(&str, SampleLayout, LabelLayout); 6] = [
    ("list", SampleLayout::List, LabelLayout::Flat),
    ("tuple", SampleLayout::Tuple, LabelLayout::Flat),
    ("list+labels_col", SampleLayout::List, LabelLayout::Column),
    ("tuple+labels_col", SampleLayout::Tuple, LabelLayout::Column),
    ("packed", SampleLayout::Packed, LabelLayout::Flat),
    ("packed+labels_col", SampleLayout::Packed, LabelLayout::Column),
];

pub struct Trainer {
    dataset_dir: PathBuf,
    model_dir: PathBuf,
    normalizer: Normalizer,
    extensions: Vec<String>,
    params: LbphParams,
}

impl Trainer {
    pub fn new(
        dataset_dir: impl Into<PathBuf>,
        model_dir: impl Into<PathBuf>,
        sample_size: SampleSize,
        extensions: Vec<String>,
        params: LbphParams,
    ) -> Self {
        Self {
            dataset_dir: dataset_dir.into(),
            model_dir: model_dir.into(),
            normalizer: Normalizer::new(sample_size),
            extensions,
            params,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.paths.dataset_dir,
            &config.paths.model_dir,
            config.recognition.sample_size,
            config.recognition.extensions.clone(),
            config.recognition.lbph,
        )
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    /// Enumerate identities in sorted order and load their samples. Labels
    /// 0..N-1 go only to identities that contributed at least one sample.
    pub fn load_training_set(&self) -> Result<TrainingSet, TrainingError> {
        let mut set = TrainingSet::default();

        for (code, dir) in list_identities(&self.dataset_dir)? {
            let label = set.label_map.len() as i32;
            let mut loaded = 0usize;

            for path in list_samples(&dir, &self.extensions)? {
                let sample = image::open(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|img| self.normalizer.normalize(&img).map_err(|e| e.to_string()));
                match sample {
                    Ok(sample) => {
                        set.samples.push(sample);
                        set.labels.push(label);
                        set.codes.push(code.clone());
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable sample")
                    }
                }
            }

            if loaded == 0 {
                tracing::warn!(identity = %code, "identity has no usable samples; no label assigned");
                continue;
            }
            tracing::debug!(identity = %code, label, samples = loaded, "identity loaded");
            set.label_map.insert(label, code);
        }

        Ok(set)
    }

    /// Refuse sets that would produce a useless or corrupt model.
    pub fn validate(&self, set: &TrainingSet) -> Result<(), TrainingError> {
        if set.samples.is_empty() {
            return Err(TrainingError::EmptyDataset(self.dataset_dir.clone()));
        }
        if set.samples.len() != set.labels.len() {
            return Err(TrainingError::LabelMismatch {
                samples: set.samples.len(),
                labels: set.labels.len(),
            });
        }

        let expected = self.normalizer.size().shape();
        for (index, sample) in set.samples.iter().take(INSPECTED_SAMPLES).enumerate() {
            if sample.shape() != expected {
                return Err(TrainingError::SampleShape {
                    index,
                    reason: format!("shape {:?}, expected {expected:?}", sample.shape()),
                });
            }
            if !sample.is_contiguous() {
                return Err(TrainingError::SampleShape {
                    index,
                    reason: "not contiguous".into(),
                });
            }
        }
        Ok(())
    }

    /// Load, validate, fit and persist.
    pub fn train(&self) -> Result<TrainingSummary, TrainingError> {
        let set = self.load_training_set()?;
        self.validate(&set)?;

        let mut recognizer = LbphRecognizer::new(self.params);
        let layout = fit_with_fallback(&mut recognizer, &set)?;
        artifact::save(&self.model_dir, &recognizer, &set.label_map)?;

        tracing::info!(
            identities = set.label_map.len(),
            samples = set.samples.len(),
            layout,
            "model trained"
        );
        Ok(TrainingSummary {
            identities: set.label_map.len(),
            samples: set.samples.len(),
            layout,
            label_map: set.label_map,
            model_dir: self.model_dir.clone(),
        })
    }

    /// Operator report on what training would see.
    pub fn inspect(&self) -> Result<DatasetReport, TrainingError> {
        let set = self.load_training_set()?;
        let first_samples = set
            .samples
            .iter()
            .zip(&set.codes)
            .take(INSPECTED_SAMPLES)
            .map(|(sample, code)| {
                let (rows, cols) = sample.shape();
                let pixels = sample.pixels();
                SampleStats {
                    identity: code.clone(),
                    shape: [rows, cols],
                    contiguous: sample.is_contiguous(),
                    min: pixels.iter().copied().min().unwrap_or(0),
                    max: pixels.iter().copied().max().unwrap_or(0),
                }
            })
            .collect();

        Ok(DatasetReport {
            dataset: self.dataset_dir.clone(),
            identities: set.label_map.len(),
            total_samples: set.samples.len(),
            label_map: set.label_map,
            first_samples,
        })
    }
}

/// Walk the layout ladder until the engine accepts one. Returns the name of
/// the winning layout.
pub fn fit_with_fallback<E>(engine: &mut E, set: &TrainingSet) -> Result<&'static str, TrainingError>
where
    E: TrainingEngine + ?Sized,
{
    let labels = Array1::from(set.labels.clone());
    let mut failures = Vec::new();

    for (name, samples, label_layout) in LADDER {
        match attempt(engine, set, &labels, samples, label_layout) {
            Ok(()) => {
                if !failures.is_empty() {
                    tracing::info!(layout = name, rejected = failures.len(), "fallback layout accepted");
                }
                return Ok(name);
            }
            Err(reason) => {
                tracing::warn!(layout = name, %reason, "training layout rejected");
                failures.push(format!("{name}:{reason}"));
            }
        }
    }

    Err(TrainingError::TrainingBackend(failures.join(" | ")))
}

fn attempt<E>(
    engine: &mut E,
    set: &TrainingSet,
    labels: &Array1<i32>,
    samples: SampleLayout,
    label_layout: LabelLayout,
) -> Result<(), String>
where
    E: TrainingEngine + ?Sized,
{
    let label_batch = match label_layout {
        LabelLayout::Flat => LabelBatch::Flat(labels.view()),
        LabelLayout::Column => LabelBatch::Column(labels.view().insert_axis(Axis(1))),
    };

    let sample_batch = match samples {
        SampleLayout::List => SampleBatch::Sequence(&set.samples),
        SampleLayout::Tuple => SampleBatch::Frozen(set.samples.iter().map(FaceSample::view).collect()),
        SampleLayout::Packed => {
            let views: Vec<_> = set.samples.iter().map(FaceSample::view).collect();
            let packed = ndarray::stack(Axis(0), &views).map_err(|e| e.to_string())?;
            SampleBatch::Packed(packed)
        }
    };

    engine
        .fit(&sample_batch, &label_batch)
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lbph::{FaceClassifier, LbphError};
    use image::{GrayImage, Luma};
    use std::fs;

    fn exts() -> Vec<String> {
        vec!["png".into(), "jpg".into(), "jpeg".into()]
    }

    fn trainer(root: &Path, models: &Path) -> Trainer {
        Trainer::new(root, models, SampleSize::default(), exts(), LbphParams::default())
    }

    fn write_face(dir: &Path, name: &str, seed: u32) {
        fs::create_dir_all(dir).unwrap();
        GrayImage::from_fn(120, 140, |x, y| Luma([((x * seed + y * (seed + 7) + x * y) % 253) as u8]))
            .save(dir.join(name))
            .unwrap();
    }

    /// Rejects every layout except the ones whose names it was told to accept.
    struct PickyEngine {
        accept_packed: bool,
        accept_column: bool,
        seen: Vec<String>,
    }

    impl TrainingEngine for PickyEngine {
        fn fit(&mut self, samples: &SampleBatch<'_>, labels: &LabelBatch<'_>) -> Result<(), LbphError> {
            let packed = matches!(samples, SampleBatch::Packed(_));
            let column = matches!(labels, LabelBatch::Column(_));
            self.seen.push(format!("{packed}/{column}"));
            if packed == self.accept_packed && column == self.accept_column {
                Ok(())
            } else {
                Err(LbphError::EmptyBatch)
            }
        }
    }

    fn tiny_set() -> TrainingSet {
        let sample = FaceSample::new(ndarray::Array2::zeros((4, 4)));
        TrainingSet {
            samples: vec![sample.clone(), sample],
            labels: vec![0, 1],
            label_map: LabelMap::from([(0, "a".into()), (1, "b".into())]),
            codes: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn test_labels_follow_sorted_identities() {
        let data = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        write_face(&data.path().join("bob"), "1.png", 5);
        write_face(&data.path().join("alice"), "1.png", 3);
        write_face(&data.path().join("alice"), "2.png", 4);
        // No usable files: gets no label.
        fs::create_dir_all(data.path().join("carl")).unwrap();
        fs::write(data.path().join("carl").join("notes.txt"), b"x").unwrap();

        let set = trainer(data.path(), models.path()).load_training_set().unwrap();
        assert_eq!(
            set.label_map,
            LabelMap::from([(0, "alice".to_string()), (1, "bob".to_string())])
        );
        assert_eq!(set.labels, vec![0, 0, 1]);
    }

    #[test]
    fn test_train_and_recognize() {
        let data = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        write_face(&data.path().join("alice"), "1.png", 3);
        write_face(&data.path().join("alice"), "2.png", 4);
        write_face(&data.path().join("bob"), "1.png", 11);

        let t = trainer(data.path(), models.path());
        let summary = t.train().unwrap();
        assert_eq!(summary.identities, 2);
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.layout, "list");

        let loaded = artifact::load(models.path()).unwrap();
        assert_eq!(loaded.labels[&0], "alice");

        let probe = t.load_training_set().unwrap().samples.remove(1);
        let prediction = loaded.recognizer.predict(&probe).unwrap();
        assert_eq!(prediction.label, 0);
        assert!(prediction.distance <= 95.0);
    }

    #[test]
    fn test_empty_dataset_writes_nothing() {
        let data = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        let err = trainer(&data.path().join("missing"), models.path())
            .train()
            .unwrap_err();
        assert!(matches!(err, TrainingError::EmptyDataset(_)));
        assert!(!artifact::model_path(models.path()).exists());
    }

    #[test]
    fn test_failed_retrain_keeps_previous_model() {
        let data = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        write_face(&data.path().join("alice"), "1.png", 3);
        trainer(data.path(), models.path()).train().unwrap();
        let before = fs::read(artifact::model_path(models.path())).unwrap();

        fs::remove_dir_all(data.path().join("alice")).unwrap();
        assert!(trainer(data.path(), models.path()).train().is_err());
        assert_eq!(fs::read(artifact::model_path(models.path())).unwrap(), before);
    }

    #[test]
    fn test_validate_rejects_wrong_shape() {
        let models = tempfile::tempdir().unwrap();
        let t = trainer(models.path(), models.path());
        let err = t.validate(&tiny_set()).unwrap_err();
        assert!(matches!(err, TrainingError::SampleShape { index: 0, .. }));

        let mut mismatched = tiny_set();
        mismatched.labels.pop();
        assert!(matches!(
            t.validate(&mismatched),
            Err(TrainingError::LabelMismatch { samples: 2, labels: 1 })
        ));
    }

    #[test]
    fn test_ladder_falls_back_in_order() {
        let mut engine = PickyEngine {
            accept_packed: true,
            accept_column: false,
            seen: Vec::new(),
        };
        let layout = fit_with_fallback(&mut engine, &tiny_set()).unwrap();
        assert_eq!(layout, "packed");
        assert_eq!(
            engine.seen,
            vec!["false/false", "false/false", "false/true", "false/true", "true/false"]
        );
    }

    #[test]
    fn test_ladder_reports_every_failure() {
        let mut engine = PickyEngine {
            accept_packed: true,
            accept_column: true,
            seen: Vec::new(),
        };
        let mut set = tiny_set();
        // Mixed shapes make the packed layouts fail before reaching the engine.
        set.samples[1] = FaceSample::new(ndarray::Array2::zeros((3, 3)));

        let err = fit_with_fallback(&mut engine, &set).unwrap_err();
        let TrainingError::TrainingBackend(msg) = err else {
            panic!("unexpected error: {err}");
        };
        let names: Vec<&str> = msg
            .split(" | ")
            .map(|part| part.split(':').next().unwrap())
            .collect();
        assert_eq!(
            names,
            LADDER.iter().map(|(name, _, _)| *name).collect::<Vec<_>>()
        );
        assert_eq!(engine.seen.len(), 4);
    }

    #[test]
    fn test_inspect_report() {
        let data = tempfile::tempdir().unwrap();
        write_face(&data.path().join("alice"), "1.png", 3);
        write_face(&data.path().join("bob"), "1.jpg", 9);

        let report = trainer(data.path(), data.path()).inspect().unwrap();
        assert_eq!(report.identities, 2);
        assert_eq!(report.total_samples, 2);
        assert_eq!(report.first_samples.len(), 2);
        assert_eq!(report.first_samples[0].shape, [200, 200]);
        assert!(report.first_samples[0].contiguous);
        assert_eq!(report.first_samples[1].identity, "bob");
    }
}
