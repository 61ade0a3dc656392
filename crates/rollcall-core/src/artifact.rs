//! Trained model persistence: `lbph.bin` (bincode) + `labels.json`.
//!
//! Both files are written to uniquely named temporaries in the model directory
//! and renamed into place, model first. The model file embeds its own copy of the label map so a pair left
//! mismatched by an interrupted write is detected on load.

use crate::lbph::LbphRecognizer;
use crate::types::LabelMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const MODEL_FILE: &str = "lbph.bin";
pub const LABELS_FILE: &str = "labels.json";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("no trained model at {0}")]
    Missing(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("label map encoding: {0}")]
    Labels(#[from] serde_json::Error),
    #[error("{MODEL_FILE} and {LABELS_FILE} disagree; retrain the model")]
    Inconsistent,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    recognizer: LbphRecognizer,
    labels: LabelMap,
}

/// A trained classifier and the labels it predicts.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub recognizer: LbphRecognizer,
    pub labels: LabelMap,
}

pub fn model_path(dir: &Path) -> PathBuf {
    dir.join(MODEL_FILE)
}

pub fn labels_path(dir: &Path) -> PathBuf {
    dir.join(LABELS_FILE)
}

/// Write both artifacts atomically (per file), model first.
pub fn save(dir: &Path, recognizer: &LbphRecognizer, labels: &LabelMap) -> Result<(), ArtifactError> {
    fs::create_dir_all(dir).map_err(|source| ArtifactError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let model = bincode::serialize(&ModelFile {
        recognizer: recognizer.clone(),
        labels: labels.clone(),
    })?;
    let label_json = serde_json::to_vec_pretty(labels)?;

    write_atomic(&model_path(dir), &model)?;
    write_atomic(&labels_path(dir), &label_json)?;

    tracing::info!(
        dir = %dir.display(),
        labels = labels.len(),
        bytes = model.len(),
        "model artifacts written"
    );
    Ok(())
}

/// Load and cross-check both artifacts.
pub fn load(dir: &Path) -> Result<ModelArtifacts, ArtifactError> {
    let model_file = model_path(dir);
    let labels_file = labels_path(dir);
    if !model_file.exists() || !labels_file.exists() {
        return Err(ArtifactError::Missing(dir.to_path_buf()));
    }

    let model_bytes = read(&model_file)?;
    let ModelFile { recognizer, labels } = bincode::deserialize(&model_bytes)?;

    let on_disk: LabelMap = serde_json::from_slice(&read(&labels_file)?)?;
    if on_disk != labels {
        tracing::warn!(
            embedded = labels.len(),
            on_disk = on_disk.len(),
            "label map mismatch between model artifacts"
        );
        return Err(ArtifactError::Inconsistent);
    }

    tracing::info!(
        dir = %dir.display(),
        labels = labels.len(),
        templates = recognizer.templates(),
        "model artifacts loaded"
    );
    Ok(ModelArtifacts { recognizer, labels })
}

fn read(path: &Path) -> Result<Vec<u8>, ArtifactError> {
    fs::read(path).map_err(|source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let io_err = |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
