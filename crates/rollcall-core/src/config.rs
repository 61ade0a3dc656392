use crate::detector::DetectionParams;
use crate::lbph::LbphParams;
use crate::types::SampleSize;
use rollcall_hw::{AcquisitionConfig, CameraSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// System-wide config file, used when nothing more specific is given.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/rollcall/rollcall.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full rollcall configuration, one TOML file with every field defaulted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub camera: AcquisitionConfig,
    pub detector: DetectionParams,
    pub recognition: RecognitionConfig,
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// `<dataset>/<identity_code>/<millis>.png`.
    pub dataset_dir: PathBuf,
    /// Holds `lbph.bin` and `labels.json`.
    pub model_dir: PathBuf,
    /// SQLite database with students, enrollments, sessions and attendance.
    pub database: PathBuf,
    /// SCRFD ONNX model.
    pub detector_model: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data = default_data_dir();
        Self {
            dataset_dir: data.join("dataset"),
            model_dir: data.join("model"),
            database: data.join("rollcall.db"),
            detector_model: data.join("models").join("det_10g.onnx"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Maximum accepted LBPH distance. Lower is more similar.
    pub distance_threshold: f64,
    pub cooldown_secs: u64,
    pub sample_size: SampleSize,
    pub lbph: LbphParams,
    /// Accept new marks for sessions flagged closed.
    pub mark_closed_sessions: bool,
    /// Dataset file extensions loaded at training time.
    pub extensions: Vec<String>,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 95.0,
            cooldown_secs: 8,
            sample_size: SampleSize::default(),
            lbph: LbphParams::default(),
            mark_closed_sessions: false,
            extensions: vec!["png".into(), "jpg".into(), "jpeg".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub pose_pause_ms: u64,
    pub pose_timeout_secs: u64,
    /// Retrain after a capture or upload that saved something.
    pub auto_train: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pose_pause_ms: 200,
            pose_timeout_secs: 30,
            auto_train: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub jpeg_quality: u8,
    pub unavailable_interval_ms: u64,
    /// TTF font for captions; the built-in DejaVu Sans when unset.
    pub font_path: Option<PathBuf>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 80,
            unavailable_interval_ms: 500,
            font_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
        }
    }
}

impl Config {
    /// Load from `explicit`, else `$ROLLCALL_CONFIG`, else the system file if
    /// present, else defaults. `ROLLCALL_*` overrides are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("ROLLCALL_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let system = PathBuf::from(SYSTEM_CONFIG_PATH);
                system.exists().then_some(system)
            });

        let mut config = match &path {
            Some(path) => Self::from_file(path)?,
            None => {
                tracing::debug!("no config file; using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_DATASET_DIR") {
            self.paths.dataset_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.paths.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DATABASE") {
            self.paths.database = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DETECTOR_MODEL") {
            self.paths.detector_model = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_CAMERA_SOURCE") {
            self.camera.source = CameraSource::parse(&v);
        }
        if let Some(v) = env_parse(&lookup, "ROLLCALL_DISTANCE_THRESHOLD") {
            self.recognition.distance_threshold = v;
        }
        if let Some(v) = env_parse(&lookup, "ROLLCALL_COOLDOWN_SECS") {
            self.recognition.cooldown_secs = v;
        }
        if let Some(v) = lookup("ROLLCALL_BIND") {
            self.server.bind = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        if !(d.scale_factor > 1.0) {
            return Err(ConfigError::Invalid(format!(
                "detector.scale_factor must be greater than 1.0, got {}",
                d.scale_factor
            )));
        }
        if !(0.0..=1.0).contains(&d.confidence_threshold) || !(0.0..=1.0).contains(&d.nms_threshold) {
            return Err(ConfigError::Invalid(
                "detector thresholds must lie in 0.0..=1.0".into(),
            ));
        }

        let r = &self.recognition;
        if !(r.distance_threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "recognition.distance_threshold must be non-negative, got {}",
                r.distance_threshold
            )));
        }
        let size = r.sample_size;
        if size.width == 0 || size.height == 0 {
            return Err(ConfigError::Invalid("recognition.sample_size must be non-zero".into()));
        }
        let lbph = &r.lbph;
        if lbph.radius == 0 || !(1..=8).contains(&lbph.neighbors) || lbph.grid_x == 0 || lbph.grid_y == 0 {
            return Err(ConfigError::Invalid(
                "recognition.lbph needs radius >= 1, 1..=8 neighbors and a non-empty grid".into(),
            ));
        }
        let border = 2 * lbph.radius;
        if size.width <= border + lbph.grid_x || size.height <= border + lbph.grid_y {
            return Err(ConfigError::Invalid(format!(
                "a {}x{} LBPH grid does not fit a {}x{} sample",
                lbph.grid_x, lbph.grid_y, size.width, size.height
            )));
        }
        if r.extensions.is_empty() {
            return Err(ConfigError::Invalid("recognition.extensions is empty".into()));
        }

        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "stream.jpeg_quality must be in 1..=100, got {}",
                self.stream.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}
