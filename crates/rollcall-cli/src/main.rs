use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::dataset::{CaptureControl, CaptureObserver, Pose, POSES};
use rollcall_core::{
    Config, DatasetBuilder, FaceBox, Normalizer, ScrfdDetector, Trainer, UploadItem,
    UploadOutcome,
};
use rollcall_hw::{Camera, CameraError, CameraManager, Frame};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall face attendance CLI")]
struct Cli {
    /// Configuration file (default: $ROLLCALL_CONFIG or /etc/rollcall/rollcall.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture front, left and right samples for an identity
    Capture {
        /// Identity code (e.g., student code)
        code: String,
        /// Seconds to wait for a face in each pose
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Add samples from existing photos
    Upload {
        code: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Train the recognition model from the dataset
    Train,
    /// Show what training would see
    Inspect,
    /// Open a camera, read one frame and report
    Diag,
    /// List V4L2 capture devices
    Devices,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Capture { code, timeout } => {
            let timeout = Duration::from_secs(timeout.unwrap_or(config.capture.pose_timeout_secs));
            capture(&config, &code, timeout)
        }
        Commands::Upload { code, files } => upload(&config, &code, &files),
        Commands::Train => train(&config),
        Commands::Inspect => {
            let report = Trainer::from_config(&config).inspect()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Diag => {
            println!("Running camera diagnostics...");
            let diagnostics = CameraManager::new(config.camera.clone()).diagnostics();
            println!("{}", serde_json::to_string_pretty(&diagnostics)?);
            if !diagnostics.ok {
                anyhow::bail!("no usable camera");
            }
            Ok(())
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
    }
}

fn capture(config: &Config, code: &str, timeout: Duration) -> Result<()> {
    let mut opened = match CameraManager::new(config.camera.clone()).open() {
        Ok(opened) => opened,
        Err(unavailable) => {
            for error in &unavailable.errors {
                eprintln!("  {error}");
            }
            eprintln!("hint: {}", unavailable.hint);
            return Err(unavailable.into());
        }
    };
    println!("camera: {}", opened.strategy);

    let mut detector = ScrfdDetector::load(&config.paths.detector_model, config.detector.clone())
        .context("failed to load face detector")?;
    let builder = builder(config);
    let mut observer = ConsoleObserver::new(timeout);
    let report = builder.capture_guided(
        code,
        opened.device.as_mut(),
        &mut detector,
        &mut observer,
        Duration::from_millis(config.capture.pose_pause_ms),
    )?;

    println!("saved {} of {} samples for {code}", report.saved, POSES.len());
    if report.cancelled {
        eprintln!("capture stopped early");
    }
    auto_train(config, report.saved)
}

fn upload(config: &Config, code: &str, files: &[PathBuf]) -> Result<()> {
    let items: Vec<UploadItem> = files.iter().map(|path| read_upload(path)).collect();

    let mut detector = ScrfdDetector::load(&config.paths.detector_model, config.detector.clone())
        .context("failed to load face detector")?;
    let summary = builder(config).ingest_uploads(code, &items, &mut detector)?;

    for (name, outcome) in &summary.items {
        match outcome {
            UploadOutcome::Saved(path) => println!("  saved    {name} -> {}", path.display()),
            UploadOutcome::Skipped(reason) => println!("  skipped  {name} ({reason:?})"),
        }
    }
    println!("{} saved, {} skipped", summary.saved, summary.skipped);
    auto_train(config, summary.saved)
}

/// Unreadable files become empty uploads and are reported as skipped.
fn read_upload(path: &Path) -> UploadItem {
    let bytes = std::fs::read(path).unwrap_or_else(|e| {
        tracing::warn!(file = %path.display(), error = %e, "cannot read upload");
        Vec::new()
    });
    UploadItem {
        name: path.display().to_string(),
        bytes,
    }
}

fn train(config: &Config) -> Result<()> {
    let summary = Trainer::from_config(config).train()?;
    println!(
        "trained on {} samples of {} identities ({} layout)",
        summary.samples, summary.identities, summary.layout
    );
    println!("{}", serde_json::to_string_pretty(&summary.label_map)?);
    Ok(())
}

fn auto_train(config: &Config, saved: usize) -> Result<()> {
    if config.capture.auto_train && saved > 0 {
        println!("retraining...");
        train(config)?;
    }
    Ok(())
}

fn builder(config: &Config) -> DatasetBuilder {
    DatasetBuilder::new(
        config.paths.dataset_dir.clone(),
        Normalizer::new(config.recognition.sample_size),
    )
}

/// Prints pose prompts and gives up on a pose after `timeout` without a face.
struct ConsoleObserver {
    timeout: Duration,
    pose_started: Instant,
}

impl ConsoleObserver {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pose_started: Instant::now(),
        }
    }

    fn check_timeout(&self) -> CaptureControl {
        if self.pose_started.elapsed() > self.timeout {
            eprintln!("no face seen for {}s; giving up", self.timeout.as_secs());
            CaptureControl::Cancel
        } else {
            CaptureControl::Continue
        }
    }
}

impl CaptureObserver for ConsoleObserver {
    fn pose(&mut self, index: usize, pose: &Pose) -> CaptureControl {
        println!("[{}/{}] {}", index + 1, POSES.len(), pose.prompt);
        self.pose_started = Instant::now();
        CaptureControl::Continue
    }

    fn frame(&mut self, _frame: &Frame, _faces: &[FaceBox]) -> CaptureControl {
        self.check_timeout()
    }

    fn read_failed(&mut self, _error: &CameraError) -> CaptureControl {
        self.check_timeout()
    }

    fn saved(&mut self, path: &Path) -> CaptureControl {
        println!("  saved {}", path.display());
        CaptureControl::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_times_out_per_pose() {
        let mut observer = ConsoleObserver::new(Duration::ZERO);
        observer.pose(0, &POSES[0]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(
            observer.read_failed(&CameraError::CaptureFailed("x".into())),
            CaptureControl::Cancel
        );

        let mut patient = ConsoleObserver::new(Duration::from_secs(60));
        patient.pose(1, &POSES[1]);
        assert_eq!(
            patient.read_failed(&CameraError::CaptureFailed("x".into())),
            CaptureControl::Continue
        );
    }

    #[test]
    fn test_unreadable_upload_is_empty() {
        let item = read_upload(Path::new("/nonexistent/photo.jpg"));
        assert!(item.bytes.is_empty());
        assert_eq!(item.name, "/nonexistent/photo.jpg");
    }

    #[test]
    fn test_cli_parses_global_config() {
        let cli = Cli::try_parse_from(["rollcall", "--config", "/tmp/r.toml", "upload", "s1", "a.jpg"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/r.toml")));
        match cli.command {
            Commands::Upload { code, files } => {
                assert_eq!(code, "s1");
                assert_eq!(files, vec![PathBuf::from("a.jpg")]);
            }
            _ => panic!("expected upload"),
        }
        assert!(Cli::try_parse_from(["rollcall", "upload", "s1"]).is_err());
    }
}
