//! HTTP surface: live video, presence, diagnostics, sample upload, training
//! and dataset report.

use crate::store::{SqliteStore, StoreError};
use crate::streaming;
use actix_multipart::{Multipart, MultipartError};
use actix_web::error::BlockingError;
use actix_web::http::StatusCode;
use actix_web::web::{self, Data, Json, Path, Query};
use actix_web::{HttpResponse, ResponseError};
use rollcall_core::attendance::{presence, SessionId, SessionRegistry};
use futures::TryStreamExt;
use rollcall_core::dataset::validate_identity;
use rollcall_core::stream::CONTENT_TYPE;
use rollcall_core::{
    Config, DatasetBuilder, DatasetError, Detector, DetectorError, Normalizer, RosterError,
    ScrfdDetector, Trainer, TrainingError, UploadItem,
};
use rollcall_hw::CameraManager;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Upper bound on the summed size of one upload request.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

type DetectorLoader = dyn Fn(&Config) -> Result<Box<dyn Detector>, DetectorError> + Send + Sync;

/// Shared daemon state.
pub struct AppState {
    pub config: Arc<Config>,
    /// Held for the whole of a training run.
    training: Arc<Mutex<()>>,
    detectors: Arc<DetectorLoader>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self::with_detector_loader(
            config,
            Arc::new(|config: &Config| {
                ScrfdDetector::load(&config.paths.detector_model, config.detector.clone())
                    .map(|d| Box::new(d) as Box<dyn Detector>)
            }),
        )
    }

    fn with_detector_loader(config: Config, detectors: Arc<DetectorLoader>) -> Self {
        Self {
            config: Arc::new(config),
            training: Arc::new(Mutex::new(())),
            detectors,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("training refused: {0}")]
    TrainingRefused(TrainingError),
    #[error("training failed: {0}")]
    Training(TrainingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("face detector unavailable: {0}")]
    Detector(#[from] DetectorError),
    #[error("malformed upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("upload carries no files")]
    NoFiles,
    #[error("upload exceeds {} bytes", MAX_UPLOAD_BYTES)]
    UploadTooLarge,
    #[error("failed to start stream: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker pool unavailable")]
    Blocking(#[from] BlockingError),
}

impl From<TrainingError> for ApiError {
    fn from(e: TrainingError) -> Self {
        match e {
            TrainingError::EmptyDataset(_)
            | TrainingError::LabelMismatch { .. }
            | TrainingError::SampleShape { .. }
            | TrainingError::TrainingBackend(_) => ApiError::TrainingRefused(e),
            other => ApiError::Training(other),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TrainingRefused(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Dataset(DatasetError::InvalidIdentity(_))
            | ApiError::Multipart(_)
            | ApiError::NoFiles => StatusCode::BAD_REQUEST,
            ApiError::UploadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Detector(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/_health", web::get().to(health))
        .route("/sessions/{id}/video", web::get().to(video))
        .route("/sessions/{id}/presence", web::get().to(session_presence))
        .route("/camera/diagnostics", web::get().to(camera_diagnostics))
        .route("/identities/{code}/samples", web::post().to(upload_samples))
        .route("/model/train", web::post().to(train))
        .route("/dataset/report", web::get().to(dataset_report));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct VideoQuery {
    #[serde(default)]
    debug: Option<String>,
}

impl VideoQuery {
    fn debug(&self) -> bool {
        matches!(self.debug.as_deref(), Some("1" | "true" | "yes"))
    }
}

async fn video(
    state: Data<AppState>,
    id: Path<SessionId>,
    query: Query<VideoQuery>,
) -> Result<HttpResponse, ApiError> {
    let session = id.into_inner();
    let db = state.config.paths.database.clone();
    let exists = web::block(move || -> Result<bool, ApiError> {
        Ok(SqliteStore::open(&db)?.session(session)?.is_some())
    })
    .await??;
    if !exists {
        return Err(ApiError::SessionNotFound(session));
    }

    let debug = query.debug();
    tracing::info!(session, debug, "video stream requested");
    let body = streaming::spawn(Arc::clone(&state.config), session, debug)?;
    Ok(HttpResponse::Ok()
        .content_type(CONTENT_TYPE)
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(body))
}

async fn session_presence(state: Data<AppState>, id: Path<SessionId>) -> Result<HttpResponse, ApiError> {
    let session = id.into_inner();
    let db = state.config.paths.database.clone();
    let report = web::block(move || -> Result<_, ApiError> {
        let store = SqliteStore::open(&db)?;
        Ok(presence(&store, session)?)
    })
    .await??;

    match report {
        Some(report) => Ok(HttpResponse::Ok().json(report)),
        None => Err(ApiError::SessionNotFound(session)),
    }
}

async fn camera_diagnostics(state: Data<AppState>) -> Result<Json<rollcall_hw::CameraDiagnostics>, ApiError> {
    let camera = state.config.camera.clone();
    let diagnostics = web::block(move || CameraManager::new(camera).diagnostics()).await?;
    Ok(Json(diagnostics))
}

/// Multipart form; every file field becomes one upload item.
async fn upload_samples(
    state: Data<AppState>,
    code: Path<String>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let code = code.into_inner();
    validate_identity(&code)?;
    let items = read_uploads(&mut payload).await?;
    if items.is_empty() {
        return Err(ApiError::NoFiles);
    }
    tracing::info!(identity = %code, files = items.len(), "sample upload received");

    let config = Arc::clone(&state.config);
    let detectors = Arc::clone(&state.detectors);
    let summary = web::block(move || -> Result<_, ApiError> {
        let mut detector = (*detectors)(config.as_ref())?;
        let builder = DatasetBuilder::new(
            config.paths.dataset_dir.clone(),
            Normalizer::new(config.recognition.sample_size),
        );
        Ok(builder.ingest_uploads(&code, &items, &mut detector)?)
    })
    .await??;
    Ok(HttpResponse::Ok().json(summary))
}

async fn read_uploads(payload: &mut Multipart) -> Result<Vec<UploadItem>, ApiError> {
    let mut items = Vec::new();
    let mut total = 0usize;
    while let Some(mut field) = payload.try_next().await? {
        let Some(name) = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_owned)
        else {
            // Plain form values are not files.
            while field.try_next().await?.is_some() {}
            continue;
        };

        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            total += chunk.len();
            if total > MAX_UPLOAD_BYTES {
                return Err(ApiError::UploadTooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }
        items.push(UploadItem { name, bytes });
    }
    Ok(items)
}

async fn train(state: Data<AppState>) -> Result<HttpResponse, ApiError> {
    let config = Arc::clone(&state.config);
    let training = Arc::clone(&state.training);
    let summary = web::block(move || {
        let _running = training.lock().unwrap_or_else(PoisonError::into_inner);
        Trainer::from_config(&config).train()
    })
    .await??;
    Ok(HttpResponse::Ok().json(summary))
}

async fn dataset_report(state: Data<AppState>) -> Result<HttpResponse, ApiError> {
    let config = Arc::clone(&state.config);
    let report = web::block(move || Trainer::from_config(&config).inspect()).await??;
    Ok(HttpResponse::Ok().json(report))
}
