use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

use crate::bundle::ComposerDriver;
use crate::compose::{Compositor, ImageCompositor};
use crate::config::{self, AppConfig};
use crate::edges::{EdgeDetector, GradientEdgeDetector};
use crate::error::{DownloadError, SubmitError};
use crate::job::Job;
use crate::pipeline::{PipelineOrchestrator, Submission};
use crate::registry::JobRegistry;
use crate::storage::JobStorage;
use crate::stylize::{ReplicateStylizer, Stylizer};
use crate::worker::{BackgroundWorker, WorkerTimeouts};

mod rate_limit;

use rate_limit::RateLimiter;

/// Multipart framing allowance on top of the upload cap.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;
const FALLBACK_UPLOAD_NAME: &str = "upload";

/// The pluggable stages of the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub edge_detector: Arc<dyn EdgeDetector>,
    pub stylizer: Arc<dyn Stylizer>,
    pub compositor: Arc<dyn Compositor>,
}

impl Collaborators {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let stylizer = ReplicateStylizer::new(&config.stylize)?;
        if !stylizer.has_token() {
            warn!("REPLICATE_API_TOKEN not set; stylization jobs will fail");
        }
        Ok(Self {
            edge_detector: Arc::new(GradientEdgeDetector::new(&config.edges)),
            stylizer: Arc::new(stylizer),
            compositor: Arc::new(ImageCompositor::new(&config.compose)),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    registry: JobRegistry,
    storage: JobStorage,
    pipeline: PipelineOrchestrator,
    composer: ComposerDriver,
}

impl AppState {
    pub fn new(config: AppConfig, storage_root: PathBuf, collaborators: Collaborators) -> Result<Self> {
        let registry = JobRegistry::new();
        let storage = JobStorage::new(storage_root, config.storage.public_mount.clone());
        storage.ensure_root()?;

        let worker = BackgroundWorker::new(
            registry.clone(),
            collaborators.stylizer,
            WorkerTimeouts::from_config(&config.stylize),
        )?;
        let pipeline = PipelineOrchestrator::new(
            registry.clone(),
            storage.clone(),
            collaborators.edge_detector,
            Arc::new(worker),
        );
        let composer = ComposerDriver::new(registry.clone(), storage.clone(), collaborators.compositor);

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                storage,
                pipeline,
                composer,
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn storage(&self) -> &JobStorage {
        &self.inner.storage
    }
}

/// State wired with the default collaborators; relative storage roots
/// resolve against `data_dir`.
pub fn app_state_with_config(config: AppConfig, data_dir: &std::path::Path) -> Result<AppState> {
    let storage_root = config::resolve_relative_to(data_dir, &config.storage.root_dir);
    let collaborators = Collaborators::from_config(&config)?;
    AppState::new(config, storage_root, collaborators)
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    let config = state.config();
    let body_limit = usize::try_from(config.upload.max_file_size_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let cors = cors_layer(&config.server.cors_origins);
    let mount = state.storage().public_mount().to_string();
    let public_files = ServeDir::new(state.storage().root());

    let upload_route = rate_limited(post(stylize), config.upload.rate_limit_per_minute);

    let router = Router::new()
        .route("/health", get(health))
        .route("/stylize", upload_route)
        .route("/status/{job_id}", get(job_status))
        .route("/download/{job_id}", get(download));
    let router = if mount.is_empty() {
        router
    } else {
        router.nest_service(&format!("/{mount}"), public_files)
    };

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

fn rate_limited(route: MethodRouter<AppState>, per_minute: u32) -> MethodRouter<AppState> {
    if per_minute == 0 {
        return route;
    }
    let limiter = Arc::new(RateLimiter::per_minute(per_minute));
    route.route_layer(middleware::from_fn_with_state(limiter, rate_limit::enforce))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o.trim() == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

// ─── Handlers ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct StylizeInitiateResponse {
    pub job_id: String,
    pub edge_path: String,
}

struct Upload {
    filename: String,
    bytes: Bytes,
}

async fn stylize(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StylizeInitiateResponse>, AppError> {
    let upload_config = &state.config().upload;
    let max_bytes = upload_config.max_file_size_bytes();
    let mut upload: Option<Upload> = None;
    let mut prompt: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                if !upload_config.is_allowed_content_type(&content_type) {
                    return Err(AppError::UnsupportedMediaType(format!(
                        "Unsupported file type: {content_type}. Please upload JPEG, PNG, or HEIC."
                    )));
                }
                let filename = field
                    .file_name()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or(FALLBACK_UPLOAD_NAME)
                    .to_string();
                let bytes = field.bytes().await.map_err(multipart_error)?;
                if bytes.len() as u64 > max_bytes {
                    return Err(too_large(upload_config.max_file_size_mb));
                }
                upload = Some(Upload { filename, bytes });
            }
            "prompt" => {
                prompt = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {}
        }
    }

    let upload = upload.ok_or_else(|| AppError::BadRequest("missing 'file' field".to_string()))?;
    let receipt = state
        .inner
        .pipeline
        .submit(Submission {
            original_filename: upload.filename,
            image: upload.bytes.to_vec(),
            prompt: upload_config.resolve_prompt(prompt.as_deref()),
        })
        .await
        .map_err(|err| match err {
            SubmitError::Preprocessing { message, .. } => {
                AppError::Internal(format!("Error processing image: {message}"))
            }
            other => {
                error!(error = %other, "Submission failed");
                AppError::Internal(other.to_string())
            }
        })?;

    Ok(Json(StylizeInitiateResponse {
        edge_path: public_path(&state, &receipt.edge_map),
        job_id: receipt.job_id,
    }))
}

fn multipart_error(err: MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge("Upload exceeds the allowed size".to_string())
    } else {
        AppError::BadRequest(err.body_text())
    }
}

fn too_large(max_mb: u64) -> AppError {
    AppError::PayloadTooLarge(format!("File too large. Maximum size is {max_mb}MB."))
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: crate::job::JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_map_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stylized_image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub composite_image_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub ready: bool,
}

fn job_to_response(state: &AppState, job: &Job) -> JobStatusResponse {
    let render = |path: &Option<PathBuf>| path.as_deref().map(|p| public_path(state, p));
    JobStatusResponse {
        job_id: job.id.clone(),
        status: job.status,
        edge_map_path: render(&job.edge_map_path),
        stylized_image_path: render(&job.stylized_image_path),
        composite_image_path: render(&job.composite_image_path),
        preview_path: render(&job.preview_path),
        error_message: job.error_message.clone(),
        ready: job.is_ready(),
    }
}

fn public_path(state: &AppState, path: &std::path::Path) -> String {
    state
        .storage()
        .public_path(path)
        .unwrap_or_else(|| path.display().to_string())
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let job = state
        .registry()
        .get(&job_id)
        .map_err(|_| AppError::NotFound("Job not found".to_string()))?;
    Ok(Json(job_to_response(&state, &job)))
}

async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let bundle = state
        .inner
        .composer
        .bundle_for_download(&job_id)
        .await
        .map_err(|err| match err {
            DownloadError::NotFound(_) => AppError::NotFound("Job not found".to_string()),
            err @ DownloadError::NotReady(_) => AppError::BadRequest(err.to_string()),
            err @ DownloadError::MissingArtifacts => AppError::Internal(err.to_string()),
            DownloadError::Composition(message) => {
                AppError::Internal(format!("Failed to generate files for download: {message}"))
            }
        })?;

    let file = tokio::fs::File::open(&bundle)
        .await
        .with_context(|| format!("failed to open bundle: {}", bundle.display()))?;
    info!(job_id = %job_id, path = %bundle.display(), "Streaming bundle");

    let disposition = format!("attachment; filename=\"sketchsplit_results_{job_id}.zip\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    UnsupportedMediaType(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::UnsupportedMediaType(msg) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
