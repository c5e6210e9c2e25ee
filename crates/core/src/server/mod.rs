use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::convert::{decode_image_bytes, encode_png};
use crate::dispatcher::{Dispatcher, Disposition};
use crate::layout;
use crate::log_store::write_atomic;
use crate::registry::{build_default_registry, TaskRegistry};

const UPLOAD_FIELD: &str = "file";
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    dispatcher: Dispatcher,
    config: AppConfig,
}

impl AppState {
    pub fn new(registry: TaskRegistry, config: AppConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                dispatcher: Dispatcher::new(registry),
                config,
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }
}

pub fn app_state_with_config(config: AppConfig) -> AppState {
    let registry = build_default_registry(&config);
    info!(
        supported_tasks = ?registry.list_supported(),
        default_task = registry.default_task_type(),
        fail_on_node_errors = config.tasks.fail_on_node_errors,
        "Task registry ready"
    );
    AppState::new(registry, config)
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/tasks", get(list_tasks))
        .route("/cook", post(cook))
        .route(
            "/upload/png",
            post(upload_png).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/result/png", get(result_png))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
pub struct PingResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct TasksResponse {
    pub supported_tasks: Vec<String>,
    pub default_task: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub ok: bool,
    pub uuid: String,
    pub path: String,
    pub width: u32,
    pub height: u32,
}

/// `?hip=..&uuid=..`, both optional at the extractor level so a missing one
/// gets a JSON error instead of a plain-text rejection.
#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub hip: Option<String>,
    pub uuid: Option<String>,
}

impl ArtifactQuery {
    fn resolve(&self) -> Result<(PathBuf, String), AppError> {
        let hip = self
            .hip
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::BadRequest("missing query parameter: hip".to_string()))?;
        let uuid = self
            .uuid
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::BadRequest("missing query parameter: uuid".to_string()))?;
        if !layout::is_safe_uuid(uuid) {
            return Err(AppError::BadRequest(format!("invalid uuid: {uuid}")));
        }
        Ok((layout::base_dir(Path::new(hip)), uuid.to_string()))
    }
}

/// Artifacts only ever live under an existing project directory.
async fn require_project_dir(base: &Path) -> Result<(), AppError> {
    match tokio::fs::metadata(base).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(AppError::BadRequest(format!("invalid hip dir: {}", base.display()))),
    }
}

async fn ping() -> Json<PingResponse> {
    Json(PingResponse {
        status: "ok".to_string(),
    })
}

async fn list_tasks(State(state): State<AppState>) -> Json<TasksResponse> {
    let registry = state.dispatcher().registry();
    Json(TasksResponse {
        supported_tasks: registry
            .list_supported()
            .into_iter()
            .map(str::to_string)
            .collect(),
        default_task: registry.default_task_type().to_string(),
    })
}

async fn cook(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    let payload: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))?
    };

    let dispatched = state.dispatcher().handle_cook(payload).await;
    let status = match dispatched.disposition {
        Disposition::Completed => StatusCode::OK,
        Disposition::Rejected => StatusCode::BAD_REQUEST,
        Disposition::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Ok((status, Json(dispatched.body)).into_response())
}

async fn upload_png(
    State(_state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let (base, uuid) = query.resolve()?;
    require_project_dir(&base).await?;

    let mut upload: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some(UPLOAD_FIELD) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("failed to read upload: {e}")))?;
            upload = Some(bytes);
            break;
        }
    }
    let bytes = upload
        .filter(|b| !b.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing file field '{UPLOAD_FIELD}'")))?;

    let target = layout::raster_path(&base, &uuid);
    let written = target.clone();
    let (width, height) = tokio::task::spawn_blocking(move || -> Result<(u32, u32), AppError> {
        let image = decode_image_bytes(&bytes)
            .map_err(|e| AppError::BadRequest(format!("upload is not a decodable image: {e:#}")))?;
        let png = if image::guess_format(&bytes).ok() == Some(image::ImageFormat::Png) {
            bytes.to_vec()
        } else {
            encode_png(&image.to_rgb8())?
        };
        write_atomic(&written, &png)?;
        Ok((image.width(), image.height()))
    })
    .await
    .map_err(|e| AppError::Internal(format!("upload task failed: {e}")))??;

    info!(%uuid, path = %target.display(), width, height, "raster uploaded");
    Ok(Json(UploadResponse {
        ok: true,
        uuid,
        path: target.display().to_string(),
        width,
        height,
    }))
}

async fn result_png(
    State(_state): State<AppState>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Response, AppError> {
    let (base, uuid) = query.resolve()?;
    require_project_dir(&base).await?;
    let candidate = layout::raster_path(&base, &uuid);

    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| AppError::NotFound(format!("result not found: {}", candidate.display())))?;
    let base = tokio::fs::canonicalize(&base)
        .await
        .map_err(|_| AppError::NotFound(format!("project directory not found: {}", base.display())))?;
    if !resolved.starts_with(&base) {
        warn!(%uuid, path = %resolved.display(), "result path escapes project directory");
        return Err(AppError::Forbidden("result path escapes project directory".to_string()));
    }
    if !resolved.is_file() {
        return Err(AppError::NotFound(format!("result not found: {}", candidate.display())));
    }

    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|e| AppError::Internal(format!("failed to read result: {e}")))?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            ok: false,
            error: message,
        });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}
