//! HTTP surface for the status API
//!
//! Routes mirror the polling contract: submit, poll, list, delete and fetch
//! artifacts. Errors are returned as `{"detail": message}` with a status
//! code derived from the error kind.

use super::{StatusApi, UrlSubmission};
use crate::{
    backends,
    config::ServiceConfig,
    error::{ErrorKind, SegmentationError},
    inference::ModelHandle,
    jobs::JobOrchestrator,
};
use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Multipart framing allowance on top of the upload limit
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Shared handler state
#[derive(Debug, Clone)]
pub struct AppState {
    pub api: StatusApi,
}

/// Error wrapper that renders as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub SegmentationError);

impl From<SegmentationError> for ApiError {
    fn from(error: SegmentationError) -> Self {
        Self(error)
    }
}

/// HTTP status for an error kind
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind());
        if self.0.is_client_error() {
            debug!(%status, "Request rejected: {}", self.0);
        } else if status != StatusCode::SERVICE_UNAVAILABLE {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "detail": self.0.user_message() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct UploadQuery {
    threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    status: Option<String>,
}

/// Build the application router
pub fn router(api: StatusApi) -> Router {
    let config = api.orchestrator().config();
    let body_limit = config.jobs.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;
    let cors_permissive = config.server.cors_permissive;

    let router = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/segment/upload", post(segment_upload))
        .route("/segment/url", post(segment_url))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:task_id", get(get_task).delete(delete_task))
        .route("/results/:filename", get(get_result))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(AppState { api });

    let router = if cors_permissive {
        router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
    } else {
        router
    };
    router.layer(TraceLayer::new_for_http())
}

async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.api.info())
}

async fn health(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.api.health()?))
}

async fn segment_upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    // Reject before reading the body when the model is missing
    state.api.orchestrator().model().get()?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SegmentationError::validation(format!("Malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| SegmentationError::validation(format!("Failed to read upload: {e}")))?;
        let response = state.api.submit_upload(&filename, bytes.to_vec(), query.threshold)?;
        return Ok((StatusCode::OK, Json(response)));
    }

    Err(SegmentationError::validation("No file provided (expected multipart field 'file')").into())
}

async fn segment_url(
    State(state): State<AppState>,
    body: std::result::Result<Json<UrlSubmission>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = body.map_err(|e| SegmentationError::validation(e.body_text()))?;
    Ok(Json(state.api.submit_url(&request)?))
}

async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.api.task(&task_id)?))
}

async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.api.tasks(query.limit, query.status.as_deref())?))
}

async fn delete_task(State(state): State<AppState>, Path(task_id): Path<String>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.api.delete(&task_id).await?))
}

async fn get_result(State(state): State<AppState>, Path(filename): Path<String>) -> ApiResult<Response> {
    let bytes = state.api.artifact(&filename).await?;
    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// Load the model, start the orchestrator and serve until ctrl-c or SIGTERM
///
/// A model that fails to load is logged and the service starts anyway, so
/// health probes and submissions report it as unavailable.
///
/// # Errors
/// Invalid configuration, directory creation or socket binding failures
pub async fn serve(config: ServiceConfig) -> anyhow::Result<()> {
    config.validate().context("invalid service configuration")?;

    let model = match backends::load_model(&config) {
        Ok(loaded) => {
            info!(model = %loaded.info.name, backend = ?loaded.info.backend, "Model loaded");
            ModelHandle::ready(loaded.model, loaded.info)
        },
        Err(e) => {
            warn!("Model failed to load, serving without it: {e}");
            ModelHandle::unloaded()
        },
    };

    let bind_addr = config.server.bind_addr.clone();
    let orchestrator = JobOrchestrator::start(config, model).context("failed to start job orchestrator")?;
    orchestrator
        .artifacts()
        .ensure_dirs()
        .await
        .context("failed to create storage directories")?;

    let app = router(StatusApi::new(orchestrator.clone()));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install ctrl-c handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
