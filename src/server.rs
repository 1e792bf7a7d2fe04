//! HTTP control surface for a running pipeline.
//!
//! Exposes the supervisor's operations as a small JSON API so that a
//! stimulus presenter or a dashboard can drive training and testing:
//!
//! ```text
//! GET  /health       liveness and version
//! GET  /status       running flag, mode, source health, counters
//! POST /start        start acquisition
//! POST /stop         stop acquisition
//! POST /mode/train   route new epochs to training
//! POST /mode/test    route new epochs to prediction
//! GET  /classifier   classifier state and dataset summary
//! GET  /guess        latest prediction
//! GET  /markers      completed epochs per marker label
//! ```
//!
//! Every pipeline call can block (joins, query round trips), so handlers
//! run them on the blocking pool.

use crate::core::{ClassifierInfo, EpochCounts, LatestGuess, Mode};
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, PipelineStatus};
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
    /// Start the pipeline as soon as the server is up
    pub autostart: bool,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            autostart: false,
        }
    }
}

/// Shared server state
pub struct ServerState {
    pipeline: Arc<Mutex<Pipeline>>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Acknowledgement for control operations
#[derive(Serialize)]
pub struct ControlResponse {
    pub status: String,
    pub running: bool,
    pub mode: Mode,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn pipeline_error(e: PipelineError) -> ApiError {
    let (status, code) = match &e {
        PipelineError::Configuration(_) => (StatusCode::BAD_REQUEST, "CONFIGURATION_ERROR"),
        PipelineError::Acquisition(_) => (StatusCode::BAD_GATEWAY, "ACQUISITION_ERROR"),
        PipelineError::QueryTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "QUERY_TIMEOUT"),
        PipelineError::NotRunning => (StatusCode::CONFLICT, "NOT_RUNNING"),
        PipelineError::AlreadyRunning => (StatusCode::CONFLICT, "ALREADY_RUNNING"),
        PipelineError::WorkerPanicked(_) | PipelineError::Spawn(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        }
    };
    api_error(status, code, e)
}

/// Run `f` against the pipeline on the blocking pool.
async fn with_pipeline<T, F>(state: &ServerState, f: F) -> Result<Json<T>, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut Pipeline) -> Result<T, PipelineError> + Send + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    let result = tokio::task::spawn_blocking(move || {
        let mut guard = pipeline.lock().map_err(|_| {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "pipeline lock poisoned")
        })?;
        f(&mut *guard).map_err(pipeline_error)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e))?;
    result.map(Json)
}

fn control(status: &str, pipeline: &Pipeline) -> ControlResponse {
    ControlResponse {
        status: status.to_string(),
        running: pipeline.is_running(),
        mode: pipeline.mode(),
    }
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status
async fn status(State(state): State<Arc<ServerState>>) -> Result<Json<PipelineStatus>, ApiError> {
    with_pipeline(&state, |p| Ok(p.status())).await
}

/// POST /start
async fn start(State(state): State<Arc<ServerState>>) -> Result<Json<ControlResponse>, ApiError> {
    with_pipeline(&state, |p| {
        p.start()?;
        Ok(control("started", p))
    })
    .await
}

/// POST /stop
async fn stop(State(state): State<Arc<ServerState>>) -> Result<Json<ControlResponse>, ApiError> {
    with_pipeline(&state, |p| {
        p.stop()?;
        Ok(control("stopped", p))
    })
    .await
}

/// POST /mode/train
async fn mode_train(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ControlResponse>, ApiError> {
    with_pipeline(&state, |p| {
        p.set_train_mode();
        Ok(control("ok", p))
    })
    .await
}

/// POST /mode/test
async fn mode_test(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ControlResponse>, ApiError> {
    with_pipeline(&state, |p| {
        p.set_test_mode();
        Ok(control("ok", p))
    })
    .await
}

/// GET /classifier
async fn classifier(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<ClassifierInfo>, ApiError> {
    with_pipeline(&state, |p| p.query_classifier_info()).await
}

/// GET /guess
async fn guess(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Option<LatestGuess>>, ApiError> {
    with_pipeline(&state, |p| p.query_latest_guess()).await
}

/// GET /markers
async fn markers(State(state): State<Arc<ServerState>>) -> Result<Json<EpochCounts>, ApiError> {
    with_pipeline(&state, |p| p.query_marker_counts()).await
}

/// Build the router around a pipeline.
pub fn router(pipeline: Pipeline) -> Router {
    let state = Arc::new(ServerState {
        pipeline: Arc::new(Mutex::new(pipeline)),
    });

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/mode/train", post(mode_train))
        .route("/mode/test", post(mode_test))
        .route("/classifier", get(classifier))
        .route("/guess", get(guess))
        .route("/markers", get(markers))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    mut pipeline: Pipeline,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    if config.autostart {
        pipeline = tokio::task::spawn_blocking(move || pipeline.start().map(|()| pipeline))
            .await??;
    }
    let app = router(pipeline);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Pipeline control server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
