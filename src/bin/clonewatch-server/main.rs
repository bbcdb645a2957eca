use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

mod metrics;

use clonewatch::input::extension_of;
use clonewatch::{AnalysisResponse, Detector, ErrorKind, Opts};

/// Multipart framing allowance on top of the configured file size limit.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "clonewatch-server")]
#[command(about = "HTTP server for voice clone detection")]
struct Params {
    /// Model artifact directory.
    #[arg(short = 'm', long = "models", required = true)]
    models_dir: PathBuf,

    /// Optional JSON file with analysis options.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Host interface to bind to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", default_value_t = 8080)]
    port: u16,

    /// Wall-clock limit for one request, in seconds.
    #[arg(long = "timeout-seconds", default_value_t = 120)]
    timeout_seconds: u64,
}

#[derive(Clone)]
struct AppState {
    detector: Arc<Detector>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[tokio::main]
async fn main() {
    clonewatch::init_logging();

    if let Err(err) = run().await {
        error!(error = ?err, "clonewatch-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();

    if let Err(err) = metrics::init() {
        warn!(error = ?err, "metrics disabled (init failed)");
    }

    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .context("invalid host/port bind address")?;

    let opts = match &params.config {
        Some(path) => Opts::from_json_file(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?,
        None => Opts::default(),
    };
    let body_limit = usize::try_from(opts.max_file_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let detector = Detector::new(opts).context("invalid analysis options")?;
    detector
        .initialize(&params.models_dir)
        .with_context(|| format!("failed to load models from '{}'", params.models_dir.display()))?;

    let state = AppState {
        detector: Arc::new(detector),
    };

    let app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/v1/status", get(status))
        .route("/v1/analyze", post(analyze))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(Duration::from_secs(params.timeout_seconds)))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.detector.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn root() -> &'static str {
    "clonewatch-server: POST /v1/analyze (multipart field: file)"
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.detector.health())
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.detector.status())
}

async fn analyze(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> std::result::Result<Response, AppError> {
    let mut field = loop {
        match multipart
            .next_field()
            .await
            .map_err(|err| AppError::bad_request(err.to_string()))?
        {
            Some(field) if field.name() == Some("file") => break field,
            Some(_) => continue,
            None => return Err(AppError::bad_request("missing multipart field 'file'")),
        }
    };

    let file_name = field
        .file_name()
        .map(str::to_owned)
        .ok_or_else(|| AppError::bad_request("upload has no file name"))?;

    // The upload is spooled to a temp file that is removed when `spool` drops, on every path.
    let suffix = extension_of(&file_name)
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();
    let spool = tempfile::Builder::new()
        .prefix("clonewatch-")
        .suffix(&suffix)
        .tempfile()
        .map_err(|err| AppError::internal(format!("failed to create spool file: {err}")))?;
    let handle = spool
        .reopen()
        .map_err(|err| AppError::internal(format!("failed to open spool file: {err}")))?;
    let mut file = tokio::fs::File::from_std(handle);

    let limit = state.detector.opts().max_file_bytes;
    let mut written: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| AppError::bad_request(err.to_string()))?
    {
        written += chunk.len() as u64;
        if written > limit {
            return Err(AppError::too_large(format!(
                "file exceeds the {} MB limit",
                limit / (1024 * 1024)
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(|err| AppError::internal(format!("failed to spool upload: {err}")))?;
    }
    file.flush()
        .await
        .map_err(|err| AppError::internal(format!("failed to spool upload: {err}")))?;
    drop(file);

    let detector = state.detector.clone();
    let resp = tokio::task::spawn_blocking(move || {
        let resp = detector.predict_upload(&file_name, spool.path());
        drop(spool);
        resp
    })
    .await
    .map_err(|err| AppError::internal(format!("analysis task failed: {err}")))?;

    metrics::record_analysis(&resp);
    Ok((status_for(&resp), Json(resp)).into_response())
}

fn status_for(resp: &AnalysisResponse) -> StatusCode {
    match resp.as_failure().map(|f| f.kind) {
        None => StatusCode::OK,
        Some(ErrorKind::InvalidInput) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::Load | ErrorKind::Preprocess) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::NotInitialized) => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
