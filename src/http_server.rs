//! HTTP front door using Axum.

use crate::config::ServerConfig;
use crate::error::{Error, PoolError};
use crate::pool::{Admission, Pool, Reaper, SessionHandle};
use crate::runtime::ContainerRuntime;
use crate::sandbox::{RunResult, SandboxManager, SandboxRequest, SourceFile};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const SESSION_HEADER: &str = "x-session-id";

const SERVICE_NAME: &str = "runner-pool";
const SUPPORTED_LANGUAGES: [&str; 3] = ["python", "python3", "py"];
const MAX_SESSION_ID_LEN: usize = 128;
const PACKAGES: [&str; 10] = [
    "numpy",
    "pandas",
    "matplotlib",
    "requests",
    "httpx",
    "pydantic",
    "chromadb",
    "paramiko",
    "aiohttp",
    "psutil",
];

// Request/Response types
#[derive(Deserialize)]
struct ExecuteRequest {
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    files: Vec<SourceFile>,
    #[serde(default)]
    stdin: String,
}

fn default_language() -> String {
    "python".to_string()
}

#[derive(Serialize)]
struct ExecuteResponse {
    run: RunResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    session_id: String,
}

#[derive(Serialize)]
struct FailureResponse {
    run: RunResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct QueuedResponse {
    queued: bool,
    position: usize,
    active_sessions: usize,
    max_sessions: usize,
    retry_after: u64,
    session_id: String,
    message: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    active_sessions: usize,
    max_sessions: usize,
    queue_size: usize,
    idle_timeout: u64,
}

#[derive(Serialize)]
struct ActiveSession {
    session_id: String,
    container: String,
    container_ip: String,
    age_seconds: u64,
    idle_seconds: u64,
}

#[derive(Serialize)]
struct QueuedSession {
    session_id: String,
    waiting_seconds: u64,
}

#[derive(Serialize)]
struct SessionsResponse {
    capacity: String,
    active: Vec<ActiveSession>,
    queue: Vec<QueuedSession>,
}

#[derive(Serialize)]
struct Runtime {
    language: &'static str,
    version: &'static str,
    aliases: [&'static str; 2],
}

/// Build the router with CORS and request tracing.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(SESSION_HEADER)]);

    Router::new()
        // Execution
        .route("/execute", post(execute))
        .route("/api/v2/execute", post(execute))
        // Session management
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(delete_session))
        // Static info
        .route("/runtimes", get(runtimes))
        .route("/api/v2/runtimes", get(runtimes))
        .route("/packages", get(packages))
        .route("/api/v2/packages", get(packages))
        .route("/health", get(health))
        .route("/", get(root))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Purge leftovers, start the reaper, serve until a shutdown signal, then
/// destroy every sandbox.
pub async fn run_server(
    config: ServerConfig,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<(), Error> {
    let sandboxes = SandboxManager::new(runtime, config.pool.sandbox.clone());
    let purged = sandboxes.purge_stale().await;
    if purged > 0 {
        info!(purged, "Removed stale session containers");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let pool = Pool::new(config.pool.clone(), sandboxes);
    let reaper = Reaper::spawn(pool.clone());
    let app = router(AppState::new(pool.clone()), &config.cors_origins);

    info!(
        %addr,
        max_sessions = config.pool.max_sessions,
        idle_timeout_secs = config.pool.idle_timeout.as_secs(),
        "Session manager started"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    reaper.stop().await;
    pool.shutdown().await;
    info!("Session manager stopped, all containers destroyed");

    served.map_err(Error::Io)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn session_id_from(headers: &HeaderMap) -> Result<String, String> {
    let supplied = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match supplied {
        Some(id) if id.len() > MAX_SESSION_ID_LEN => Err(format!(
            "session id longer than {} characters",
            MAX_SESSION_ID_LEN
        )),
        Some(id) => Ok(id.to_string()),
        None => {
            let mut id = uuid::Uuid::new_v4().simple().to_string();
            id.truncate(12);
            Ok(id)
        }
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(FailureResponse {
            run: RunResult::failure(message),
            session_id: None,
        }),
    )
        .into_response()
}

fn failure(status: StatusCode, session_id: &str, message: &str) -> Response {
    (
        status,
        [(SESSION_HEADER, session_id.to_string())],
        Json(FailureResponse {
            run: RunResult::failure(message),
            session_id: Some(session_id.to_string()),
        }),
    )
        .into_response()
}

fn queued(pool: &Pool, session_id: &str, position: usize) -> Response {
    let status = pool.status();
    let retry_after = pool.config().retry_after.as_secs();
    info!(session_id = %session_id, position, "No capacity, caller told to retry");
    (
        StatusCode::ACCEPTED,
        [(SESSION_HEADER, session_id.to_string())],
        Json(QueuedResponse {
            queued: true,
            position,
            active_sessions: status.active_sessions,
            max_sessions: status.max_sessions,
            retry_after,
            session_id: session_id.to_string(),
            message: format!(
                "Server busy: {}/{} sessions active. Queue position {}. Retry in {}s.",
                status.active_sessions, status.max_sessions, position, retry_after
            ),
        }),
    )
        .into_response()
}

/// Acquire directly, or fall back to waiting in the queue.
async fn admit(pool: &Pool, session_id: &str) -> Result<Admission, PoolError> {
    match pool.acquire(session_id).await? {
        Some(handle) => Ok(Admission::Admitted(handle)),
        None => pool.enqueue_and_wait(session_id).await,
    }
}

async fn execute(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if !SUPPORTED_LANGUAGES.contains(&req.language.as_str()) {
        return bad_request(format!("language '{}' is not supported", req.language));
    }
    let code = match req.files.into_iter().next() {
        Some(file) if !file.content.is_empty() => file.content,
        _ => return bad_request("no code provided"),
    };
    let session_id = match session_id_from(&headers) {
        Ok(id) => id,
        Err(message) => return bad_request(message),
    };

    let handle = match admit(&state.pool, &session_id).await {
        Ok(Admission::Admitted(handle)) => handle,
        Ok(Admission::Queued { position }) => return queued(&state.pool, &session_id, position),
        Err(PoolError::ShuttingDown) => {
            return failure(
                StatusCode::SERVICE_UNAVAILABLE,
                &session_id,
                "service is shutting down",
            )
        }
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Could not provide a sandbox");
            return failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                &session_id,
                "execution failed: sandbox could not be started",
            );
        }
    };

    let request = SandboxRequest {
        language: req.language,
        files: vec![SourceFile { content: code }],
        stdin: req.stdin,
    };
    run_on(&state, &handle, session_id, &request).await
}

/// Forward a request to the session's sandbox. On failure only that
/// sandbox is discarded; a replacement registered meanwhile is left alone.
async fn run_on(
    state: &AppState,
    handle: &SessionHandle,
    session_id: String,
    request: &SandboxRequest,
) -> Response {
    match state.client.execute(handle.address, request).await {
        Ok(resp) => {
            state.pool.touch(&session_id);
            (
                [(SESSION_HEADER, session_id.clone())],
                Json(ExecuteResponse {
                    run: resp.run,
                    language: resp.language,
                    version: resp.version,
                    session_id,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(
                session_id = %session_id,
                container_id = %handle.container_id,
                error = %e,
                "Proxy error, discarding sandbox"
            );
            state
                .pool
                .destroy_if(&session_id, &handle.container_id)
                .await;
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                &session_id,
                "execution failed: sandbox unavailable",
            )
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.pool.status();
    Json(HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: status.active_sessions,
        max_sessions: status.max_sessions,
        queue_size: status.queue_size,
        idle_timeout: state.pool.config().idle_timeout.as_secs(),
    })
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    let status = state.pool.status();
    let (active, queue) = state.pool.snapshot();
    Json(SessionsResponse {
        capacity: format!("{}/{}", status.active_sessions, status.max_sessions),
        active: active
            .into_iter()
            .map(|s| ActiveSession {
                session_id: s.session_id,
                container: s.container_name,
                container_ip: s.address.ip().to_string(),
                age_seconds: s.age.as_secs(),
                idle_seconds: s.idle.as_secs(),
            })
            .collect(),
        queue: queue
            .into_iter()
            .map(|q| QueuedSession {
                session_id: q.session_id,
                waiting_seconds: q.waiting.as_secs(),
            })
            .collect(),
    })
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if state.pool.destroy(&id).await {
        info!(session_id = %id, "Session destroyed on request");
        Ok(Json(serde_json::json!({
            "message": format!("Session {} destroyed", id),
            "active": state.pool.status().active_sessions,
        })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Session not found" })),
        ))
    }
}

async fn runtimes() -> Json<Vec<Runtime>> {
    Json(vec![Runtime {
        language: "python",
        version: "3.11",
        aliases: ["py", "python3"],
    }])
}

async fn packages() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "language": "python",
        "packages": PACKAGES,
    }))
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.pool.status();
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "features": [
            "per-session container isolation",
            "bounded concurrent sessions",
            "FIFO queue with position feedback",
            "auto-destroy after inactivity",
        ],
        "active_sessions": status.active_sessions,
        "max_sessions": status.max_sessions,
    }))
}
