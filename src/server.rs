//! Purpose: Provide the HTTP gateway in front of the per-key counter stores.
//! Exports: `ServeConfig`, `AppState`, `app`, `forward`, `serve`.
//! Role: Axum-based server; parses `/api/<action>/<key>`, normalizes the key,
//! resolves its store, and forwards the operation across the store boundary.
//! Invariants: Every response, including errors and 404s, carries the CORS headers.
//! Invariants: Handlers never fail; store errors become JSON envelopes with 5xx status.
//! Invariants: Loopback-only unless explicitly allowed.

use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::api::{
    CounterStore, Error, ErrorKind, LocalClient, StoreLocator, normalize,
};

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

const CORS_HEADERS: [(HeaderName, &str); 4] = [
    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    (header::ACCESS_CONTROL_ALLOW_METHODS, "GET,POST,OPTIONS"),
    (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
    (header::ACCESS_CONTROL_MAX_AGE, "86400"),
];

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub allow_non_loopback: bool,
    pub io_timeout_ms: u64,
}

#[derive(Clone)]
pub struct AppState {
    locator: Arc<dyn StoreLocator>,
}

impl AppState {
    pub fn new(locator: Arc<dyn StoreLocator>) -> Self {
        Self { locator }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Action {
    Get,
    Hit,
}

impl Action {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "get" => Some(Action::Get),
            "hit" => Some(Action::Hit),
            _ => None,
        }
    }

    fn store_path(self) -> &'static str {
        match self {
            Action::Get => "/get",
            Action::Hit => "/hit",
        }
    }
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let registry = LocalClient::new()
        .with_data_dir(&config.data_dir)
        .with_io_timeout(Duration::from_millis(config.io_timeout_ms))
        .registry()?;
    let app = app(AppState::new(Arc::new(registry)));

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        io_timeout_ms = config.io_timeout_ms,
        "tally listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Timeout).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

/// Builds the router; every request lands in one dispatcher.
pub fn app(state: AppState) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

pub fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.io_timeout_ms == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--io-timeout-ms must be greater than zero")
            .with_hint("Use a positive value like 5000."));
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn dispatch(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method == Method::OPTIONS {
        return with_cors(StatusCode::NO_CONTENT.into_response());
    }
    let Some((action, raw_key)) = parse_route(uri.path()) else {
        return with_cors(not_found());
    };
    let key = normalize(&remove_dot_segments(raw_key));
    let store = state.locator.locate(&key);
    let forwarded = match action {
        Action::Get => Method::GET,
        Action::Hit => method,
    };
    with_cors(forward(&store, &forwarded, action.store_path()).await)
}

/// The store-side boundary: `GET /get`, `GET|POST /hit`, anything else is 404.
pub async fn forward(store: &CounterStore, method: &Method, path: &str) -> Response {
    let result = match (method, path) {
        (&Method::GET, "/get") => store.get().await,
        (&Method::GET | &Method::POST, "/hit") => store.increment().await,
        _ => return not_found(),
    };
    match result {
        Ok(value) => value_response(value),
        Err(err) => error_response(err),
    }
}

fn parse_route(path: &str) -> Option<(Action, &str)> {
    let rest = path.strip_prefix("/api/")?;
    let (action, raw_key) = rest.split_once('/')?;
    Some((Action::parse(action)?, raw_key))
}

// Resolves `.` and `..` segments inside the key the way URL parsing resolves
// them in a path, without ever climbing above the key itself.
fn remove_dot_segments(raw_key: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw_key.split('/') {
        if is_double_dot(segment) {
            segments.pop();
        } else if !is_single_dot(segment) {
            segments.push(segment);
        }
    }
    segments.join("/")
}

fn is_single_dot(segment: &str) -> bool {
    segment == "." || segment.eq_ignore_ascii_case("%2e")
}

fn is_double_dot(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    matches!(lower.as_str(), ".." | ".%2e" | "%2e." | "%2e%2e")
}

fn with_cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    for (name, value) in CORS_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
    response
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn value_response(value: u64) -> Response {
    json_response(StatusCode::OK, json!({ "value": value }))
}

fn json_response(status: StatusCode, payload: impl Serialize) -> Response {
    let mut response = (status, Json(payload)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_CONTENT_TYPE),
    );
    response
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Busy | ErrorKind::Timeout => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if err.kind().is_retryable() {
        tracing::warn!(error = %err, "counter operation failed");
    } else {
        tracing::error!(error = %err, "counter operation failed");
    }
    // Storage paths and local remediation hints stay server-side.
    let mut report = err.report();
    report.error.path = None;
    report.error.hint = None;
    json_response(status, report)
}
