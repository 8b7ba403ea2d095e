//! Axum HTTP server: router, flag check handler, health probes, shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::PathRejection;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use http::{Method, StatusCode};
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Instrument, Level};

use crate::dispatch::{Dispatcher, UserContext};
use crate::error::RequestError;
use crate::registry::ClientRegistry;
use crate::stats::ProxyStats;
use crate::telemetry::ProxyMetrics;
use crate::validation::{is_valid_flag_name, parse_request_body};

/// Request bodies are a handful of short strings.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub registry: Arc<ClientRegistry>,
    pub stats: ProxyStats,
    pub metrics: ProxyMetrics,
    /// Allow-list rendered once for caller error messages.
    pub allowed_callers: String,
}

#[derive(Serialize)]
struct FeatureResponse {
    enabled: bool,
}

struct Decision {
    feature: String,
    app_name: String,
    enabled: bool,
}

pub fn router(state: AppState) -> Router {
    let features = Router::new()
        .route("/features/", any(handle_missing_feature))
        .route("/features/{*feature}", any(handle_feature))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    Router::new()
        .route("/isAlive", get(handle_alive))
        .route("/isReady", get(handle_ready))
        .route("/api/stats", get(handle_stats))
        .merge(features)
        .fallback(handle_fallback)
        .with_state(Arc::new(state))
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: tokio::net::TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Flag proxy shut down gracefully");
    Ok(())
}

async fn handle_feature(
    State(state): State<Arc<AppState>>,
    feature: Result<Path<String>, PathRejection>,
    request: Request,
) -> Response {
    let feature = feature
        .map(|Path(name)| name)
        .map_err(|_| RequestError::InvalidFlagName);
    check_feature(state, feature, request).await
}

/// `/features/` with nothing after the prefix.
async fn handle_missing_feature(State(state): State<Arc<AppState>>, request: Request) -> Response {
    check_feature(state, Ok(String::new()), request).await
}

async fn check_feature(
    state: Arc<AppState>,
    feature: Result<String, RequestError>,
    request: Request,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let span = flag_tracing::feature_request_span!(method, request.uri().path());
    flag_tracing::set_remote_parent(&span, request.headers());
    state.stats.inc_requests();

    let result = evaluate_request(&state, feature, request)
        .instrument(span.clone())
        .await;

    let elapsed = start.elapsed();
    span.record("duration_ms", elapsed.as_millis() as u64);

    let response = match result {
        Ok(decision) => {
            state.stats.record_decision(decision.enabled);
            state.metrics.record_decision(
                &decision.feature,
                &decision.app_name,
                decision.enabled,
                elapsed,
            );
            span.record("feature.enabled", decision.enabled);
            Json(FeatureResponse {
                enabled: decision.enabled,
            })
            .into_response()
        }
        Err(err) => {
            state.stats.record_error(&err);
            state.metrics.record_error(err.kind());
            span.record("error.type", err.kind());
            span.in_scope(|| {
                tracing::warn!(error_type = err.kind(), error = %err, "Rejected feature request");
            });
            err.into_response()
        }
    };

    state
        .metrics
        .record_request(&method, response.status(), elapsed);
    response
}

/// Method, flag name, body, then the caller's client, in that order.
async fn evaluate_request(
    state: &AppState,
    feature: Result<String, RequestError>,
    request: Request,
) -> Result<Decision, RequestError> {
    if !is_accepted_method(request.method()) {
        return Err(RequestError::MethodNotAllowed);
    }

    let feature = feature?;
    if feature.is_empty() {
        return Err(RequestError::MissingFlagName);
    }

    let span = tracing::Span::current();
    span.record("feature.name", feature.as_str());

    if !is_valid_flag_name(&feature) {
        return Err(RequestError::InvalidFlagName);
    }

    let remote_address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| RequestError::MalformedBody(e.to_string()))?;

    let parsed = parse_request_body(&body)
        .map_err(|e| RequestError::from_validation(e, &state.allowed_callers))?;
    span.record("app_name", parsed.caller_app_name.as_str());

    let user = UserContext {
        user_id: parsed.user_identifier,
        remote_address,
        pod_name: parsed.pod_name,
    };

    let enabled = state
        .dispatcher
        .evaluate(&parsed.caller_app_name, &feature, &user)
        .await
        .map_err(|e| RequestError::from_dispatch(e, &state.allowed_callers))?;

    tracing::debug!(
        app_name = %parsed.caller_app_name,
        feature = %feature,
        enabled = enabled,
        user_id = %user.user_id,
        pod_name = %user.pod_name,
        "Feature check"
    );

    Ok(Decision {
        feature,
        app_name: parsed.caller_app_name,
        enabled,
    })
}

fn is_accepted_method(method: &Method) -> bool {
    *method == Method::POST || method.as_str() == "QUERY"
}

async fn handle_alive() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn handle_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.registry.is_ready() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot())
}

async fn handle_fallback() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
