//! Span builder helpers for flag-proxy instrumentation.

/// Create a tracing span for one inbound feature check.
///
/// Usage: `let span = feature_request_span!(method, path);`
///
/// Fields recorded later by the handler:
/// - `feature.name`: the validated flag name
/// - `app_name`: the caller application from the request body
/// - `feature.enabled`: the decision returned to the caller
/// - `error.type`: short error label when the request is rejected
/// - `duration_ms`: handler wall time
#[macro_export]
macro_rules! feature_request_span {
    ($method:expr, $path:expr) => {
        tracing::info_span!(
            "feature_request",
            http.method = %$method,
            http.path = %$path,
            feature.name = tracing::field::Empty,
            app_name = tracing::field::Empty,
            feature.enabled = tracing::field::Empty,
            "error.type" = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span around a single upstream client evaluation.
#[macro_export]
macro_rules! flag_evaluation_span {
    ($feature:expr, $app_name:expr) => {
        tracing::info_span!(
            "flag_evaluation",
            feature.name = %$feature,
            app_name = %$app_name,
            feature.enabled = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for constructing one caller's upstream client.
#[macro_export]
macro_rules! client_init_span {
    ($app_name:expr) => {
        tracing::info_span!(
            "client_init",
            app_name = %$app_name,
            latency_ms = tracing::field::Empty,
        )
    };
}
