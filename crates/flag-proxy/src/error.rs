//! Rejections of inbound flag checks and their HTTP mapping.

use axum::response::{IntoResponse, Response};
use http::{header, StatusCode};

use crate::dispatch::DispatchError;
use crate::validation::ValidationError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Feature name is required")]
    MissingFlagName,
    #[error("Invalid feature name: must be URL-friendly, 1-100 characters, and not '.' or '..'")]
    InvalidFlagName,
    #[error("Invalid JSON body: {0}")]
    MalformedBody(String),
    #[error("callerAppName is required in request body, must be one of the allowed inbound applications: {allowed}")]
    MissingCallerIdentity { allowed: String },
    #[error("Unknown callerAppName: must be one of the allowed inbound applications: {allowed}")]
    UnknownCaller { allowed: String },
}

impl RequestError {
    /// Short label recorded as `error.type` and counted in stats.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::MethodNotAllowed => "method_not_allowed",
            RequestError::MissingFlagName => "missing_feature",
            RequestError::InvalidFlagName => "invalid_feature",
            RequestError::MalformedBody(_) => "invalid_body",
            RequestError::MissingCallerIdentity { .. } => "missing_app_name",
            RequestError::UnknownCaller { .. } => "unknown_app_name",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Attach the allow-list to a validation failure.
    pub fn from_validation(err: ValidationError, allowed: &str) -> Self {
        match err {
            ValidationError::MalformedBody(e) => RequestError::MalformedBody(e.to_string()),
            ValidationError::MissingCallerIdentity => RequestError::MissingCallerIdentity {
                allowed: allowed.to_string(),
            },
        }
    }

    pub fn from_dispatch(err: DispatchError, allowed: &str) -> Self {
        match err {
            DispatchError::UnknownCaller(_) => RequestError::UnknownCaller {
                allowed: allowed.to_string(),
            },
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = format!("{self}\n");

        if matches!(self, RequestError::MethodNotAllowed) {
            return (status, [(header::ALLOW, "POST, QUERY")], body).into_response();
        }
        (status, body).into_response()
    }
}
