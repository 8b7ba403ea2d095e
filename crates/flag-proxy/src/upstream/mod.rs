//! Upstream flag-evaluation capability.
//!
//! The registry only sees the [`ClientFactory`] and [`FlagClient`] traits;
//! [`unleash`] provides the HTTP implementation against the Unleash client API.

pub mod listener;
pub mod metrics;
pub mod strategy;
pub mod unleash;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use listener::ClientListener;

/// Per-request facts a flag decision may depend on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationContext {
    pub environment: String,
    pub user_id: String,
    pub app_name: String,
    pub remote_address: String,
    pub properties: HashMap<String, String>,
}

impl EvaluationContext {
    /// Look up a context field by its Unleash context name.
    pub fn field(&self, name: &str) -> Option<&str> {
        let value = match name {
            "environment" => self.environment.as_str(),
            "userId" => self.user_id.as_str(),
            "appName" => self.app_name.as_str(),
            "remoteAddress" => self.remote_address.as_str(),
            other => self.properties.get(other).map(String::as_str)?,
        };
        Some(value).filter(|v| !v.is_empty())
    }
}

/// A synchronized client serving decisions for one caller application.
#[async_trait]
pub trait FlagClient: Send + Sync {
    /// In-memory evaluation against the client's cached flag snapshot.
    /// Unknown flags evaluate to `false`.
    fn is_enabled(&self, feature: &str, context: &EvaluationContext) -> bool;

    /// Stop background synchronization and flush pending usage metrics.
    async fn close(&self);
}

/// Builds one client per caller. `connect` resolves only once the client has
/// completed its first synchronization with the upstream, or has failed.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        app_name: &str,
        listener: Arc<dyn ClientListener>,
    ) -> Result<Arc<dyn FlagClient>, UpstreamError>;
}

#[derive(thiserror::Error, Debug)]
pub enum UpstreamError {
    #[error("invalid upstream url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream rejected the client token (status {0})")]
    Unauthorized(u16),
    #[error("unexpected upstream status {0}")]
    Status(u16),
    #[error("invalid feature payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("backing off for {delay:?} after failed sync: {source}")]
    BackingOff {
        delay: Duration,
        #[source]
        source: Box<UpstreamError>,
    },
}

impl UpstreamError {
    /// Whether the first sync should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamError::Request(_) => true,
            UpstreamError::Status(status) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_field_lookup() {
        let context = EvaluationContext {
            environment: "production".to_string(),
            user_id: "Z994488".to_string(),
            app_name: "kabal-frontend".to_string(),
            remote_address: String::new(),
            properties: HashMap::from([("podName".to_string(), "pod-1".to_string())]),
        };

        assert_eq!(context.field("userId"), Some("Z994488"));
        assert_eq!(context.field("appName"), Some("kabal-frontend"));
        assert_eq!(context.field("environment"), Some("production"));
        assert_eq!(context.field("podName"), Some("pod-1"));
        assert_eq!(context.field("remoteAddress"), None);
        assert_eq!(context.field("tenant"), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(UpstreamError::Status(503).is_retryable());
        assert!(UpstreamError::Status(429).is_retryable());
        assert!(!UpstreamError::Status(404).is_retryable());
        assert!(!UpstreamError::Unauthorized(401).is_retryable());
    }
}
