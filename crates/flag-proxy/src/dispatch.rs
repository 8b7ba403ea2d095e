//! Routes a validated flag check to the caller's own upstream client.

use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::ClientRegistry;
use crate::upstream::EvaluationContext;

/// Per-request user facts forwarded to evaluation.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub user_id: String,
    pub remote_address: String,
    pub pod_name: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// Not allow-listed, or allow-listed but its client is not available yet.
    #[error("unknown caller application {0:?}")]
    UnknownCaller(String),
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    environment: String,
}

impl Dispatcher {
    pub fn new(registry: Arc<ClientRegistry>, environment: impl Into<String>) -> Self {
        Self {
            registry,
            environment: environment.into(),
        }
    }

    /// Evaluate `feature` with the client that belongs to `caller`.
    pub async fn evaluate(
        &self,
        caller: &str,
        feature: &str,
        user: &UserContext,
    ) -> Result<bool, DispatchError> {
        let client = self
            .registry
            .get(caller)
            .await
            .ok_or_else(|| DispatchError::UnknownCaller(caller.to_string()))?;

        let context = EvaluationContext {
            environment: self.environment.clone(),
            user_id: user.user_id.clone(),
            app_name: caller.to_string(),
            remote_address: user.remote_address.clone(),
            properties: HashMap::from([("podName".to_string(), user.pod_name.clone())]),
        };

        let span = flag_tracing::flag_evaluation_span!(feature, caller);
        let enabled = span.in_scope(|| client.is_enabled(feature, &context));
        span.record("feature.enabled", enabled);

        Ok(enabled)
    }
}
