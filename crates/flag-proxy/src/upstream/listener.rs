//! Lifecycle callbacks from an upstream client, attributed to its caller.

use super::metrics::MetricsPayload;
use super::unleash::Registration;

/// Receives lifecycle events from one caller's upstream client.
pub trait ClientListener: Send + Sync {
    fn on_ready(&self);
    fn on_error(&self, error: &dyn std::error::Error);
    fn on_warning(&self, warning: &str);
    fn on_count(&self, feature: &str, enabled: bool);
    fn on_sent(&self, payload: &MetricsPayload);
    fn on_registered(&self, registration: &Registration);
}

/// Logs every event through `tracing` with the caller's `app_name`.
pub struct TracingListener {
    app_name: String,
}

impl TracingListener {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl ClientListener for TracingListener {
    fn on_ready(&self) {
        tracing::info!(app_name = %self.app_name, "Upstream client ready");
    }

    fn on_error(&self, error: &dyn std::error::Error) {
        let message = error.to_string();

        // Retry/backoff after 429 or 5xx is transient
        if message.contains("backing off") {
            tracing::warn!(app_name = %self.app_name, warning = %message, "Upstream request retry");
            return;
        }

        tracing::error!(app_name = %self.app_name, error = %message, "Upstream client error");
    }

    fn on_warning(&self, warning: &str) {
        tracing::warn!(app_name = %self.app_name, warning = %warning, "Upstream client warning");
    }

    fn on_count(&self, feature: &str, enabled: bool) {
        tracing::debug!(
            app_name = %self.app_name,
            feature = %feature,
            enabled = enabled,
            "Feature evaluated"
        );
    }

    fn on_sent(&self, payload: &MetricsPayload) {
        tracing::debug!(
            app_name = %self.app_name,
            start = %payload.bucket.start,
            stop = %payload.bucket.stop,
            toggles = payload.bucket.toggles.len(),
            "Usage metrics sent"
        );
    }

    fn on_registered(&self, registration: &Registration) {
        tracing::info!(
            app_name = %self.app_name,
            instance_id = %registration.instance_id,
            sdk_version = %registration.sdk_version,
            strategies = ?registration.strategies,
            interval_ms = registration.interval,
            "Upstream client registered"
        );
    }
}
