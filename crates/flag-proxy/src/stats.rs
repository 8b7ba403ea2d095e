//! Atomic flag check counters.
//!
//! Monotonic display counters served at `/api/stats`; `Relaxed` ordering is
//! enough since nothing synchronizes on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::error::RequestError;

#[derive(Default)]
struct StatsInner {
    total_requests: AtomicU64,
    enabled: AtomicU64,
    disabled: AtomicU64,
    method_not_allowed: AtomicU64,
    missing_feature: AtomicU64,
    invalid_feature: AtomicU64,
    invalid_body: AtomicU64,
    missing_app_name: AtomicU64,
    unknown_app_name: AtomicU64,
}

/// Shared request statistics. Cheap to clone (Arc).
#[derive(Clone, Default)]
pub struct ProxyStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct ErrorCounts {
    pub method_not_allowed: u64,
    pub missing_feature: u64,
    pub invalid_feature: u64,
    pub invalid_body: u64,
    pub missing_app_name: u64,
    pub unknown_app_name: u64,
}

/// Snapshot of current stats values, serializable to JSON.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub enabled: u64,
    pub disabled: u64,
    pub errors: ErrorCounts,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_requests(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self, enabled: bool) {
        let counter = if enabled {
            &self.inner.enabled
        } else {
            &self.inner.disabled
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: &RequestError) {
        let counter = match err {
            RequestError::MethodNotAllowed => &self.inner.method_not_allowed,
            RequestError::MissingFlagName => &self.inner.missing_feature,
            RequestError::InvalidFlagName => &self.inner.invalid_feature,
            RequestError::MalformedBody(_) => &self.inner.invalid_body,
            RequestError::MissingCallerIdentity { .. } => &self.inner.missing_app_name,
            RequestError::UnknownCaller { .. } => &self.inner.unknown_app_name,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = &self.inner;
        StatsSnapshot {
            total_requests: inner.total_requests.load(Ordering::Relaxed),
            enabled: inner.enabled.load(Ordering::Relaxed),
            disabled: inner.disabled.load(Ordering::Relaxed),
            errors: ErrorCounts {
                method_not_allowed: inner.method_not_allowed.load(Ordering::Relaxed),
                missing_feature: inner.missing_feature.load(Ordering::Relaxed),
                invalid_feature: inner.invalid_feature.load(Ordering::Relaxed),
                invalid_body: inner.invalid_body.load(Ordering::Relaxed),
                missing_app_name: inner.missing_app_name.load(Ordering::Relaxed),
                unknown_app_name: inner.unknown_app_name.load(Ordering::Relaxed),
            },
        }
    }
}
