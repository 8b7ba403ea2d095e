//! Per-client usage counters reported to the Unleash metrics endpoint.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ToggleCount {
    pub yes: u64,
    pub no: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub toggles: HashMap<String, ToggleCount>,
}

/// Body of `POST /api/client/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub app_name: String,
    pub instance_id: String,
    pub environment: String,
    pub bucket: Bucket,
}

struct OpenBucket {
    start: DateTime<Utc>,
    toggles: HashMap<String, ToggleCount>,
}

/// Accumulates yes/no counts until the next report.
pub struct MetricsBucket {
    inner: Mutex<OpenBucket>,
}

impl MetricsBucket {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OpenBucket {
                start: Utc::now(),
                toggles: HashMap::new(),
            }),
        }
    }

    pub fn record(&self, feature: &str, enabled: bool) {
        let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = bucket.toggles.entry(feature.to_string()).or_default();
        if enabled {
            count.yes += 1;
        } else {
            count.no += 1;
        }
    }

    /// Close the current bucket and start a new one.
    /// Returns `None` when nothing was counted.
    pub fn take(&self) -> Option<Bucket> {
        let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let start = std::mem::replace(&mut bucket.start, now);
        let toggles = std::mem::take(&mut bucket.toggles);

        if toggles.is_empty() {
            return None;
        }

        Some(Bucket {
            start,
            stop: now,
            toggles,
        })
    }

    /// Put counts from an unsent bucket back so the next report includes them.
    pub fn restore(&self, unsent: Bucket) {
        let mut bucket = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        bucket.start = bucket.start.min(unsent.start);
        for (feature, count) in unsent.toggles {
            let entry = bucket.toggles.entry(feature).or_default();
            entry.yes += count.yes;
            entry.no += count.no;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_resets() {
        let metrics = MetricsBucket::new();
        metrics.record("my-flag", true);
        metrics.record("my-flag", true);
        metrics.record("my-flag", false);
        metrics.record("other", false);

        let bucket = metrics.take().unwrap();
        assert_eq!(bucket.toggles["my-flag"], ToggleCount { yes: 2, no: 1 });
        assert_eq!(bucket.toggles["other"], ToggleCount { yes: 0, no: 1 });
        assert!(bucket.start <= bucket.stop);

        assert!(metrics.take().is_none());
    }

    #[test]
    fn test_restore_merges_unsent_counts() {
        let metrics = MetricsBucket::new();
        metrics.record("my-flag", true);
        let unsent = metrics.take().unwrap();

        metrics.record("my-flag", false);
        metrics.restore(unsent);

        let bucket = metrics.take().unwrap();
        assert_eq!(bucket.toggles["my-flag"], ToggleCount { yes: 1, no: 1 });
    }

    #[test]
    fn test_payload_shape() {
        let metrics = MetricsBucket::new();
        metrics.record("my-flag", true);
        let payload = MetricsPayload {
            app_name: "app1".to_string(),
            instance_id: "i-1".to_string(),
            environment: "production".to_string(),
            bucket: metrics.take().unwrap(),
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["appName"], "app1");
        assert_eq!(json["instanceId"], "i-1");
        assert_eq!(json["bucket"]["toggles"]["my-flag"]["yes"], 1);
        assert!(json["bucket"]["start"].is_string());
    }
}
