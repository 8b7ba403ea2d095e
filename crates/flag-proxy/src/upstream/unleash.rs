//! Unleash client API over HTTP.
//!
//! Each [`UnleashClient`] registers itself under its caller's app name, keeps
//! an in-memory toggle snapshot refreshed in the background, and reports
//! usage counts. Evaluation never touches the network.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, ETAG, IF_NONE_MATCH, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::listener::ClientListener;
use super::metrics::{MetricsBucket, MetricsPayload};
use super::strategy::{FeatureSet, FeaturesResponse, SUPPORTED_STRATEGIES};
use super::{ClientFactory, EvaluationContext, FlagClient, UpstreamError};
use crate::config::UpstreamConfig;

const SDK_VERSION: &str = concat!("flag-proxy:", env!("CARGO_PKG_VERSION"));

/// First retry delay for the initial sync; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Body of `POST /api/client/register`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub app_name: String,
    pub instance_id: String,
    pub sdk_version: String,
    pub strategies: Vec<String>,
    pub started: DateTime<Utc>,
    /// Refresh interval in milliseconds.
    pub interval: u64,
}

/// Builds one [`UnleashClient`] per caller, sharing a connection pool.
pub struct UnleashClientFactory {
    http: reqwest::Client,
    api_url: String,
    token: String,
    environment: String,
    refresh_interval: Duration,
    metrics_interval: Duration,
}

impl UnleashClientFactory {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let api_url = format!("{}/api", config.url.trim_end_matches('/'));
        reqwest::Url::parse(&api_url).map_err(|e| UpstreamError::InvalidUrl {
            url: api_url.clone(),
            reason: e.to_string(),
        })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(UpstreamError::ClientBuild)?;

        Ok(Self {
            http,
            api_url,
            token: config.token.clone(),
            environment: config.environment.clone(),
            refresh_interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
            metrics_interval: Duration::from_secs(config.metrics_interval_secs.max(1)),
        })
    }

    #[cfg(test)]
    fn with_intervals(mut self, refresh: Duration, metrics: Duration) -> Self {
        self.refresh_interval = refresh;
        self.metrics_interval = metrics;
        self
    }
}

#[async_trait]
impl ClientFactory for UnleashClientFactory {
    async fn connect(
        &self,
        app_name: &str,
        listener: Arc<dyn ClientListener>,
    ) -> Result<Arc<dyn FlagClient>, UpstreamError> {
        let api = Api {
            http: self.http.clone(),
            api_url: self.api_url.clone(),
            token: self.token.clone(),
            app_name: app_name.to_string(),
            instance_id: format!("flag-proxy-{}", Uuid::new_v4()),
        };

        let client = UnleashClient::start(
            api,
            self.environment.clone(),
            self.refresh_interval,
            self.metrics_interval,
            listener,
        )
        .await?;

        Ok(Arc::new(client))
    }
}

enum FetchOutcome {
    NotModified,
    Updated {
        features: FeatureSet,
        etag: Option<String>,
    },
}

/// Endpoint calls for one app name / instance id.
struct Api {
    http: reqwest::Client,
    api_url: String,
    token: String,
    app_name: String,
    instance_id: String,
}

impl Api {
    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{path}", self.api_url))
            .header("UNLEASH-APPNAME", &self.app_name)
            .header("UNLEASH-INSTANCEID", &self.instance_id)
            .header(USER_AGENT, SDK_VERSION);

        if !self.token.is_empty() {
            builder = builder.header(AUTHORIZATION, &self.token);
        }
        builder
    }

    async fn fetch_features(&self, etag: Option<&str>) -> Result<FetchOutcome, UpstreamError> {
        let mut builder = self.request(Method::GET, "/client/features");
        if let Some(etag) = etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }

        let response = builder.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        check_status(response.status())?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        let parsed: FeaturesResponse = serde_json::from_slice(&body)?;

        Ok(FetchOutcome::Updated {
            features: FeatureSet::from(parsed),
            etag,
        })
    }

    async fn register(&self, registration: &Registration) -> Result<(), UpstreamError> {
        let response = self
            .request(Method::POST, "/client/register")
            .json(registration)
            .send()
            .await?;
        check_status(response.status())
    }

    async fn send_metrics(&self, payload: &MetricsPayload) -> Result<(), UpstreamError> {
        let response = self
            .request(Method::POST, "/client/metrics")
            .json(payload)
            .send()
            .await?;
        check_status(response.status())
    }
}

fn check_status(status: StatusCode) -> Result<(), UpstreamError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(UpstreamError::Unauthorized(status.as_u16()));
    }
    Err(UpstreamError::Status(status.as_u16()))
}

/// State shared between the client handle and its background tasks.
struct Shared {
    api: Api,
    environment: String,
    features: RwLock<FeatureSet>,
    etag: Mutex<Option<String>>,
    metrics: MetricsBucket,
    listener: Arc<dyn ClientListener>,
}

impl Shared {
    async fn sync(&self) -> Result<(), UpstreamError> {
        let etag = self.etag.lock().unwrap_or_else(|e| e.into_inner()).clone();

        match self.api.fetch_features(etag.as_deref()).await? {
            FetchOutcome::NotModified => {}
            FetchOutcome::Updated { features, etag } => {
                tracing::debug!(
                    app_name = %self.api.app_name,
                    toggles = features.toggle_count(),
                    "Toggle snapshot updated"
                );
                *self.features.write().unwrap_or_else(|e| e.into_inner()) = features;
                *self.etag.lock().unwrap_or_else(|e| e.into_inner()) = etag;
            }
        }
        Ok(())
    }

    /// Retry transient failures until the first snapshot lands.
    async fn initial_sync(&self) -> Result<(), UpstreamError> {
        let mut delay = INITIAL_BACKOFF;
        loop {
            match self.sync().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    let backing_off = UpstreamError::BackingOff {
                        delay,
                        source: Box::new(e),
                    };
                    self.listener.on_error(&backing_off);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    self.listener.on_error(&e);
                    return Err(e);
                }
            }
        }
    }

    async fn register(&self, refresh_interval: Duration) {
        let registration = Registration {
            app_name: self.api.app_name.clone(),
            instance_id: self.api.instance_id.clone(),
            sdk_version: SDK_VERSION.to_string(),
            strategies: SUPPORTED_STRATEGIES.iter().map(|s| s.to_string()).collect(),
            started: Utc::now(),
            interval: refresh_interval.as_millis() as u64,
        };

        match self.api.register(&registration).await {
            Ok(()) => self.listener.on_registered(&registration),
            Err(e) => self
                .listener
                .on_warning(&format!("client registration failed: {e}")),
        }
    }

    async fn flush_metrics(&self) {
        let Some(bucket) = self.metrics.take() else {
            return;
        };

        let payload = MetricsPayload {
            app_name: self.api.app_name.clone(),
            instance_id: self.api.instance_id.clone(),
            environment: self.environment.clone(),
            bucket,
        };

        match self.api.send_metrics(&payload).await {
            Ok(()) => self.listener.on_sent(&payload),
            Err(e) => {
                self.listener.on_error(&e);
                self.metrics.restore(payload.bucket);
            }
        }
    }
}

/// A synchronized Unleash client for one caller application.
pub struct UnleashClient {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UnleashClient {
    /// Register, block until the first snapshot is loaded, then start the
    /// refresh and metrics loops.
    async fn start(
        api: Api,
        environment: String,
        refresh_interval: Duration,
        metrics_interval: Duration,
        listener: Arc<dyn ClientListener>,
    ) -> Result<Self, UpstreamError> {
        let shared = Arc::new(Shared {
            api,
            environment,
            features: RwLock::new(FeatureSet::default()),
            etag: Mutex::new(None),
            metrics: MetricsBucket::new(),
            listener,
        });

        let start = Instant::now();
        shared.register(refresh_interval).await;
        shared.initial_sync().await?;
        shared.listener.on_ready();

        tracing::debug!(
            app_name = %shared.api.app_name,
            latency_ms = start.elapsed().as_millis() as u64,
            "Initial toggle sync complete"
        );

        let (shutdown, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(refresh_loop(
                shared.clone(),
                refresh_interval,
                shutdown.subscribe(),
            )),
            tokio::spawn(metrics_loop(
                shared.clone(),
                metrics_interval,
                shutdown.subscribe(),
            )),
        ];

        Ok(Self {
            shared,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

#[async_trait]
impl FlagClient for UnleashClient {
    fn is_enabled(&self, feature: &str, context: &EvaluationContext) -> bool {
        let enabled = self
            .shared
            .features
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_enabled(feature, context);

        self.shared.metrics.record(feature, enabled);
        self.shared.listener.on_count(feature, enabled);
        enabled
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }

        self.shared.flush_metrics().await;
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn refresh_loop(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = shared.sync().await {
                    shared.listener.on_error(&e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn metrics_loop(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = ticker(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.flush_metrics().await,
            _ = shutdown.changed() => break,
        }
    }
}
