//! Configuration types and loading logic.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use flag_tracing::TracingConfig;
use serde::Deserialize;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen and shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Wall-clock budget for draining in-flight requests on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Shared settings for every per-caller upstream Unleash client.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Unleash server base URL, without the `/api` suffix.
    #[serde(default)]
    pub url: String,

    /// Client API token sent as the `Authorization` header.
    #[serde(default)]
    pub token: String,

    /// Target environment placed in every evaluation context.
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Where the caller allow-list comes from. Both sources are combined.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub allowed_callers: Vec<String>,

    /// NAIS application manifest whose inbound access policy lists the callers.
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "default".to_string()
}

fn default_refresh_interval() -> u64 {
    15
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            environment: default_environment(),
            refresh_interval_secs: default_refresh_interval(),
            metrics_interval_secs: default_metrics_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Deployment variables (`UNLEASH_SERVER_API_*`, `PORT`, `OTEL_*`)
    /// 2. Environment variables (FLAG_PROXY_ prefix, __ for nesting)
    /// 3. TOML config file
    /// 4. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let mut config: ProxyConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("FLAG_PROXY_").split("__"))
            .extract()?;

        config.apply_deployment_env();

        if config.upstream.url.trim().is_empty() {
            anyhow::bail!("upstream.url is not set (config file, FLAG_PROXY_UPSTREAM__URL or UNLEASH_SERVER_API_URL)");
        }

        Ok(config)
    }

    /// Direct env var overrides for values injected by the platform.
    fn apply_deployment_env(&mut self) {
        if let Some(url) = non_empty_var("UNLEASH_SERVER_API_URL") {
            self.upstream.url = url;
        }
        if let Some(token) = non_empty_var("UNLEASH_SERVER_API_TOKEN") {
            self.upstream.token = token;
        }
        if let Some(environment) = non_empty_var("UNLEASH_SERVER_API_ENV") {
            self.upstream.environment = environment;
        }
        if let Some(port) = non_empty_var("PORT") {
            let host = self
                .server
                .listen_address
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.listen_address = format!("{host}:{port}");
        }
        if let Some(endpoint) = non_empty_var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.tracing.otlp_endpoint = Some(endpoint);
        }
        if let Some(service_name) = non_empty_var("OTEL_SERVICE_NAME") {
            self.tracing.service_name = service_name;
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
