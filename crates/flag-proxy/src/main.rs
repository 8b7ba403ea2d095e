//! Flag Proxy: shared feature-flag lookup service holding one upstream
//! Unleash client per allow-listed caller application.

mod allowlist;
mod config;
mod dispatch;
mod error;
mod registry;
mod server;
mod stats;
mod telemetry;
mod upstream;
mod validation;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use allowlist::AllowList;
use config::ProxyConfig;
use dispatch::Dispatcher;
use registry::ClientRegistry;
use server::AppState;
use stats::ProxyStats;
use telemetry::ProxyMetrics;
use upstream::unleash::UnleashClientFactory;

fn main() -> anyhow::Result<()> {
    // Determine config path
    let config_path = {
        let args: Vec<String> = std::env::args().collect();
        args.iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1).cloned())
            .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
            .or_else(|| std::env::var("FLAG_PROXY_CONFIG").ok())
            .unwrap_or_else(|| "flag-proxy.toml".to_string())
    };

    let config = ProxyConfig::load(&config_path)?;

    // The tonic gRPC exporter needs a reactor context
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _tracing_guard = flag_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            upstream_url = %config.upstream.url,
            environment = %config.upstream.environment,
            "Starting flag-proxy"
        );

        let result = run(config).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "flag-proxy exited with an error");
        }
        result
    })
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    let allow_list = AllowList::from_config(&config.access)?;
    let factory = UnleashClientFactory::new(&config.upstream)?;

    let registry = Arc::new(ClientRegistry::new(Arc::new(factory)));
    let dispatcher = Dispatcher::new(registry.clone(), config.upstream.environment.clone());

    let state = AppState {
        dispatcher,
        registry: registry.clone(),
        stats: ProxyStats::new(),
        metrics: ProxyMetrics::global(),
        allowed_callers: allow_list.to_string(),
    };

    // Probes are served while the clients synchronize
    let listener = tokio::net::TcpListener::bind(&config.server.listen_address).await?;
    tracing::info!(address = %config.server.listen_address, "Flag proxy listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let app = server::router(state);
    let mut server_task = tokio::spawn(server::serve(listener, app, async move {
        let _ = shutdown_rx.changed().await;
    }));

    let signal = server::shutdown_signal();
    tokio::pin!(signal);

    tokio::select! {
        result = registry.initialize(&allow_list) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Upstream client initialization failed");
                let _ = shutdown_tx.send(true);
                registry.close().await;
                return Err(e.into());
            }
            tracing::info!(count = allow_list.len(), "All upstream clients ready");

            tokio::select! {
                () = &mut signal => {}
                joined = &mut server_task => {
                    registry.close().await;
                    return server_exit(joined);
                }
            }
        }
        () = &mut signal => {
            tracing::warn!("Shutdown requested before upstream clients were ready");
        }
        joined = &mut server_task => {
            registry.close().await;
            return server_exit(joined);
        }
    }

    let _ = shutdown_tx.send(true);

    let deadline = Duration::from_secs(config.server.shutdown_timeout_secs);
    match tokio::time::timeout(deadline, &mut server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server error during shutdown"),
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task failed during shutdown"),
        Err(_) => {
            tracing::warn!(
                timeout_secs = config.server.shutdown_timeout_secs,
                "Graceful shutdown timed out, aborting in-flight requests"
            );
            server_task.abort();
        }
    }

    registry.close().await;
    tracing::info!("Upstream clients closed");
    Ok(())
}

/// The server task ended before a shutdown was requested.
fn server_exit(joined: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server stopped unexpectedly")),
        Ok(Err(e)) => Err(e.context("HTTP server failed")),
        Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {e}")),
    }
}
