//! Per-caller upstream client registry.
//!
//! Owns exactly one [`FlagClient`] per allow-listed caller. Clients are built
//! concurrently at startup and joined behind a full barrier; the registry is
//! ready only when every one of them synchronized. Lookups take a read lock,
//! readiness is a separate atomic so probes never contend with dispatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::allowlist::AllowList;
use crate::upstream::listener::TracingListener;
use crate::upstream::{ClientFactory, FlagClient, UpstreamError};

/// One caller whose client could not be constructed.
#[derive(Debug)]
pub struct ClientFailure {
    pub app_name: String,
    pub cause: String,
}

impl fmt::Display for ClientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.app_name, self.cause)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitializationError {
    #[error("client registry was already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize {} upstream client(s): {}", .0.len(), join_failures(.0))]
    ClientsFailed(Vec<ClientFailure>),
}

fn join_failures(failures: &[ClientFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct ClientRegistry {
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<String, Arc<dyn FlagClient>>>,
    started: AtomicBool,
    ready: AtomicBool,
}

impl ClientRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: RwLock::new(HashMap::new()),
            started: AtomicBool::new(false),
            ready: AtomicBool::new(false),
        }
    }

    /// Construct one client per allow-listed caller, concurrently.
    ///
    /// Each client is inserted as soon as its own first sync completes, so
    /// lookups may succeed for some callers while others are still starting.
    /// Returns only after every construction has finished; any failure leaves
    /// the registry permanently not ready.
    pub async fn initialize(self: &Arc<Self>, allow_list: &AllowList) -> Result<(), InitializationError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(InitializationError::AlreadyInitialized);
        }

        tracing::info!(
            count = allow_list.len(),
            apps = %allow_list,
            "Initializing upstream clients"
        );

        let mut join_set = JoinSet::new();
        let mut task_apps = HashMap::new();

        for app_name in allow_list.iter() {
            let registry = Arc::clone(self);
            let app = app_name.to_string();
            let span = flag_tracing::client_init_span!(&app);

            let abort_handle = join_set.spawn(
                async move {
                    let start = Instant::now();
                    let result = registry.connect(&app).await;
                    tracing::Span::current().record("latency_ms", start.elapsed().as_millis() as u64);
                    result.map_err(|e| ClientFailure {
                        app_name: app,
                        cause: e.to_string(),
                    })
                }
                .instrument(span),
            );
            task_apps.insert(abort_handle.id(), app_name.to_string());
        }

        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => failures.push(failure),
                Err(join_error) => failures.push(ClientFailure {
                    app_name: task_apps
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_else(|| "<unknown>".to_string()),
                    cause: format!("initialization task failed: {join_error}"),
                }),
            }
        }

        if !failures.is_empty() {
            failures.sort_by(|a, b| a.app_name.cmp(&b.app_name));
            for failure in &failures {
                tracing::error!(
                    app_name = %failure.app_name,
                    error = %failure.cause,
                    "Upstream client failed to initialize"
                );
            }
            return Err(InitializationError::ClientsFailed(failures));
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn connect(&self, app_name: &str) -> Result<(), UpstreamError> {
        tracing::info!(app_name = %app_name, "Initializing upstream client");

        let listener = Arc::new(TracingListener::new(app_name));
        let client = self.factory.connect(app_name, listener).await?;

        self.clients
            .write()
            .await
            .insert(app_name.to_string(), client);

        tracing::info!(app_name = %app_name, "Upstream client registered in proxy");
        Ok(())
    }

    /// The caller's client, if it exists and finished initializing.
    pub async fn get(&self, app_name: &str) -> Option<Arc<dyn FlagClient>> {
        self.clients.read().await.get(app_name).cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Release every client: stop background sync and flush usage metrics.
    ///
    /// The map is emptied under the lock; clients close concurrently after it
    /// is released.
    pub async fn close(&self) {
        let clients = std::mem::take(&mut *self.clients.write().await);

        let mut join_set = JoinSet::new();
        for (app_name, client) in clients {
            tracing::info!(app_name = %app_name, "Closing upstream client");
            join_set.spawn(async move { client.close().await });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "Upstream client close task failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::{Barrier, Semaphore};

    use crate::upstream::listener::ClientListener;
    use crate::upstream::EvaluationContext;

    /// Client answering from a fixed set of enabled `(flag, user)` pairs.
    pub(crate) struct StubClient {
        pub(crate) enabled: HashSet<(String, String)>,
        pub(crate) closed: AtomicBool,
        pub(crate) seen: Mutex<Vec<(String, EvaluationContext)>>,
        pub(crate) close_barrier: Option<Arc<Barrier>>,
    }

    #[async_trait]
    impl FlagClient for StubClient {
        fn is_enabled(&self, feature: &str, context: &EvaluationContext) -> bool {
            self.seen
                .lock()
                .unwrap()
                .push((feature.to_string(), context.clone()));
            self.enabled
                .contains(&(feature.to_string(), context.user_id.clone()))
        }

        async fn close(&self) {
            if let Some(barrier) = &self.close_barrier {
                barrier.wait().await;
            }
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Factory with per-app failure injection and an optional gate that
    /// holds every construction until permits are added.
    #[derive(Default)]
    pub(crate) struct StubFactory {
        pub(crate) failing: HashSet<String>,
        pub(crate) enabled: HashSet<(String, String)>,
        pub(crate) gate: Option<Arc<Semaphore>>,
        /// Shared by every client's `close`, which waits on it.
        pub(crate) close_barrier: Option<Arc<Barrier>>,
        pub(crate) connects: AtomicUsize,
        pub(crate) clients: Mutex<HashMap<String, Arc<StubClient>>>,
    }

    #[async_trait]
    impl ClientFactory for StubFactory {
        async fn connect(
            &self,
            app_name: &str,
            _listener: Arc<dyn ClientListener>,
        ) -> Result<Arc<dyn FlagClient>, UpstreamError> {
            self.connects.fetch_add(1, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }

            if self.failing.contains(app_name) {
                return Err(UpstreamError::Unauthorized(401));
            }

            let client = Arc::new(StubClient {
                enabled: self.enabled.clone(),
                closed: AtomicBool::new(false),
                seen: Mutex::new(Vec::new()),
                close_barrier: self.close_barrier.clone(),
            });
            self.clients
                .lock()
                .unwrap()
                .insert(app_name.to_string(), client.clone());
            Ok(client)
        }
    }

    fn allow(apps: &[&str]) -> AllowList {
        AllowList::new(apps.iter().copied()).unwrap()
    }

    #[tokio::test]
    async fn test_all_clients_ready() {
        let factory = Arc::new(StubFactory::default());
        let registry = Arc::new(ClientRegistry::new(factory.clone()));
        assert!(!registry.is_ready());

        registry.initialize(&allow(&["app1", "app2"])).await.unwrap();

        assert!(registry.is_ready());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert!(registry.get("app1").await.is_some());
        assert!(registry.get("app2").await.is_some());
        assert!(registry.get("app3").await.is_none());
    }

    #[tokio::test]
    async fn test_one_failure_reports_it_and_never_becomes_ready() {
        let factory = Arc::new(StubFactory {
            failing: HashSet::from(["app2".to_string()]),
            ..Default::default()
        });
        let registry = Arc::new(ClientRegistry::new(factory.clone()));

        let err = registry
            .initialize(&allow(&["app1", "app2", "app3"]))
            .await
            .unwrap_err();

        match &err {
            InitializationError::ClientsFailed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].app_name, "app2");
                assert!(failures[0].cause.contains("401"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("app2"));

        // The barrier still waited for and kept the successful constructions
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
        assert!(registry.get("app1").await.is_some());
        assert!(registry.get("app3").await.is_some());
        assert!(!registry.is_ready());

        // A second attempt cannot flip readiness
        assert!(matches!(
            registry.initialize(&allow(&["app1"])).await,
            Err(InitializationError::AlreadyInitialized)
        ));
        assert!(!registry.is_ready());
    }

    #[tokio::test]
    async fn test_initialize_waits_for_every_construction() {
        let gate = Arc::new(Semaphore::new(0));
        let factory = Arc::new(StubFactory {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let registry = Arc::new(ClientRegistry::new(factory.clone()));

        let init = tokio::spawn({
            let registry = registry.clone();
            async move { registry.initialize(&allow(&["app1", "app2", "app3"])).await }
        });

        // All three constructions start and block on the gate
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.connects.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!init.is_finished());
        assert!(registry.get("app1").await.is_none());

        // One completes: visible to readers while the barrier still holds
        gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.clients.lock().unwrap().len() < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!init.is_finished());
        assert!(!registry.is_ready());

        let visible = ["app1", "app2", "app3"].len()
            - count_missing(&registry, &["app1", "app2", "app3"]).await;
        assert_eq!(visible, 1);

        gate.add_permits(2);
        init.await.unwrap().unwrap();
        assert!(registry.is_ready());
        assert_eq!(factory.connects.load(Ordering::SeqCst), 3);
    }

    async fn count_missing(registry: &ClientRegistry, apps: &[&str]) -> usize {
        let mut missing = 0;
        for app in apps {
            if registry.get(app).await.is_none() {
                missing += 1;
            }
        }
        missing
    }

    #[tokio::test]
    async fn test_concurrent_lookups_during_initialize() {
        let gate = Arc::new(Semaphore::new(0));
        let factory = Arc::new(StubFactory {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let registry = Arc::new(ClientRegistry::new(factory.clone()));
        let apps: Vec<String> = (0..16).map(|i| format!("app{i}")).collect();
        let allow_list = AllowList::new(apps.clone()).unwrap();

        let init = tokio::spawn({
            let registry = registry.clone();
            async move { registry.initialize(&allow_list).await }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let apps = apps.clone();
                tokio::spawn(async move {
                    let mut observed = 0;
                    while !registry.is_ready() {
                        for app in &apps {
                            if let Some(client) = registry.get(app).await {
                                // Entries are only visible fully constructed
                                assert!(!client.is_enabled("flag", &EvaluationContext::default()));
                                observed += 1;
                            }
                        }
                        tokio::task::yield_now().await;
                    }
                    observed
                })
            })
            .collect();

        for _ in 0..apps.len() {
            gate.add_permits(1);
            tokio::task::yield_now().await;
        }

        init.await.unwrap().unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        for app in &apps {
            assert!(registry.get(app).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_close_releases_every_client() {
        let factory = Arc::new(StubFactory::default());
        let registry = Arc::new(ClientRegistry::new(factory.clone()));
        registry.initialize(&allow(&["app1", "app2"])).await.unwrap();

        registry.close().await;

        assert!(registry.get("app1").await.is_none());
        assert!(registry.get("app2").await.is_none());
        for client in factory.clients.lock().unwrap().values() {
            assert!(client.closed.load(Ordering::SeqCst));
        }

        // Closing again finds nothing left to release
        registry.close().await;
    }

    #[tokio::test]
    async fn test_close_runs_clients_concurrently_outside_the_lock() {
        // Each close waits until both clients and the test have arrived,
        // which only happens if they run at the same time.
        let barrier = Arc::new(Barrier::new(3));
        let factory = Arc::new(StubFactory {
            close_barrier: Some(barrier.clone()),
            ..Default::default()
        });
        let registry = Arc::new(ClientRegistry::new(factory.clone()));
        registry.initialize(&allow(&["app1", "app2"])).await.unwrap();

        let closing = tokio::spawn({
            let registry = registry.clone();
            async move { registry.close().await }
        });

        // Lookups are answered while the clients are still flushing
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get("app1").await.is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("lookup blocked by close");

        tokio::time::timeout(Duration::from_secs(5), barrier.wait())
            .await
            .expect("clients were closed one after another");
        tokio::time::timeout(Duration::from_secs(5), closing)
            .await
            .unwrap()
            .unwrap();

        for client in factory.clients.lock().unwrap().values() {
            assert!(client.closed.load(Ordering::SeqCst));
        }
    }
}
