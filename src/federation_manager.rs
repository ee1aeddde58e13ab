//! Turns subgraph updates into a live [`Executor`].
//!
//! Every accepted update builds a complete replacement (composition, executor, providers)
//! before publishing it with a single pointer swap. Requests snapshot the pointer and never
//! hold a lock while executing.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::SubgraphConfig;
use crate::composition::{aggregate_hash, compose};
use crate::config::{ExecutorConfig, ProviderConfig};
use crate::error::Result;
use crate::executor::Executor;
use crate::executor::subscription_client::SubscriptionSource;
use crate::provider::{NoProviders, Provider, ProviderFactory, shutdown_providers, start_providers};
use crate::readiness::ReadinessGate;
use crate::schema_registry::SchemaObserver;
use crate::transport::SubgraphTransport;

/// The published serving state of one composition
pub struct GraphQLHandler {
    executor: Arc<Executor>,
    generation: u64,
}

impl GraphQLHandler {
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Increments with every swap, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Default)]
struct ManagerState {
    last_hash: Option<String>,
    providers: Vec<Arc<dyn Provider>>,
}

pub struct FederationManager {
    handler: ArcSwapOption<GraphQLHandler>,
    readiness: ReadinessGate,
    state: Mutex<ManagerState>,
    generation: AtomicU64,
    transport: Arc<dyn SubgraphTransport>,
    subscription_source: Option<Arc<dyn SubscriptionSource>>,
    provider_factory: Arc<dyn ProviderFactory>,
    executor_options: ExecutorConfig,
    provider_options: ProviderConfig,
}

impl FederationManager {
    pub fn new(
        transport: Arc<dyn SubgraphTransport>,
        executor_options: ExecutorConfig,
        provider_options: ProviderConfig,
    ) -> Self {
        FederationManager {
            handler: ArcSwapOption::empty(),
            readiness: ReadinessGate::new(),
            state: Mutex::new(ManagerState::default()),
            generation: AtomicU64::new(0),
            transport,
            subscription_source: None,
            provider_factory: Arc::new(NoProviders),
            executor_options,
            provider_options,
        }
    }

    pub fn with_provider_factory(mut self, factory: Arc<dyn ProviderFactory>) -> Self {
        self.provider_factory = factory;
        self
    }

    pub fn with_subscription_source(mut self, source: Arc<dyn SubscriptionSource>) -> Self {
        self.subscription_source = Some(source);
        self
    }

    /// Snapshot of the handler serving right now, if any composition succeeded yet
    pub fn current_handler(&self) -> Option<Arc<GraphQLHandler>> {
        self.handler.load_full()
    }

    pub fn current_executor(&self) -> Option<Arc<Executor>> {
        self.handler.load().as_ref().map(|handler| handler.executor.clone())
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    pub async fn wait_until_ready(&self) {
        self.readiness.wait_until_ready().await
    }

    /// Build and publish a handler for `subgraphs`.
    ///
    /// Returns `Ok(true)` when a new handler was swapped in and `Ok(false)` when the update
    /// was a no-op. On error the previous handler keeps serving.
    pub async fn apply(&self, subgraphs: &[SubgraphConfig]) -> Result<bool> {
        if subgraphs.is_empty() {
            debug!("no subgraphs to compose");
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        let hash = aggregate_hash(subgraphs);
        if state.last_hash.as_deref() == Some(hash.as_str()) {
            debug!(%hash, "composition unchanged");
            return Ok(false);
        }

        let config = Arc::new(compose(subgraphs)?);
        let mut builder = Executor::builder(config.clone())
            .options(self.executor_options.clone())
            .transport(self.transport.clone());
        if let Some(source) = &self.subscription_source {
            builder = builder.subscription_source(source.clone());
        }
        let executor = Arc::new(builder.build()?);

        let providers = self.provider_factory.providers(&config);
        if let Err(e) = start_providers(&providers, self.provider_options.startup_timeout).await {
            // Some providers may have started before the batch failed.
            self.release(providers);
            return Err(e);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.handler.store(Some(Arc::new(GraphQLHandler { executor, generation })));
        let previous = std::mem::replace(&mut state.providers, providers);
        state.last_hash = Some(hash.clone());
        drop(state);

        info!(%hash, generation, subgraphs = subgraphs.len(), "swapped in new composition");
        self.release(previous);
        if self.readiness.mark_ready() {
            info!("gateway is ready");
        }
        Ok(true)
    }

    fn release(&self, providers: Vec<Arc<dyn Provider>>) {
        if providers.is_empty() {
            return;
        }
        let timeout = self.provider_options.shutdown_timeout;
        tokio::spawn(async move {
            if let Err(e) = shutdown_providers(&providers, timeout).await {
                warn!(error = %e, "failed to shut down previous providers");
            }
        });
    }

    /// Shut down the providers of the current composition
    pub async fn stop(&self) -> Result<()> {
        let providers = std::mem::take(&mut self.state.lock().await.providers);
        info!(providers = providers.len(), "stopping federation manager");
        shutdown_providers(&providers, self.provider_options.shutdown_timeout).await
    }
}

#[async_trait]
impl SchemaObserver for FederationManager {
    async fn update_data_sources(&self, subgraphs: Vec<SubgraphConfig>) {
        if let Err(e) = self.apply(&subgraphs).await {
            error!(error = %e, "failed to apply subgraph update, keeping previous composition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::ComposedConfiguration;
    use crate::error::Error;
    use crate::transport::HttpTransport;
    use crate::{GraphQLRequest, RequestContext};
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct CountingProvider {
        fail: bool,
        started: AtomicUsize,
        stopped: AtomicUsize,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn id(&self) -> &str {
            "counting"
        }

        async fn startup(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Provider {
                    provider: "counting".into(),
                    message: "broker unavailable".into(),
                });
            }
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SharedProviderFactory(Arc<CountingProvider>);

    impl ProviderFactory for SharedProviderFactory {
        fn providers(&self, _config: &ComposedConfiguration) -> Vec<Arc<dyn Provider>> {
            vec![self.0.clone()]
        }
    }

    fn manager() -> FederationManager {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(2)).unwrap());
        FederationManager::new(transport, ExecutorConfig::default(), ProviderConfig::default())
    }

    fn accounts(url: &str, sdl: &str) -> Vec<SubgraphConfig> {
        vec![SubgraphConfig {
            name: "accounts".into(),
            url: url.into(),
            schema: sdl.into(),
        }]
    }

    const SCHEMA_A: &str = "type Query { me: String }";
    const SCHEMA_B: &str = "type Query { me: String, you: String }";

    #[tokio::test]
    async fn test_unchanged_subgraphs_keep_the_same_handler() {
        let manager = manager();
        assert!(manager.apply(&accounts("http://accounts", SCHEMA_A)).await.unwrap());
        let first = manager.current_handler().unwrap();

        assert!(!manager.apply(&accounts("http://accounts", SCHEMA_A)).await.unwrap());
        let second = manager.current_handler().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.generation(), 1);
    }

    #[tokio::test]
    async fn test_changed_schema_swaps_and_old_executor_keeps_serving() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "me": "ada" } })))
            .mount(&server)
            .await;

        let manager = manager();
        manager.apply(&accounts(&server.uri(), SCHEMA_A)).await.unwrap();
        let in_flight = manager.current_executor().unwrap();

        assert!(manager.apply(&accounts(&server.uri(), SCHEMA_B)).await.unwrap());
        let current = manager.current_handler().unwrap();
        assert_eq!(current.generation(), 2);
        assert!(!Arc::ptr_eq(&in_flight, current.executor()));
        assert!(current.executor().router_schema().field("Query", "you").is_some());

        // A request that snapshotted the old executor still runs against schema A.
        assert!(in_flight.router_schema().field("Query", "you").is_none());
        let request = GraphQLRequest {
            query: "{ me }".into(),
            ..GraphQLRequest::default()
        };
        let mut out = Vec::new();
        in_flight
            .execute(&RequestContext::default(), &request, &mut out)
            .await
            .unwrap();
        let response: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(response, json!({ "data": { "me": "ada" } }));
    }

    #[tokio::test]
    async fn test_readiness_fires_on_first_success_only() {
        let manager = Arc::new(manager());
        assert!(!manager.is_ready());

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.wait_until_ready().await })
        };
        manager.apply(&accounts("http://accounts", SCHEMA_A)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(manager.is_ready());

        manager.apply(&accounts("http://accounts", SCHEMA_B)).await.unwrap();
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn test_composition_error_keeps_previous_handler() {
        let manager = manager();
        manager.apply(&accounts("http://accounts", SCHEMA_A)).await.unwrap();

        manager
            .update_data_sources(accounts("http://accounts", "type Query { broken"))
            .await;
        let handler = manager.current_handler().unwrap();
        assert_eq!(handler.generation(), 1);
    }

    #[tokio::test]
    async fn test_empty_update_is_ignored() {
        let manager = manager();
        assert!(!manager.apply(&[]).await.unwrap());
        assert!(manager.current_handler().is_none());
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn test_provider_startup_failure_aborts_swap() {
        let provider = Arc::new(CountingProvider {
            fail: true,
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        let manager = manager().with_provider_factory(Arc::new(SharedProviderFactory(provider.clone())));

        let result = manager.apply(&accounts("http://accounts", SCHEMA_A)).await;
        assert!(matches!(result, Err(Error::Providers { action: "startup", .. })));
        assert!(manager.current_handler().is_none());
        assert!(!manager.is_ready());
        assert_eq!(provider.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_shuts_down_current_providers() {
        let provider = Arc::new(CountingProvider {
            fail: false,
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
        });
        let manager = manager().with_provider_factory(Arc::new(SharedProviderFactory(provider.clone())));

        manager.apply(&accounts("http://accounts", SCHEMA_A)).await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(provider.started.load(Ordering::SeqCst), 1);
        assert_eq!(provider.stopped.load(Ordering::SeqCst), 1);

        // Nothing left to stop.
        manager.stop().await.unwrap();
        assert_eq!(provider.stopped.load(Ordering::SeqCst), 1);
    }
}
