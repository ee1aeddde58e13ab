//! Subgraph discovery.
//!
//! The registry owns one [`SubgraphDescriptor`] per known subgraph, re-fetches every SDL on
//! each cycle, and tells its observers about the full subgraph set whenever any SDL hash
//! changed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SubgraphConfig;
use crate::error::{Error, Result};
use crate::transport::Broker;

/// The canonical federation SDL request
pub const SERVICE_SDL_QUERY: &str = "{ _service { sdl } }";

/// Called with the full subgraph set whenever an SDL changed
#[async_trait]
pub trait SchemaObserver: Send + Sync {
    async fn update_data_sources(&self, subgraphs: Vec<SubgraphConfig>);
}

/// What the registry knows about one subgraph
#[derive(Debug, Clone)]
pub struct SubgraphDescriptor {
    pub name: String,
    pub url: String,
    pub sdl: Option<String>,
    pub hash: Option<String>,
    pub last_fetched: Option<SystemTime>,
    /// Statically registered schemas are never fetched
    pub is_static: bool,
}

impl SubgraphDescriptor {
    fn new(name: String, url: String) -> Self {
        Self {
            name,
            url,
            sdl: None,
            hash: None,
            last_fetched: None,
            is_static: false,
        }
    }

    fn to_config(&self) -> Option<SubgraphConfig> {
        self.sdl.as_ref().map(|sdl| SubgraphConfig {
            name: self.name.clone(),
            url: self.url.clone(),
            schema: sdl.clone(),
        })
    }
}

pub fn sdl_hash(sdl: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sdl.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Deserialize)]
struct ServiceEnvelope {
    data: Option<ServiceData>,
    #[serde(default)]
    errors: Option<Vec<Value>>,
}

#[derive(Deserialize)]
struct ServiceData {
    #[serde(rename = "_service")]
    service: Option<ServiceSdl>,
}

#[derive(Deserialize)]
struct ServiceSdl {
    sdl: Option<String>,
}

/// Fetches `{ _service { sdl } }` over the broker or HTTP
#[derive(Clone)]
pub struct SchemaFetcher {
    http_client: reqwest::Client,
    broker: Option<Arc<dyn Broker>>,
    broker_timeout: Duration,
}

impl SchemaFetcher {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http_client,
            broker: None,
            broker_timeout: Duration::from_secs(5),
        })
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        self.broker = Some(broker);
        self.broker_timeout = timeout;
        self
    }

    /// Fetch one subgraph's SDL. The broker is tried first when configured; any broker
    /// failure falls back to HTTP.
    pub async fn fetch_schema_sdl(&self, name: &str, url: &str) -> Result<String> {
        let body = json!({ "query": SERVICE_SDL_QUERY });

        if let Some(broker) = &self.broker {
            let payload = Bytes::from(serde_json::to_vec(&body)?);
            match broker.request(name, payload, self.broker_timeout).await {
                Ok(reply) => return parse_sdl_envelope(name, &reply),
                Err(e) => {
                    debug!(subgraph = %name, error = %e, "broker fetch failed, falling back to http");
                }
            }
        }

        let response = self
            .http_client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Fetch {
                subgraph: name.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SubgraphStatus {
                subgraph: name.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| Error::Fetch {
            subgraph: name.to_string(),
            message: e.to_string(),
        })?;
        parse_sdl_envelope(name, &bytes)
    }
}

fn parse_sdl_envelope(name: &str, body: &[u8]) -> Result<String> {
    let envelope: ServiceEnvelope = serde_json::from_slice(body).map_err(|e| Error::Fetch {
        subgraph: name.to_string(),
        message: format!("invalid response: {}", e),
    })?;

    if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
        return Err(Error::SubgraphErrors {
            subgraph: name.to_string(),
            errors: Value::Array(errors),
        });
    }

    envelope
        .data
        .and_then(|data| data.service)
        .and_then(|service| service.sdl)
        .ok_or_else(|| Error::Fetch {
            subgraph: name.to_string(),
            message: "response is missing data._service.sdl".to_string(),
        })
}

pub struct SchemaRegistry {
    subgraphs: Arc<RwLock<BTreeMap<String, SubgraphDescriptor>>>,
    observers: RwLock<Vec<Arc<dyn SchemaObserver>>>,
    fetcher: SchemaFetcher,
    poll_interval: Duration,
    trigger: Notify,
    /// Set when a static schema was added and observers have not heard about it yet
    pending: AtomicBool,
}

impl SchemaRegistry {
    pub fn new(fetcher: SchemaFetcher, poll_interval: Duration) -> Self {
        SchemaRegistry {
            subgraphs: Arc::new(RwLock::new(BTreeMap::new())),
            observers: RwLock::new(Vec::new()),
            fetcher,
            poll_interval,
            trigger: Notify::new(),
            pending: AtomicBool::new(false),
        }
    }

    /// Add a subgraph to be polled
    pub async fn add_subgraph(&self, name: &str, url: &str) -> Result<()> {
        let mut subgraphs = self.subgraphs.write().await;
        if subgraphs.contains_key(name) {
            return Err(Error::DuplicateSubgraph(name.to_string()));
        }
        subgraphs.insert(
            name.to_string(),
            SubgraphDescriptor::new(name.to_string(), url.to_string()),
        );
        Ok(())
    }

    /// Seed a statically known schema, e.g. the gateway's own local schema. It is never
    /// fetched and is included in every composition.
    pub async fn register_schema(&self, address: &str, name: &str, sdl: &str) -> Result<()> {
        let mut subgraphs = self.subgraphs.write().await;
        if subgraphs.contains_key(name) {
            return Err(Error::DuplicateSubgraph(name.to_string()));
        }
        let mut descriptor = SubgraphDescriptor::new(name.to_string(), address.to_string());
        descriptor.hash = Some(sdl_hash(sdl));
        descriptor.sdl = Some(sdl.to_string());
        descriptor.last_fetched = Some(SystemTime::now());
        descriptor.is_static = true;
        subgraphs.insert(name.to_string(), descriptor);
        self.pending.store(true, Ordering::SeqCst);
        info!(subgraph = %name, "registered static schema");
        Ok(())
    }

    /// Attach an observer
    pub async fn register(&self, observer: Arc<dyn SchemaObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Snapshot of every descriptor
    pub async fn subgraphs(&self) -> Vec<SubgraphDescriptor> {
        self.subgraphs.read().await.values().cloned().collect()
    }

    /// Wake the discovery loop for an immediate cycle
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run discovery cycles until `shutdown` is cancelled
    pub async fn start(&self, shutdown: CancellationToken) {
        info!(interval = ?self.poll_interval, "starting schema discovery");
        loop {
            self.refresh().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.trigger.notified() => debug!("schema discovery triggered"),
            }
        }
        info!("schema discovery stopped");
    }

    /// One discovery cycle. Returns whether observers were notified.
    pub async fn refresh(&self) -> bool {
        let targets: Vec<(String, String)> = self
            .subgraphs
            .read()
            .await
            .values()
            .filter(|descriptor| !descriptor.is_static)
            .map(|descriptor| (descriptor.name.clone(), descriptor.url.clone()))
            .collect();

        let fetches = targets.into_iter().map(|(name, url)| {
            let fetcher = self.fetcher.clone();
            async move {
                let result = fetcher.fetch_schema_sdl(&name, &url).await;
                (name, result)
            }
        });
        let results = join_all(fetches).await;

        let mut changed = self.pending.swap(false, Ordering::SeqCst);
        let configs = {
            let mut subgraphs = self.subgraphs.write().await;
            for (name, result) in results {
                let Some(descriptor) = subgraphs.get_mut(&name) else {
                    continue;
                };
                match result {
                    Ok(sdl) => {
                        let hash = sdl_hash(&sdl);
                        descriptor.last_fetched = Some(SystemTime::now());
                        if descriptor.hash.as_deref() == Some(hash.as_str()) {
                            continue;
                        }
                        info!(subgraph = %name, hash = %hash, "subgraph schema changed");
                        descriptor.hash = Some(hash);
                        descriptor.sdl = Some(sdl);
                        changed = true;
                    }
                    Err(e) => {
                        warn!(
                            subgraph = %name,
                            error = %e,
                            "failed to fetch subgraph schema, keeping last known schema"
                        );
                    }
                }
            }
            subgraphs
                .values()
                .filter_map(SubgraphDescriptor::to_config)
                .collect::<Vec<_>>()
        };

        if !changed {
            debug!("no subgraph schema changes");
            return false;
        }

        let observers = self.observers.read().await.clone();
        for observer in observers {
            observer.update_data_sources(configs.clone()).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBroker;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingObserver {
        calls: Mutex<Vec<Vec<SubgraphConfig>>>,
    }

    #[async_trait]
    impl SchemaObserver for RecordingObserver {
        async fn update_data_sources(&self, subgraphs: Vec<SubgraphConfig>) {
            self.calls.lock().unwrap().push(subgraphs);
        }
    }

    fn sdl_response(sdl: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "data": { "_service": { "sdl": sdl } } }))
    }

    fn fetcher() -> SchemaFetcher {
        SchemaFetcher::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_unchanged_sdl_does_not_notify() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({ "query": SERVICE_SDL_QUERY })))
            .respond_with(sdl_response("type Query { me: String }"))
            .mount(&server)
            .await;

        let registry = SchemaRegistry::new(fetcher(), Duration::from_secs(600));
        let observer = Arc::new(RecordingObserver::default());
        registry.register(observer.clone()).await;
        registry.add_subgraph("accounts", &server.uri()).await.unwrap();

        assert!(registry.refresh().await);
        assert!(!registry.refresh().await);
        assert_eq!(observer.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_sdl_notifies_with_all_subgraphs() {
        let accounts = MockServer::start().await;
        let products = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sdl_response("type Query { me: String }"))
            .up_to_n_times(1)
            .mount(&accounts)
            .await;
        Mock::given(method("POST"))
            .respond_with(sdl_response("type Query { me: String, you: String }"))
            .mount(&accounts)
            .await;
        Mock::given(method("POST"))
            .respond_with(sdl_response("type Query { products: [String] }"))
            .mount(&products)
            .await;

        let registry = SchemaRegistry::new(fetcher(), Duration::from_secs(600));
        let observer = Arc::new(RecordingObserver::default());
        registry.register(observer.clone()).await;
        registry.add_subgraph("accounts", &accounts.uri()).await.unwrap();
        registry.add_subgraph("products", &products.uri()).await.unwrap();

        assert!(registry.refresh().await);
        assert!(registry.refresh().await);

        let calls = observer.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let names: Vec<&str> = calls[1].iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["accounts", "products"]);
        assert!(calls[1][0].schema.contains("you"));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_sdl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sdl_response("type Query { me: String }"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = SchemaRegistry::new(fetcher(), Duration::from_secs(600));
        let observer = Arc::new(RecordingObserver::default());
        registry.register(observer.clone()).await;
        registry.add_subgraph("accounts", &server.uri()).await.unwrap();

        assert!(registry.refresh().await);
        assert!(!registry.refresh().await);

        let descriptors = registry.subgraphs().await;
        assert_eq!(descriptors[0].sdl.as_deref(), Some("type Query { me: String }"));
        assert_eq!(observer.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_graphql_errors_are_fetch_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{ "message": "Cannot query field _service" }]
            })))
            .mount(&server)
            .await;

        let result = fetcher().fetch_schema_sdl("accounts", &server.uri()).await;
        assert!(matches!(result, Err(Error::SubgraphErrors { .. })));
    }

    #[tokio::test]
    async fn test_non_2xx_is_fetch_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = fetcher().fetch_schema_sdl("accounts", &server.uri()).await;
        assert!(matches!(
            result,
            Err(Error::SubgraphStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_broker_fetch_with_http_fallback() {
        let broker = LocalBroker::new();
        let mut requests = broker.subscribe("accounts");
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                request.respond(
                    json!({ "data": { "_service": { "sdl": "type Query { viaBroker: Int }" } } })
                        .to_string(),
                );
            }
        });

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sdl_response("type Query { viaHttp: Int }"))
            .mount(&server)
            .await;

        let fetcher = fetcher().with_broker(Arc::new(broker), Duration::from_millis(200));
        let sdl = fetcher.fetch_schema_sdl("accounts", &server.uri()).await.unwrap();
        assert_eq!(sdl, "type Query { viaBroker: Int }");

        // No responder on "products": falls back to HTTP.
        let sdl = fetcher.fetch_schema_sdl("products", &server.uri()).await.unwrap();
        assert_eq!(sdl, "type Query { viaHttp: Int }");
    }

    #[tokio::test]
    async fn test_register_schema_guards_duplicates_and_notifies_once() {
        let registry = SchemaRegistry::new(fetcher(), Duration::from_secs(600));
        let observer = Arc::new(RecordingObserver::default());
        registry.register(observer.clone()).await;

        registry
            .register_schema("http://localhost:3000/graphql", "gateway", "type Query { health: String }")
            .await
            .unwrap();
        let duplicate = registry
            .register_schema("http://localhost:3000/graphql", "gateway", "type Query { x: Int }")
            .await;
        assert!(matches!(duplicate, Err(Error::DuplicateSubgraph(_))));

        assert!(registry.refresh().await);
        assert!(!registry.refresh().await);
        assert_eq!(observer.calls.lock().unwrap()[0][0].name, "gateway");
    }

    #[tokio::test]
    async fn test_start_stops_on_cancel() {
        let registry = Arc::new(SchemaRegistry::new(fetcher(), Duration::from_secs(600)));
        let shutdown = CancellationToken::new();
        let handle = {
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { registry.start(shutdown).await })
        };
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("discovery loop should stop")
            .unwrap();
    }
}
