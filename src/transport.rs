//! Subgraph transports.
//!
//! Outbound subgraph calls go through [`SubgraphTransport`]. [`HttpTransport`] posts over
//! plain HTTP; [`BrokerTransport`] bridges the same request onto a request/reply [`Broker`]
//! for subgraphs that are only reachable through the message bus.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{Request, Response, StatusCode};
use std::{sync::Arc, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::{GatewayConfig, TransportMode};
use crate::error::{Error, Result};
use crate::schema_registry::SchemaFetcher;

/// Request/reply messaging
#[async_trait]
pub trait Broker: Send + Sync {
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes>;
}

/// A request delivered to a [`LocalBroker`] subscriber
#[derive(Debug)]
pub struct BrokerRequest {
    pub subject: String,
    pub payload: Bytes,
    reply: oneshot::Sender<Bytes>,
}

impl BrokerRequest {
    pub fn respond(self, payload: impl Into<Bytes>) -> bool {
        self.reply.send(payload.into()).is_ok()
    }
}

/// In-process broker; one responder per subject
#[derive(Default, Clone)]
pub struct LocalBroker {
    responders: Arc<DashMap<String, mpsc::Sender<BrokerRequest>>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a subject. A later subscription on the same subject replaces the earlier one.
    pub fn subscribe(&self, subject: impl Into<String>) -> mpsc::Receiver<BrokerRequest> {
        let (tx, rx) = mpsc::channel(64);
        self.responders.insert(subject.into(), tx);
        rx
    }

    pub fn unsubscribe(&self, subject: &str) {
        self.responders.remove(subject);
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        let responder = self
            .responders
            .get(subject)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Broker(format!("no responders for subject '{}'", subject)))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = BrokerRequest {
            subject: subject.to_string(),
            payload,
            reply: reply_tx,
        };

        let exchange = async move {
            responder
                .send(request)
                .await
                .map_err(|_| Error::Broker(format!("subject '{}' is closed", subject)))?;
            reply_rx
                .await
                .map_err(|_| Error::Broker(format!("responder for '{}' dropped request", subject)))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Broker(format!("request to '{}' timed out after {:?}", subject, timeout)))?
    }
}

/// Something that can carry an HTTP request to a subgraph
#[async_trait]
pub trait SubgraphTransport: Send + Sync {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// Direct HTTP transport backed by reqwest
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SubgraphTransport for HttpTransport {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();
        let response = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(response.status());
        for (name, value) in response.headers() {
            builder = builder.header(name, value);
        }
        let body = response.bytes().await?;
        builder
            .body(body)
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Bridges HTTP requests onto the broker, addressed by the request host
pub struct BrokerTransport {
    broker: Arc<dyn Broker>,
    timeout: Duration,
}

impl BrokerTransport {
    pub fn new(broker: Arc<dyn Broker>, timeout: Duration) -> Self {
        Self { broker, timeout }
    }
}

#[async_trait]
impl SubgraphTransport for BrokerTransport {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let subject = request
            .uri()
            .host()
            .ok_or_else(|| Error::Transport(format!("request uri '{}' has no host", request.uri())))?
            .to_string();

        debug!(subject = %subject, "forwarding subgraph request over broker");
        let reply = self
            .broker
            .request(&subject, request.into_body(), self.timeout)
            .await?;

        Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(reply)
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Schema fetcher and subgraph transport for the configured transport mode.
///
/// Broker mode needs a broker that answers for every subgraph host, so it is refused when
/// none is given.
pub fn from_config(
    config: &GatewayConfig,
    broker: Option<Arc<dyn Broker>>,
) -> Result<(SchemaFetcher, Arc<dyn SubgraphTransport>)> {
    let registry = &config.registry;
    let fetcher = SchemaFetcher::new(registry.request_timeout)?;
    match (config.transport, broker) {
        (TransportMode::Http, _) => Ok((fetcher, Arc::new(HttpTransport::new(registry.request_timeout)?))),
        (TransportMode::Broker, Some(broker)) => Ok((
            fetcher.with_broker(broker.clone(), registry.broker_timeout),
            Arc::new(BrokerTransport::new(broker, registry.broker_timeout)),
        )),
        (TransportMode::Broker, None) => Err(Error::Config(
            "transport 'broker' requires a message broker, none is configured".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_local_broker_request_reply() {
        let broker = LocalBroker::new();
        let mut requests = broker.subscribe("accounts");

        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let echoed = request.payload.clone();
                request.respond(echoed);
            }
        });

        let reply = broker
            .request("accounts", Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_local_broker_without_responder() {
        let broker = LocalBroker::new();
        let result = broker
            .request("nobody", Bytes::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Broker(_))));
    }

    #[tokio::test]
    async fn test_local_broker_times_out() {
        let broker = LocalBroker::new();
        // Keep the receiver alive but never answer.
        let _requests = broker.subscribe("slow");

        let result = broker
            .request("slow", Bytes::new(), Duration::from_millis(20))
            .await;
        match result {
            Err(Error::Broker(message)) => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broker_transport_addresses_by_host() {
        let broker = LocalBroker::new();
        let mut requests = broker.subscribe("products");

        tokio::spawn(async move {
            if let Some(request) = requests.recv().await {
                assert_eq!(request.subject, "products");
                request.respond(r#"{"data":{"ok":true}}"#);
            }
        });

        let transport = BrokerTransport::new(Arc::new(broker), Duration::from_secs(1));
        let request = Request::post("http://products/graphql")
            .body(Bytes::from_static(b"{\"query\":\"{ ok }\"}"))
            .unwrap();

        let response = transport.round_trip(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &Bytes::from_static(br#"{"data":{"ok":true}}"#));
    }

    #[tokio::test]
    async fn test_broker_transport_surfaces_missing_reply() {
        let transport =
            BrokerTransport::new(Arc::new(LocalBroker::new()), Duration::from_millis(20));
        let request = Request::post("http://reviews/graphql")
            .body(Bytes::new())
            .unwrap();
        assert!(transport.round_trip(request).await.is_err());
    }

    #[test]
    fn test_broker_mode_requires_a_broker() {
        let config = GatewayConfig {
            transport: TransportMode::Broker,
            ..GatewayConfig::default()
        };
        match from_config(&config, None) {
            Err(Error::Config(message)) => assert!(message.contains("broker")),
            Err(other) => panic!("expected config error, got {:?}", other),
            Ok(_) => panic!("broker mode accepted without a broker"),
        }

        let broker: Arc<dyn Broker> = Arc::new(LocalBroker::new());
        assert!(from_config(&config, Some(broker)).is_ok());
        assert!(from_config(&GatewayConfig::default(), None).is_ok());
    }
}
