//! Upstream subscriptions over `graphql-transport-ws`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::SubscriptionWriter;
use crate::error::{Error, Result};
use crate::websocket::protocol::{GRAPHQL_TRANSPORT_WS, MessageType, ProtocolMessage};

/// One subscription to open against a subgraph
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub subgraph: String,
    pub url: String,
    pub query: String,
    pub operation_name: Option<String>,
    pub variables: Map<String, Value>,
    /// Client `connection_init` payload, forwarded as-is
    pub init_payload: Option<Value>,
    pub headers: HeaderMap,
}

/// Something that can stream subscription events from a subgraph
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// Stream events into `writer` until the upstream completes or `cancel` fires.
    ///
    /// Each event is written and flushed individually. Completing the writer is left to
    /// the caller.
    async fn run(
        &self,
        request: UpstreamRequest,
        writer: &mut dyn SubscriptionWriter,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// `graphql-transport-ws` client backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsSubscriptionClient {
    ack_timeout: Duration,
}

impl Default for WsSubscriptionClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl WsSubscriptionClient {
    pub fn new(ack_timeout: Duration) -> Self {
        Self { ack_timeout }
    }
}

/// Subgraph routing URLs are HTTP; subscriptions go to the same path over WS
pub fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

fn frame(message: ProtocolMessage) -> Result<Message> {
    Ok(Message::Text(message.to_json()?))
}

#[async_trait]
impl SubscriptionSource for WsSubscriptionClient {
    async fn run(
        &self,
        request: UpstreamRequest,
        writer: &mut dyn SubscriptionWriter,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut ws_request = websocket_url(&request.url).into_client_request()?;
        ws_request.headers_mut().insert(
            http::header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(GRAPHQL_TRANSPORT_WS),
        );
        for (name, value) in &request.headers {
            ws_request.headers_mut().insert(name, value.clone());
        }

        let (stream, _) = connect_async(ws_request).await?;
        let (mut sink, mut stream) = stream.split();
        debug!(subgraph = %request.subgraph, "connected upstream subscription");

        let mut init = ProtocolMessage::new(MessageType::ConnectionInit);
        init.payload = request.init_payload.clone();
        sink.send(frame(init)?).await?;

        let acked = tokio::time::timeout(self.ack_timeout, async {
            while let Some(message) = stream.next().await {
                if let Message::Text(text) = message? {
                    let message: ProtocolMessage = serde_json::from_str(&text)?;
                    if message.message_type == MessageType::ConnectionAck {
                        return Ok(true);
                    }
                }
            }
            Ok::<bool, Error>(false)
        })
        .await
        .map_err(|_| Error::Protocol(format!("subgraph '{}' did not acknowledge connection", request.subgraph)))??;
        if !acked {
            return Err(Error::Protocol(format!(
                "subgraph '{}' closed before acknowledging connection",
                request.subgraph
            )));
        }

        let mut payload = json!({ "query": request.query, "variables": request.variables });
        if let Some(name) = &request.operation_name {
            payload["operationName"] = Value::String(name.clone());
        }
        sink.send(frame(
            ProtocolMessage::new(MessageType::Subscribe)
                .with_id("1")
                .with_payload(payload),
        )?)
        .await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(frame(ProtocolMessage::new(MessageType::Complete).with_id("1"))?).await;
                    let _ = sink.close().await;
                    info!(subgraph = %request.subgraph, "upstream subscription cancelled");
                    return Ok(());
                }
                message = stream.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::Protocol(format!(
                                "subgraph '{}' closed the subscription stream",
                                request.subgraph
                            )));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };
                    let message: ProtocolMessage = serde_json::from_str(&text)?;
                    match message.message_type {
                        MessageType::Next => {
                            let payload = message.payload.unwrap_or(Value::Null);
                            writer.write(&serde_json::to_vec(&payload)?);
                            writer.flush().await?;
                        }
                        MessageType::Error => {
                            let errors = message.payload.unwrap_or_else(|| json!([]));
                            writer.write(&serde_json::to_vec(&json!({ "errors": errors }))?);
                            writer.flush().await?;
                            return Ok(());
                        }
                        MessageType::Complete => return Ok(()),
                        MessageType::Ping => {
                            sink.send(frame(ProtocolMessage::new(MessageType::Pong))?).await?;
                        }
                        other => debug!(subgraph = %request.subgraph, ?other, "ignoring upstream message"),
                    }
                }
            }
        }
    }
}
