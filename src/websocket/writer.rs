use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Sink, SinkExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{OutboundMessage, Protocol};
use crate::error::{Error, Result};
use crate::executor::resolver::Resolver;
use crate::executor::{SubscriptionIdentifier, SubscriptionWriter};

/// A live subscription on one connection, keyed by the client's id
#[derive(Clone)]
pub struct Registration {
    pub id: SubscriptionIdentifier,
    /// Resolver of the executor that started the subscription
    pub resolver: Arc<dyn Resolver>,
}

pub type Registrations = Arc<DashMap<String, Registration>>;

/// Sending half of a connection's outbound queue. Messages are encoded for the connection's
/// protocol before they are queued.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Message>,
    protocol: Protocol,
    abort: CancellationToken,
}

impl Outbound {
    pub fn channel(protocol: Protocol, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbound = Outbound {
            tx,
            protocol,
            abort: CancellationToken::new(),
        };
        (outbound, rx)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Fires when the connection is dropped without a close frame
    pub fn aborted(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Queue a message, waiting for room
    pub async fn send(&self, message: &OutboundMessage) -> Result<()> {
        let text = self.protocol.encode(message)?;
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(|_| Error::Transport("connection closed".into()))
    }

    /// Queue a message without waiting. A full queue means the client stopped reading.
    pub fn try_send(&self, message: &OutboundMessage) -> Result<()> {
        let text = self.protocol.encode(message)?;
        self.tx.try_send(Message::Text(text)).map_err(|e| match e {
            TrySendError::Full(_) => Error::Transport("outbound queue full".into()),
            TrySendError::Closed(_) => Error::Transport("connection closed".into()),
        })
    }

    /// Queue a close frame; the writer task stops after sending it. If the queue is full the
    /// connection is aborted instead.
    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(Message::Close(Some(frame))) {
            debug!(code, "outbound queue full, aborting connection");
            self.abort.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Drain the outbound queue into the socket until it closes, a close frame goes out, a
/// write misses its deadline, or `abort` fires.
pub async fn write_messages<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Message>,
    write_timeout: Duration,
    abort: CancellationToken,
) where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = abort.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let closing = matches!(message, Message::Close(_));
        let sent = tokio::select! {
            _ = abort.cancelled() => break,
            sent = tokio::time::timeout(write_timeout, sink.send(message)) => sent,
        };
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "websocket write failed");
                break;
            }
            Err(_) => {
                warn!(?write_timeout, "websocket write timed out");
                break;
            }
        }
        if closing {
            break;
        }
    }
    rx.close();
    if abort.is_cancelled() {
        debug!("websocket writer aborted");
        return;
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}

/// Frames the events of one subscription for its connection.
///
/// A flushed payload with a top-level `errors` key becomes an error frame, anything else a
/// next (`data` for `graphql-ws`) frame.
pub struct ConnectionWriter {
    client_id: String,
    id: SubscriptionIdentifier,
    outbound: Outbound,
    registrations: Registrations,
    buffer: Vec<u8>,
    errored: bool,
}

impl ConnectionWriter {
    pub fn new(
        client_id: impl Into<String>,
        id: SubscriptionIdentifier,
        outbound: Outbound,
        registrations: Registrations,
    ) -> Self {
        ConnectionWriter {
            client_id: client_id.into(),
            id,
            outbound,
            registrations,
            buffer: Vec::new(),
            errored: false,
        }
    }

    fn is_registered(&self) -> bool {
        self.registrations
            .get(&self.client_id)
            .is_some_and(|registration| registration.id == self.id)
    }

    /// Drop our registration. The client may have reused the id for a newer subscription,
    /// which must stay.
    fn deregister(&self) -> bool {
        self.registrations
            .remove_if(&self.client_id, |_, registration| registration.id == self.id)
            .is_some()
    }
}

#[async_trait]
impl SubscriptionWriter for ConnectionWriter {
    fn write(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        if !self.is_registered() {
            return Err(Error::SubscriptionNotFound(self.client_id.clone()));
        }

        let mut payload: Value = serde_json::from_slice(&buffer)?;
        let message = match payload.get_mut("errors").map(Value::take) {
            Some(errors) => {
                self.errored = true;
                OutboundMessage::Error {
                    id: self.client_id.clone(),
                    payload: errors,
                }
            }
            None => OutboundMessage::Next {
                id: self.client_id.clone(),
                payload,
            },
        };
        self.outbound.send(&message).await
    }

    async fn complete(&mut self) {
        if !self.deregister() {
            return;
        }
        // An error frame already ends the operation for graphql-transport-ws clients.
        if self.errored && self.outbound.protocol() == Protocol::GraphQLTransportWs {
            return;
        }
        let _ = self
            .outbound
            .send(&OutboundMessage::Complete {
                id: self.client_id.clone(),
            })
            .await;
    }

    async fn close(&mut self) {
        if !self.deregister() {
            return;
        }
        let _ = self
            .outbound
            .send(&OutboundMessage::Error {
                id: self.client_id.clone(),
                payload: json!([{ "message": "subscription closed" }]),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::resolver::SubgraphResolver;
    use crate::executor::subscription_client::WsSubscriptionClient;
    use crate::transport::HttpTransport;
    use pretty_assertions::assert_eq;

    fn resolver() -> Arc<dyn Resolver> {
        Arc::new(SubgraphResolver::new(
            Arc::new(HttpTransport::new(Duration::from_secs(1)).unwrap()),
            Arc::new(WsSubscriptionClient::default()),
            true,
        ))
    }

    fn registered(protocol: Protocol) -> (ConnectionWriter, Registrations, mpsc::Receiver<Message>) {
        let (outbound, rx) = Outbound::channel(protocol, 8);
        let registrations: Registrations = Arc::new(DashMap::new());
        let id = SubscriptionIdentifier {
            connection_id: 1,
            subscription_id: 1,
        };
        registrations.insert(
            "sub-1".into(),
            Registration {
                id,
                resolver: resolver(),
            },
        );
        let writer = ConnectionWriter::new("sub-1", id, outbound, registrations.clone());
        (writer, registrations, rx)
    }

    fn text(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_and_error_framing() {
        let (mut writer, _registrations, mut rx) = registered(Protocol::GraphQLTransportWs);

        writer.write(br#"{"data":{"reviewAdded":{"id":"1"}}}"#);
        writer.flush().await.unwrap();
        assert_eq!(
            text(rx.recv().await.unwrap()),
            json!({ "type": "next", "id": "sub-1", "payload": { "data": { "reviewAdded": { "id": "1" } } } })
        );

        writer.write(br#"{"errors":[{"message":"boom"}]}"#);
        writer.flush().await.unwrap();
        assert_eq!(
            text(rx.recv().await.unwrap()),
            json!({ "type": "error", "id": "sub-1", "payload": [{ "message": "boom" }] })
        );
    }

    #[tokio::test]
    async fn test_legacy_protocol_uses_data_frames() {
        let (mut writer, _registrations, mut rx) = registered(Protocol::GraphQLWs);
        writer.write(br#"{"data":{"n":1}}"#);
        writer.flush().await.unwrap();
        assert_eq!(text(rx.recv().await.unwrap())["type"], "data");

        writer.complete().await;
        assert_eq!(text(rx.recv().await.unwrap()), json!({ "type": "complete", "id": "sub-1" }));
    }

    #[tokio::test]
    async fn test_complete_deregisters_once() {
        let (mut writer, registrations, mut rx) = registered(Protocol::GraphQLTransportWs);
        writer.complete().await;
        assert!(registrations.is_empty());
        assert_eq!(text(rx.recv().await.unwrap())["type"], "complete");

        writer.complete().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_sends_error_without_complete() {
        let (mut writer, registrations, mut rx) = registered(Protocol::GraphQLTransportWs);
        writer.close().await;
        assert!(registrations.is_empty());
        let frame = text(rx.recv().await.unwrap());
        assert_eq!(frame["type"], "error");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reused_client_id_is_left_alone() {
        let (mut writer, registrations, mut rx) = registered(Protocol::GraphQLTransportWs);
        registrations.insert(
            "sub-1".into(),
            Registration {
                id: SubscriptionIdentifier {
                    connection_id: 1,
                    subscription_id: 2,
                },
                resolver: resolver(),
            },
        );

        writer.write(br#"{"data":{}}"#);
        assert!(matches!(writer.flush().await, Err(Error::SubscriptionNotFound(_))));
        writer.complete().await;
        assert_eq!(registrations.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_aborts_instead_of_waiting() {
        let (outbound, mut rx) = Outbound::channel(Protocol::GraphQLTransportWs, 1);
        outbound.try_send(&OutboundMessage::ConnectionAck).unwrap();
        assert!(matches!(
            outbound.try_send(&OutboundMessage::KeepAlive),
            Err(Error::Transport(_))
        ));

        let aborted = outbound.aborted();
        outbound.close(1000, "");
        assert!(aborted.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(Message::Text(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_frame_is_queued_when_there_is_room() {
        let (outbound, mut rx) = Outbound::channel(Protocol::GraphQLWs, 4);
        outbound.close(4400, "expected connection_init");
        assert!(!outbound.aborted().is_cancelled());
        match rx.recv().await.unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4400),
            other => panic!("expected close frame, got {:?}", other),
        }
    }
}
