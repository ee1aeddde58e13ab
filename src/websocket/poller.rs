//! Shared read loop for many connections.
//!
//! Instead of one read task per socket, the poller owns the read halves of every
//! registered connection in a single [`SelectAll`] and dispatches whichever is ready.
//! Each connection keeps its own writer task. Dispatch never waits on a connection's
//! outbound queue, so a client that stops reading cannot stall the others.

use futures::stream::{self, BoxStream, SelectAll};
use futures::{Sink, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ExecutorSource;
use super::connection::{ConnectionHandler, Flow, OUTBOUND_CAPACITY};
use super::protocol::Protocol;
use super::writer::{Outbound, write_messages};
use crate::RequestContext;
use crate::config::WebSocketConfig;
use crate::error::{Error, Result};

/// One frame, or `None` once the connection's read half ended
type Event = (u64, Option<std::result::Result<Message, WsError>>);

struct Added {
    handler: ConnectionHandler,
    frames: BoxStream<'static, Event>,
}

/// Handle for adding connections to a running poller
#[derive(Clone)]
pub struct Poller {
    tx: mpsc::UnboundedSender<Added>,
    executors: Arc<dyn ExecutorSource>,
    options: WebSocketConfig,
    connections: Arc<AtomicUsize>,
}

impl Poller {
    /// Spawn the poll loop. It runs until `shutdown` fires, then closes every connection.
    pub fn spawn(executors: Arc<dyn ExecutorSource>, options: WebSocketConfig, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        tokio::spawn(poll_loop(rx, connections.clone(), shutdown));
        Poller {
            tx,
            executors,
            options,
            connections,
        }
    }

    /// Number of connections the poller currently serves
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Hand an upgraded socket to the poller. Returns the connection id.
    pub fn add<S>(&self, socket: S, protocol: Protocol, ctx: RequestContext) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Unpin
            + Send
            + 'static,
    {
        let (sink, stream) = socket.split();
        let (outbound, rx) = Outbound::channel(protocol, OUTBOUND_CAPACITY);
        tokio::spawn(write_messages(sink, rx, self.options.write_timeout, outbound.aborted()));

        let mut handler = ConnectionHandler::new(ctx, self.executors.clone(), self.options.clone(), outbound);
        handler.start();
        let id = handler.id();

        // The read half ends on its own or when the handler decides to close.
        let frames = stream
            .take_until(handler.closing().cancelled_owned())
            .map(move |frame| (id, Some(frame)))
            .chain(stream::once(async move { (id, None) }))
            .boxed();

        self.tx
            .send(Added { handler, frames })
            .map_err(|_| Error::Transport("websocket poller is not running".into()))?;
        Ok(id)
    }
}

async fn poll_loop(mut rx: mpsc::UnboundedReceiver<Added>, connections: Arc<AtomicUsize>, shutdown: CancellationToken) {
    let mut frames: SelectAll<BoxStream<'static, Event>> = SelectAll::new();
    let mut handlers: HashMap<u64, ConnectionHandler> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            added = rx.recv() => match added {
                Some(Added { handler, frames: stream }) => {
                    debug!(connection_id = handler.id(), "connection added to poller");
                    handlers.insert(handler.id(), handler);
                    frames.push(stream);
                    connections.store(handlers.len(), Ordering::SeqCst);
                }
                None => break,
            },
            Some((id, frame)) = frames.next(), if !frames.is_empty() => {
                let flow = match frame {
                    Some(Ok(message)) => match handlers.get_mut(&id) {
                        Some(handler) => handler.handle_message(message),
                        None => Flow::Close,
                    },
                    Some(Err(e)) => {
                        debug!(connection_id = id, error = %e, "websocket read failed");
                        Flow::Close
                    }
                    None => Flow::Close,
                };
                if flow == Flow::Close {
                    if let Some(mut handler) = handlers.remove(&id) {
                        handler.close();
                    }
                    connections.store(handlers.len(), Ordering::SeqCst);
                }
            }
        }
    }

    info!(connections = handlers.len(), "websocket poller stopping");
    for (_, mut handler) in handlers.drain() {
        handler.close();
    }
    connections.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::subscription_client::tests::ChannelSource;
    use crate::websocket::connection::tests::{FixedExecutor, executor};
    use futures::SinkExt;
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        (server, client)
    }

    async fn read(client: &mut WebSocketStream<DuplexStream>) -> Value {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    async fn wait_for_connections(poller: &Poller, expected: usize) {
        for _ in 0..200 {
            if poller.connections() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("poller never reached {} connections", expected);
    }

    #[tokio::test]
    async fn test_poller_serves_many_connections() {
        let source = Arc::new(ChannelSource::default());
        let executor = executor(source.clone());
        let shutdown = CancellationToken::new();
        let options = WebSocketConfig {
            keep_alive_interval: Duration::ZERO,
            ..WebSocketConfig::default()
        };
        let poller = Poller::spawn(Arc::new(FixedExecutor(executor.clone())), options, shutdown.clone());

        let mut clients = Vec::new();
        for _ in 0..3 {
            let (server, mut client) = pair().await;
            poller
                .add(server, Protocol::GraphQLTransportWs, RequestContext::default())
                .unwrap();
            client
                .send(Message::Text(json!({ "type": "connection_init" }).to_string()))
                .await
                .unwrap();
            assert_eq!(read(&mut client).await["type"], "connection_ack");
            clients.push(client);
        }
        wait_for_connections(&poller, 3).await;

        let mut ping = clients.remove(1);
        ping.send(Message::Text(json!({ "type": "ping" }).to_string()))
            .await
            .unwrap();
        assert_eq!(read(&mut ping).await, json!({ "type": "pong" }));

        ping.close(None).await.unwrap();
        wait_for_connections(&poller, 2).await;

        shutdown.cancel();
        wait_for_connections(&poller, 0).await;
    }

    #[tokio::test]
    async fn test_poller_releases_subscriptions_of_dropped_connection() {
        let source = Arc::new(ChannelSource::default());
        let executor = executor(source.clone());
        let poller = Poller::spawn(
            Arc::new(FixedExecutor(executor.clone())),
            WebSocketConfig::default(),
            CancellationToken::new(),
        );

        let (server, mut client) = pair().await;
        let connection_id = poller
            .add(server, Protocol::GraphQLTransportWs, RequestContext::default())
            .unwrap();
        client
            .send(Message::Text(json!({ "type": "connection_init" }).to_string()))
            .await
            .unwrap();
        read(&mut client).await;
        client
            .send(Message::Text(
                json!({
                    "type": "subscribe",
                    "id": "s",
                    "payload": { "query": "subscription { reviewAdded { id } }" }
                })
                .to_string(),
            ))
            .await
            .unwrap();
        source.emit(json!({ "data": { "reviewAdded": { "id": "1" } } })).await;
        assert_eq!(read(&mut client).await["type"], "next");
        assert_eq!(executor.resolver().outstanding_subscriptions(connection_id), 1);

        drop(client);
        wait_for_connections(&poller, 0).await;
        assert_eq!(executor.resolver().outstanding_subscriptions(connection_id), 0);
    }

    #[tokio::test]
    async fn test_client_that_stops_reading_does_not_stall_others() {
        let executor = executor(Arc::new(ChannelSource::default()));
        let options = WebSocketConfig {
            keep_alive_interval: Duration::ZERO,
            ..WebSocketConfig::default()
        };
        let poller = Poller::spawn(Arc::new(FixedExecutor(executor)), options, CancellationToken::new());

        // A tiny pipe that is never drained fills up after a few replies.
        let (server_io, client_io) = tokio::io::duplex(256);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let mut stuck = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        poller
            .add(server, Protocol::GraphQLTransportWs, RequestContext::default())
            .unwrap();
        stuck
            .send(Message::Text(json!({ "type": "connection_init" }).to_string()))
            .await
            .unwrap();
        let flood = tokio::spawn(async move {
            let ping = Message::Text(json!({ "type": "ping", "payload": { "pad": "x".repeat(64) } }).to_string());
            for _ in 0..500 {
                if stuck.send(ping.clone()).await.is_err() {
                    break;
                }
            }
            stuck
        });

        let (server, mut healthy) = pair().await;
        poller
            .add(server, Protocol::GraphQLTransportWs, RequestContext::default())
            .unwrap();
        healthy
            .send(Message::Text(json!({ "type": "connection_init" }).to_string()))
            .await
            .unwrap();
        let ack = tokio::time::timeout(Duration::from_secs(1), read(&mut healthy))
            .await
            .expect("healthy connection starved by a client that stopped reading");
        assert_eq!(ack["type"], "connection_ack");

        // The stuck connection is dropped rather than waited on.
        wait_for_connections(&poller, 1).await;
        flood.abort();
    }
}
