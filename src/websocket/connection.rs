//! Per-connection subscription state machine.
//!
//! A connection moves `Upgraded -> Initializing -> Active -> Closed`. The handler consumes
//! one frame at a time so it can be driven either by a dedicated read loop
//! ([`serve_connection`]) or by the shared [`Poller`](super::poller::Poller).

use dashmap::mapref::entry::Entry;
use futures::{Sink, Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ExecutorSource;
use super::protocol::{InboundMessage, InvalidMessage, OutboundMessage, Protocol, SubscribePayload};
use super::writer::{ConnectionWriter, Outbound, Registration, Registrations, write_messages};
use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::executor::SubscriptionIdentifier;
use crate::executor::resolver::Resolver;
use crate::{GraphQLRequest, RequestContext};

/// Outbound frames queued per connection before senders wait
pub const OUTBOUND_CAPACITY: usize = 64;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_BAD_REQUEST: u16 = 4400;
pub const CLOSE_INIT_TIMEOUT: u16 = 4408;
pub const CLOSE_TOO_MANY_INITS: u16 = 4429;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Upgraded,
    Initializing,
    Active,
    Closed,
}

/// What the driver should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

pub struct ConnectionHandler {
    id: u64,
    state: ConnectionState,
    ctx: RequestContext,
    executors: Arc<dyn ExecutorSource>,
    options: WebSocketConfig,
    outbound: Outbound,
    registrations: Registrations,
    last_subscription_id: u64,
    initialized: Arc<AtomicBool>,
    closing: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        ctx: RequestContext,
        executors: Arc<dyn ExecutorSource>,
        options: WebSocketConfig,
        outbound: Outbound,
    ) -> Self {
        ConnectionHandler {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: ConnectionState::Upgraded,
            ctx,
            executors,
            options,
            outbound,
            registrations: Arc::new(Default::default()),
            last_subscription_id: 0,
            initialized: Arc::new(AtomicBool::new(false)),
            closing: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn protocol(&self) -> Protocol {
        self.outbound.protocol()
    }

    /// Fires when the connection decided to close on its own (e.g. init timeout)
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.registrations.len()
    }

    pub fn registration(&self, client_id: &str) -> Option<SubscriptionIdentifier> {
        self.registrations.get(client_id).map(|registration| registration.id)
    }

    /// Begin waiting for `connection_init`
    pub fn start(&mut self) {
        if self.state != ConnectionState::Upgraded {
            return;
        }
        self.state = ConnectionState::Initializing;

        let outbound = self.outbound.clone();
        let initialized = self.initialized.clone();
        let closing = self.closing.clone();
        let timeout = self.options.connection_init_timeout;
        let connection_id = self.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = closing.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if !initialized.load(Ordering::SeqCst) {
                        warn!(connection_id, ?timeout, "connection_init not received in time");
                        outbound.close(CLOSE_INIT_TIMEOUT, "Connection initialisation timeout");
                        closing.cancel();
                    }
                }
            }
        });
    }

    /// Handle one inbound frame. Never waits on the outbound queue: a client that stopped
    /// reading its replies is closed instead.
    pub fn handle_message(&mut self, message: Message) -> Flow {
        match message {
            Message::Text(text) => match self.handle_text(&text) {
                Ok(flow) => flow,
                Err(e) => {
                    warn!(connection_id = self.id, error = %e, "failed to queue reply, closing connection");
                    Flow::Close
                }
            },
            Message::Close(_) => Flow::Close,
            Message::Binary(_) => {
                warn!(connection_id = self.id, "binary frames are not supported");
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn handle_text(&mut self, text: &str) -> Result<Flow> {
        let message = match self.protocol().decode(text) {
            Ok(message) => message,
            Err(invalid) if self.state == ConnectionState::Initializing => {
                warn!(connection_id = self.id, error = %invalid.error, "invalid first message");
                self.outbound.close(CLOSE_BAD_REQUEST, "expected connection_init");
                return Ok(Flow::Close);
            }
            Err(InvalidMessage { id: Some(id), error }) => {
                warn!(connection_id = self.id, subscription = %id, error = %error, "invalid message");
                let payload = serde_json::to_value(error.to_graphql_errors())?;
                self.outbound.try_send(&OutboundMessage::Error { id, payload })?;
                return Ok(Flow::Continue);
            }
            Err(InvalidMessage { id: None, error }) => {
                warn!(connection_id = self.id, error = %error, "invalid message without an id");
                self.outbound.close(CLOSE_BAD_REQUEST, "invalid message");
                return Ok(Flow::Close);
            }
        };

        match (self.state, message) {
            (_, InboundMessage::Terminate) => Ok(Flow::Close),
            (ConnectionState::Initializing, InboundMessage::ConnectionInit(payload)) => {
                self.ctx.init_payload = payload;
                self.initialized.store(true, Ordering::SeqCst);
                self.state = ConnectionState::Active;
                self.outbound.try_send(&OutboundMessage::ConnectionAck)?;
                self.start_keep_alive();
                info!(connection_id = self.id, protocol = self.protocol().name(), "websocket connection initialised");
                Ok(Flow::Continue)
            }
            (ConnectionState::Initializing, _) => {
                self.outbound.close(CLOSE_BAD_REQUEST, "expected connection_init");
                Ok(Flow::Close)
            }
            (ConnectionState::Active, InboundMessage::ConnectionInit(_)) => {
                self.outbound
                    .close(CLOSE_TOO_MANY_INITS, "Too many initialisation requests");
                Ok(Flow::Close)
            }
            (ConnectionState::Active, InboundMessage::Ping(payload)) => {
                self.outbound.try_send(&OutboundMessage::Pong(payload))?;
                Ok(Flow::Continue)
            }
            (ConnectionState::Active, InboundMessage::Pong) => Ok(Flow::Continue),
            (ConnectionState::Active, InboundMessage::Subscribe { id, payload }) => {
                if let Err(e) = self.subscribe(id.clone(), payload) {
                    warn!(connection_id = self.id, subscription = %id, error = %e, "subscribe rejected");
                    let payload = serde_json::to_value(e.to_graphql_errors())?;
                    self.outbound.try_send(&OutboundMessage::Error { id, payload })?;
                }
                Ok(Flow::Continue)
            }
            (ConnectionState::Active, InboundMessage::Complete { id }) => {
                if let Err(e) = self.complete(&id) {
                    debug!(connection_id = self.id, error = %e, "complete ignored");
                }
                Ok(Flow::Continue)
            }
            (ConnectionState::Upgraded | ConnectionState::Closed, _) => Ok(Flow::Close),
        }
    }

    fn subscribe(&mut self, client_id: String, payload: SubscribePayload) -> Result<()> {
        if self.registrations.contains_key(&client_id) {
            return Err(Error::DuplicateSubscription(client_id));
        }
        let max = self.options.max_subscriptions_per_connection;
        if self.registrations.len() >= max {
            return Err(Error::TooManySubscriptions(max));
        }
        let executor = self.executors.current_executor().ok_or(Error::NotReady)?;

        self.last_subscription_id += 1;
        let id = SubscriptionIdentifier {
            connection_id: self.id,
            subscription_id: self.last_subscription_id,
        };
        match self.registrations.entry(client_id.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateSubscription(client_id)),
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    id,
                    resolver: executor.resolver().clone(),
                });
            }
        }
        debug!(connection_id = self.id, subscription = %client_id, subscription_id = id.subscription_id, "subscription registered");

        let request = GraphQLRequest {
            query: payload.query,
            variables: payload.variables,
            operation_name: payload.operation_name,
            extensions: payload.extensions,
        };
        let writer = ConnectionWriter::new(client_id.clone(), id, self.outbound.clone(), self.registrations.clone());
        let ctx = self.ctx.clone();
        let outbound = self.outbound.clone();
        let registrations = self.registrations.clone();
        tokio::spawn(async move {
            match executor.execute_subscription(ctx, &request, Box::new(writer), id).await {
                Ok(plan) => {
                    // Completed or closed before the resolver took it over.
                    let registered = registrations
                        .get(&client_id)
                        .is_some_and(|registration| registration.id == id);
                    if plan.is_async() && !registered {
                        executor.resolver().complete_subscription(id);
                    }
                }
                Err(e) => {
                    debug!(?id, error = %e, "subscription failed to start");
                    let removed = registrations
                        .remove_if(&client_id, |_, registration| registration.id == id)
                        .is_some();
                    if removed {
                        let payload = serde_json::to_value(e.to_graphql_errors()).unwrap_or_default();
                        let _ = outbound.send(&OutboundMessage::Error { id: client_id, payload }).await;
                    }
                }
            }
        });
        Ok(())
    }

    fn complete(&self, client_id: &str) -> Result<()> {
        let (_, registration) = self
            .registrations
            .remove(client_id)
            .ok_or_else(|| Error::SubscriptionNotFound(client_id.to_string()))?;
        registration.resolver.complete_subscription(registration.id);
        debug!(connection_id = self.id, subscription = %client_id, "subscription completed by client");
        Ok(())
    }

    fn start_keep_alive(&self) {
        let interval = self.options.keep_alive_interval;
        if interval.is_zero() {
            return;
        }
        let outbound = self.outbound.clone();
        let closing = self.closing.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = ticker.tick() => {
                        if outbound.send(&OutboundMessage::KeepAlive).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Release every subscription of this connection and queue a close frame
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.closing.cancel();

        let mut resolvers: Vec<Arc<dyn Resolver>> = Vec::new();
        let live: Vec<Registration> = self.registrations.iter().map(|entry| entry.value().clone()).collect();
        self.registrations.clear();
        let current = self.executors.current_executor().map(|executor| executor.resolver().clone());
        for resolver in live.into_iter().map(|registration| registration.resolver).chain(current) {
            if !resolvers.iter().any(|known| Arc::ptr_eq(known, &resolver)) {
                resolvers.push(resolver);
            }
        }
        let released: usize = resolvers
            .iter()
            .map(|resolver| resolver.unsubscribe_client(self.id))
            .sum();

        self.outbound.close(CLOSE_NORMAL, "");
        info!(connection_id = self.id, released, "websocket connection closed");
    }
}

/// Serve one upgraded socket on the current task until it closes or `shutdown` fires.
///
/// Read timeouts only wake the loop; they do not close the connection.
pub async fn serve_connection<S>(
    socket: S,
    protocol: Protocol,
    ctx: RequestContext,
    executors: Arc<dyn ExecutorSource>,
    options: WebSocketConfig,
    shutdown: CancellationToken,
) where
    S: Stream<Item = std::result::Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    let (sink, mut stream) = socket.split();
    let (outbound, rx) = Outbound::channel(protocol, OUTBOUND_CAPACITY);
    let writer = tokio::spawn(write_messages(sink, rx, options.write_timeout, outbound.aborted()));

    let read_timeout = options.read_timeout;
    let mut handler = ConnectionHandler::new(ctx, executors, options, outbound);
    handler.start();
    let closing = handler.closing();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = closing.cancelled() => break,
            next = tokio::time::timeout(read_timeout, stream.next()) => match next {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(connection_id = handler.id(), error = %e, "websocket read failed");
                    break;
                }
                Ok(Some(Ok(message))) => {
                    if handler.handle_message(message) == Flow::Close {
                        break;
                    }
                }
            },
        }
    }

    handler.close();
    drop(handler);
    let _ = writer.await;
}
