//! GraphQL subscriptions over WebSocket.
//!
//! `GET /ws` upgrades are negotiated here and handed either to a dedicated per-connection
//! read loop or, with `use_poller`, to the shared [`poller::Poller`].

pub mod connection;
pub mod poller;
pub mod protocol;
pub mod writer;

use http::{HeaderMap, Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::RequestContext;
use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::federation_manager::FederationManager;
use connection::serve_connection;
use poller::Poller;
use protocol::Protocol;

/// Where connections find the executor for new subscriptions
pub trait ExecutorSource: Send + Sync {
    fn current_executor(&self) -> Option<Arc<Executor>>;
}

impl ExecutorSource for FederationManager {
    fn current_executor(&self) -> Option<Arc<Executor>> {
        FederationManager::current_executor(self)
    }
}

/// Check if request is a WebSocket upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_token = |name: header::HeaderName, token: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
    };
    req.method() == Method::GET && has_token(header::CONNECTION, "upgrade") && has_token(header::UPGRADE, "websocket")
}

/// Validate the handshake and build the `101 Switching Protocols` response
pub fn handshake_response(headers: &HeaderMap) -> Result<(Response<()>, Protocol)> {
    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|value| value.to_str().ok());
    if version != Some("13") {
        return Err(Error::InvalidRequest("unsupported Sec-WebSocket-Version".into()));
    }
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or_else(|| Error::InvalidRequest("missing Sec-WebSocket-Key".into()))?;

    let offered = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());
    let protocol = Protocol::negotiate(offered)
        .ok_or_else(|| Error::InvalidRequest(format!("unsupported subprotocol {:?}", offered.unwrap_or_default())))?;

    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));
    if offered.is_some() {
        response = response.header(header::SEC_WEBSOCKET_PROTOCOL, protocol.name());
    }
    let response = response
        .body(())
        .map_err(|e| Error::Protocol(format!("failed to build handshake response: {}", e)))?;
    Ok((response, protocol))
}

/// Accepts upgrades and runs the resulting connections
#[derive(Clone)]
pub struct WebSocketService {
    executors: Arc<dyn ExecutorSource>,
    options: WebSocketConfig,
    poller: Option<Poller>,
    shutdown: CancellationToken,
}

impl WebSocketService {
    pub fn new(executors: Arc<dyn ExecutorSource>, options: WebSocketConfig, shutdown: CancellationToken) -> Self {
        let poller = options
            .use_poller
            .then(|| Poller::spawn(executors.clone(), options.clone(), shutdown.clone()));
        WebSocketService {
            executors,
            options,
            poller,
            shutdown,
        }
    }

    /// Answer an upgrade request. The connection is served in the background once hyper
    /// hands over the socket.
    pub fn accept<B>(&self, mut req: Request<B>, ctx: RequestContext) -> Result<Response<()>> {
        let (response, protocol) = handshake_response(req.headers())?;
        let on_upgrade = hyper::upgrade::on(&mut req);
        let service = self.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                    service.serve(socket, protocol, ctx).await;
                }
                Err(e) => warn!(error = %e, "websocket upgrade failed"),
            }
        });
        debug!(protocol = protocol.name(), "websocket upgrade accepted");
        Ok(response)
    }

    async fn serve(&self, socket: WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>, protocol: Protocol, ctx: RequestContext) {
        match &self.poller {
            Some(poller) => {
                if let Err(e) = poller.add(socket, protocol, ctx) {
                    warn!(error = %e, "failed to register connection with poller");
                }
            }
            None => {
                serve_connection(
                    socket,
                    protocol,
                    ctx,
                    self.executors.clone(),
                    self.options.clone(),
                    self.shutdown.clone(),
                )
                .await
            }
        }
    }
}
