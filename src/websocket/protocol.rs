//! WebSocket sub-protocol adapters.
//!
//! Both `graphql-transport-ws` and the legacy `graphql-ws` share one JSON envelope but use
//! different type names. Inbound frames are decoded into [`InboundMessage`] and outbound
//! [`OutboundMessage`]s are encoded per protocol, so the connection handler never branches
//! on the wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";
pub const GRAPHQL_WS: &str = "graphql-ws";

/// Wire message types of both protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Client -> Server
    ConnectionInit,
    ConnectionTerminate,
    Subscribe,
    Start,
    Stop,
    // Either direction
    Complete,
    Ping,
    Pong,
    // Server -> Client
    ConnectionAck,
    ConnectionError,
    Next,
    Data,
    Error,
    #[serde(rename = "ka")]
    KeepAlive,
}

/// Protocol message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ProtocolMessage {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            id: None,
            payload: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::Serialization)
    }
}

/// Subscribe payload, shared by both protocols
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribePayload {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub extensions: Option<Value>,
}

/// Inbound messages in the shared vocabulary
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ConnectionInit(Option<Value>),
    Ping(Option<Value>),
    Pong,
    Subscribe { id: String, payload: SubscribePayload },
    Complete { id: String },
    Terminate,
}

/// A frame that could not be decoded. `id` is set when the frame named a non-empty
/// operation id.
#[derive(Debug)]
pub struct InvalidMessage {
    pub id: Option<String>,
    pub error: Error,
}

/// Outbound messages in the shared vocabulary
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    ConnectionAck,
    /// Reply to a client ping
    Pong(Option<Value>),
    /// Server-initiated heartbeat
    KeepAlive,
    /// One execution result; `payload` is `{"data": ..}` possibly with extensions
    Next { id: String, payload: Value },
    /// Operation-level errors; `payload` is the errors array
    Error { id: String, payload: Value },
    Complete { id: String },
}

/// The sub-protocol negotiated for a connection, fixed for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    GraphQLTransportWs,
    GraphQLWs,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::GraphQLTransportWs => GRAPHQL_TRANSPORT_WS,
            Protocol::GraphQLWs => GRAPHQL_WS,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            GRAPHQL_TRANSPORT_WS => Some(Protocol::GraphQLTransportWs),
            GRAPHQL_WS => Some(Protocol::GraphQLWs),
            _ => None,
        }
    }

    /// Pick a protocol from the `Sec-WebSocket-Protocol` header.
    ///
    /// The first supported entry in the client's list wins. Clients that offer no list get
    /// the legacy protocol; a list with no supported entry is refused.
    pub fn negotiate(offered: Option<&str>) -> Option<Self> {
        match offered.map(str::trim).filter(|offered| !offered.is_empty()) {
            None => Some(Protocol::GraphQLWs),
            Some(offered) => offered.split(',').find_map(Protocol::from_name),
        }
    }

    /// Decode one text frame
    pub fn decode(&self, text: &str) -> std::result::Result<InboundMessage, InvalidMessage> {
        let value: Value = serde_json::from_str(text).map_err(|e| InvalidMessage {
            id: None,
            error: Error::Protocol(format!("invalid message: {}", e)),
        })?;
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        serde_json::from_value::<ProtocolMessage>(value)
            .map_err(|e| Error::Protocol(format!("invalid message: {}", e)))
            .and_then(|message| self.decode_message(message))
            .map_err(|error| InvalidMessage { id, error })
    }

    fn decode_message(&self, message: ProtocolMessage) -> Result<InboundMessage> {
        let require_id = |message: &ProtocolMessage| {
            message
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| Error::Protocol(format!("{:?} message requires an id", message.message_type)))
        };
        let subscribe_payload = |message: &ProtocolMessage| -> Result<SubscribePayload> {
            let payload = message
                .payload
                .clone()
                .ok_or_else(|| Error::Protocol("subscribe message requires a payload".into()))?;
            serde_json::from_value(payload)
                .map_err(|e| Error::Protocol(format!("invalid subscribe payload: {}", e)))
        };

        match (self, message.message_type) {
            (_, MessageType::ConnectionInit) => Ok(InboundMessage::ConnectionInit(message.payload)),
            (Protocol::GraphQLTransportWs, MessageType::Ping) => Ok(InboundMessage::Ping(message.payload)),
            (Protocol::GraphQLTransportWs, MessageType::Pong) => Ok(InboundMessage::Pong),
            (Protocol::GraphQLTransportWs, MessageType::Subscribe)
            | (Protocol::GraphQLWs, MessageType::Start) => Ok(InboundMessage::Subscribe {
                id: require_id(&message)?,
                payload: subscribe_payload(&message)?,
            }),
            (Protocol::GraphQLTransportWs, MessageType::Complete)
            | (Protocol::GraphQLWs, MessageType::Stop) => Ok(InboundMessage::Complete {
                id: require_id(&message)?,
            }),
            (Protocol::GraphQLWs, MessageType::ConnectionTerminate) => Ok(InboundMessage::Terminate),
            (_, other) => Err(Error::Protocol(format!(
                "unsupported message type {:?} for {}",
                other,
                self.name()
            ))),
        }
    }

    /// Encode one outbound message
    pub fn encode(&self, message: &OutboundMessage) -> Result<String> {
        use MessageType as T;
        let frame = match (self, message) {
            (_, OutboundMessage::ConnectionAck) => ProtocolMessage::new(T::ConnectionAck),
            (Protocol::GraphQLTransportWs, OutboundMessage::Pong(payload)) => {
                let frame = ProtocolMessage::new(T::Pong);
                match payload {
                    Some(payload) => frame.with_payload(payload.clone()),
                    None => frame,
                }
            }
            (Protocol::GraphQLWs, OutboundMessage::Pong(_)) => ProtocolMessage::new(T::KeepAlive),
            (Protocol::GraphQLTransportWs, OutboundMessage::KeepAlive) => ProtocolMessage::new(T::Ping),
            (Protocol::GraphQLWs, OutboundMessage::KeepAlive) => ProtocolMessage::new(T::KeepAlive),
            (Protocol::GraphQLTransportWs, OutboundMessage::Next { id, payload }) => {
                ProtocolMessage::new(T::Next).with_id(id.clone()).with_payload(payload.clone())
            }
            (Protocol::GraphQLWs, OutboundMessage::Next { id, payload }) => {
                ProtocolMessage::new(T::Data).with_id(id.clone()).with_payload(payload.clone())
            }
            (_, OutboundMessage::Error { id, payload }) => {
                ProtocolMessage::new(T::Error).with_id(id.clone()).with_payload(payload.clone())
            }
            (_, OutboundMessage::Complete { id }) => ProtocolMessage::new(T::Complete).with_id(id.clone()),
        };
        frame.to_json()
    }
}
