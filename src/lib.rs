pub mod composition;
pub mod config;
pub mod error;
pub mod executor;
pub mod federation_manager;
pub mod provider;
pub mod readiness;
pub mod schema;
pub mod schema_registry;
pub mod server;
pub mod telemetry;
pub mod transport;
pub mod websocket;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use executor::Executor;
pub use federation_manager::FederationManager;
pub use schema_registry::{SchemaFetcher, SchemaRegistry};

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

/// A subgraph with the SDL it currently serves
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphConfig {
    pub name: String,
    pub url: String,
    pub schema: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQLRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub extensions: Option<Value>,
}

/// What the transport knows about the caller
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub headers: HeaderMap,
    /// `connection_init` payload of the WebSocket connection, if any
    pub init_payload: Option<Value>,
    pub remote_addr: Option<SocketAddr>,
}
