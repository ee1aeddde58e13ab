//! Error types for the federation gateway

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    /// A subgraph could not be reached or answered with garbage
    #[error("failed to fetch from subgraph '{subgraph}': {message}")]
    Fetch { subgraph: String, message: String },

    /// A subgraph answered with a non-2xx status
    #[error("subgraph '{subgraph}' responded with status {status}")]
    SubgraphStatus { subgraph: String, status: u16 },

    /// A subgraph answered with a non-empty `errors` array
    #[error("subgraph '{subgraph}' returned errors: {errors}")]
    SubgraphErrors { subgraph: String, errors: Value },

    /// A subgraph with this name is already known to the registry
    #[error("subgraph '{0}' is already registered")]
    DuplicateSubgraph(String),

    /// Schema merge failure
    #[error("composition failed: {0}")]
    Composition(String),

    /// Schema or plan construction failure
    #[error("failed to build executor: {0}")]
    ExecutorBuild(String),

    /// The operation text could not be parsed
    #[error("failed to parse operation: {0}")]
    Parse(String),

    /// The request itself is malformed (missing query, bad JSON body, unknown operation name)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The operation does not validate against the router schema
    #[error("operation failed validation")]
    Validation(Vec<GraphQLError>),

    /// Supplied or extracted variables do not match their definitions
    #[error("invalid variables")]
    Variables(Vec<GraphQLError>),

    /// The planner could not produce a plan
    #[error("failed to plan operation: {0}")]
    Planning(String),

    /// Resolution failed in a way that is not attributable to a single subgraph
    #[error("failed to resolve operation: {0}")]
    Resolve(String),

    /// The gateway has not yet completed its first composition
    #[error("gateway is not ready")]
    NotReady,

    /// A provider lifecycle batch hit its deadline
    #[error("provider {action} timed out after {timeout:?}")]
    ProviderTimeout {
        action: &'static str,
        timeout: Duration,
    },

    /// One or more providers failed; individual failures are aggregated
    #[error("provider {action} failed: {}", .errors.join("; "))]
    Providers {
        action: &'static str,
        errors: Vec<String>,
    },

    /// A single provider failure
    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// Broker request/reply failures
    #[error("broker error: {0}")]
    Broker(String),

    /// Subgraph transport failures
    #[error("transport error: {0}")]
    Transport(String),

    /// WebSocket sub-protocol violations
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A subscribe message reused a live id
    #[error("subscription with id \"{0}\" already exists")]
    DuplicateSubscription(String),

    /// A complete message referenced an unknown id
    #[error("subscription with id \"{0}\" not found")]
    SubscriptionNotFound(String),

    /// Per-connection subscription limit reached
    #[error("too many subscriptions on this connection (max {0})")]
    TooManySubscriptions(usize),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client errors
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport errors
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error was caused by what the client sent
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::InvalidRequest(_)
                | Error::Validation(_)
                | Error::Variables(_)
                | Error::DuplicateSubscription(_)
                | Error::SubscriptionNotFound(_)
                | Error::TooManySubscriptions(_)
        )
    }

    /// HTTP status used when this error ends a synchronous request
    pub fn status_code(&self) -> StatusCode {
        if self.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if matches!(self, Error::NotReady) {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "GRAPHQL_PARSE_FAILED",
            Error::InvalidRequest(_) => "BAD_REQUEST",
            Error::Validation(_) => "GRAPHQL_VALIDATION_FAILED",
            Error::Variables(_) => "BAD_USER_INPUT",
            Error::Planning(_) => "QUERY_PLANNING_FAILED",
            Error::NotReady => "NOT_READY",
            Error::DuplicateSubscription(_)
            | Error::SubscriptionNotFound(_)
            | Error::TooManySubscriptions(_)
            | Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::Fetch { .. }
            | Error::SubgraphStatus { .. }
            | Error::SubgraphErrors { .. } => "SUBGRAPH_ERROR",
            _ => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Convert into entries of the standard GraphQL `errors` array.
    ///
    /// Validation and variable errors keep their individual messages and positions; internal
    /// errors are collapsed to a generic message so internals do not leak to clients.
    pub fn to_graphql_errors(&self) -> Vec<GraphQLError> {
        match self {
            Error::Validation(errors) | Error::Variables(errors) => errors
                .iter()
                .cloned()
                .map(|e| e.with_code(self.code()))
                .collect(),
            err if err.is_client_error() || matches!(err, Error::NotReady) => {
                vec![GraphQLError::new(err.to_string()).with_code(err.code())]
            }
            Error::Planning(_) => {
                vec![GraphQLError::new("failed to plan operation").with_code(self.code())]
            }
            _ => vec![GraphQLError::new("internal server error").with_code(self.code())],
        }
    }

    /// The `{"errors": [...]}` envelope for this error
    pub fn to_response(&self) -> Value {
        serde_json::json!({ "errors": self.to_graphql_errors() })
    }
}

/// Line/column of a GraphQL error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl From<graphql_parser::Pos> for Location {
    fn from(pos: graphql_parser::Pos) -> Self {
        Location {
            line: pos.line,
            column: pos.column,
        }
    }
}

/// GraphQL error response format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: Map::new(),
        }
    }

    pub fn at(mut self, pos: graphql_parser::Pos) -> Self {
        self.locations.push(pos.into());
        self
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.extensions
            .entry("code")
            .or_insert_with(|| Value::String(code.to_string()));
        self
    }

    pub fn with_extension(mut self, key: &str, value: Value) -> Self {
        self.extensions.insert(key.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_display() {
        let err = Error::DuplicateSubscription("sub-1".to_string());
        assert_eq!(err.to_string(), "subscription with id \"sub-1\" already exists");

        let err = Error::SubgraphStatus {
            subgraph: "accounts".to_string(),
            status: 500,
        };
        assert_eq!(err.to_string(), "subgraph 'accounts' responded with status 500");

        let err = Error::Providers {
            action: "startup",
            errors: vec!["a failed".into(), "b failed".into()],
        };
        assert_eq!(err.to_string(), "provider startup failed: a failed; b failed");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::Parse("unexpected".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::Validation(vec![]).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::Planning("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(Error::NotReady.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_validation_errors_keep_locations() {
        let err = Error::Validation(vec![
            GraphQLError::new("Cannot query field \"b\" on type \"Query\".")
                .at(graphql_parser::Pos { line: 1, column: 3 }),
        ]);
        let errors = err.to_graphql_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].locations, vec![Location { line: 1, column: 3 }]);
        assert_eq!(
            errors[0].extensions.get("code"),
            Some(&Value::String("GRAPHQL_VALIDATION_FAILED".into()))
        );
    }

    #[test]
    fn test_internal_errors_are_collapsed() {
        let err = Error::Resolve("connection pool exhausted at 10.0.0.3".into());
        let errors = err.to_graphql_errors();
        assert_eq!(errors[0].message, "internal server error");
    }
}
