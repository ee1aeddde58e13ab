use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use http::{HeaderMap, HeaderValue, Method, Request, header};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::query_planner::{ExecutionPlan, FetchNode};
use super::subscription_client::{SubscriptionSource, UpstreamRequest};
use super::{SubscriptionIdentifier, SubscriptionWriter};
use crate::RequestContext;
use crate::error::{Error, Result};
use crate::schema::OperationKind;
use crate::transport::SubgraphTransport;

/// Request headers forwarded to subgraphs
pub const FORWARDED_HEADERS: [&str; 3] = ["authorization", "x-api-key", "x-token"];

/// Merged outcome of a plan's subgraph fetches
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Resolution {
    pub data: Map<String, Value>,
    pub errors: Vec<Value>,
}

/// Executes plans against subgraphs and owns subscription bookkeeping
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(
        &self,
        ctx: &RequestContext,
        plan: &ExecutionPlan,
        variables: &Map<String, Value>,
    ) -> Result<Resolution>;

    /// Start a subscription. Returns once the stream is running; events go to `writer`.
    async fn subscribe(
        &self,
        ctx: RequestContext,
        plan: Arc<ExecutionPlan>,
        variables: Map<String, Value>,
        writer: Box<dyn SubscriptionWriter>,
        id: SubscriptionIdentifier,
    ) -> Result<()>;

    /// Tear down one subscription. Returns whether it was still running.
    fn complete_subscription(&self, id: SubscriptionIdentifier) -> bool;

    /// Tear down every subscription of a connection. Returns how many were running.
    fn unsubscribe_client(&self, connection_id: u64) -> usize;

    fn outstanding_subscriptions(&self, connection_id: u64) -> usize;
}

pub struct SubgraphResolver {
    transport: Arc<dyn SubgraphTransport>,
    subscriptions_source: Arc<dyn SubscriptionSource>,
    propagate_errors: bool,
    subscriptions: Arc<DashMap<SubscriptionIdentifier, CancellationToken>>,
}

impl SubgraphResolver {
    pub fn new(
        transport: Arc<dyn SubgraphTransport>,
        subscriptions_source: Arc<dyn SubscriptionSource>,
        propagate_errors: bool,
    ) -> Self {
        SubgraphResolver {
            transport,
            subscriptions_source,
            propagate_errors,
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    async fn fetch(&self, ctx: &RequestContext, node: &FetchNode, variables: &Map<String, Value>) -> Result<Value> {
        let mut body = json!({
            "query": node.operation,
            "variables": node.variables_from(variables),
        });
        if let Some(name) = &node.operation_name {
            body["operationName"] = Value::String(name.clone());
        }

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(node.url.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json");
        if let Some(headers) = request.headers_mut() {
            forward_headers(&ctx.headers, headers);
        }
        let request = request
            .body(Bytes::from(serde_json::to_vec(&body)?))
            .map_err(|e| Error::Fetch {
                subgraph: node.subgraph.clone(),
                message: e.to_string(),
            })?;

        debug!(subgraph = %node.subgraph, url = %node.url, "fetching from subgraph");
        let response = self.transport.round_trip(request).await.map_err(|e| Error::Fetch {
            subgraph: node.subgraph.clone(),
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(Error::SubgraphStatus {
                subgraph: node.subgraph.clone(),
                status: response.status().as_u16(),
            });
        }

        serde_json::from_slice(response.body()).map_err(|e| Error::Fetch {
            subgraph: node.subgraph.clone(),
            message: format!("invalid response body: {}", e),
        })
    }

    fn merge(&self, node: &FetchNode, outcome: Result<Value>, resolution: &mut Resolution) {
        match outcome {
            Ok(mut response) => {
                let mut data = match response.get_mut("data").map(Value::take) {
                    Some(Value::Object(data)) => data,
                    _ => Map::new(),
                };
                for key in &node.response_keys {
                    resolution
                        .data
                        .insert(key.clone(), data.remove(key).unwrap_or(Value::Null));
                }

                let errors = match response.get_mut("errors").map(Value::take) {
                    Some(Value::Array(errors)) => errors,
                    _ => Vec::new(),
                };
                if errors.is_empty() {
                    return;
                }
                if self.propagate_errors {
                    for mut error in errors {
                        if let Value::Object(error) = &mut error {
                            let extensions = error
                                .entry("extensions")
                                .or_insert_with(|| Value::Object(Map::new()));
                            if let Value::Object(extensions) = extensions {
                                extensions.insert("serviceName".to_string(), Value::String(node.subgraph.clone()));
                            }
                        }
                        resolution.errors.push(error);
                    }
                } else {
                    resolution.errors.push(generic_error(&node.subgraph, None));
                }
            }
            Err(e) => {
                warn!(subgraph = %node.subgraph, error = %e, "subgraph fetch failed");
                for key in &node.response_keys {
                    resolution.data.insert(key.clone(), Value::Null);
                }
                let reason = self.propagate_errors.then(|| e.to_string());
                resolution.errors.push(generic_error(&node.subgraph, reason));
            }
        }
    }
}

fn generic_error(subgraph: &str, reason: Option<String>) -> Value {
    let message = match reason {
        Some(reason) => format!("Failed to fetch from Subgraph '{}': {}", subgraph, reason),
        None => format!("Failed to fetch from Subgraph '{}'.", subgraph),
    };
    json!({
        "message": message,
        "extensions": { "serviceName": subgraph },
    })
}

pub(crate) fn forward_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for name in FORWARDED_HEADERS {
        if let Some(value) = from.get(name) {
            to.insert(name, HeaderValue::clone(value));
        }
    }
}

#[async_trait]
impl Resolver for SubgraphResolver {
    async fn resolve(
        &self,
        ctx: &RequestContext,
        plan: &ExecutionPlan,
        variables: &Map<String, Value>,
    ) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        match plan.kind {
            OperationKind::Mutation => {
                for node in &plan.fetches {
                    let outcome = self.fetch(ctx, node, variables).await;
                    self.merge(node, outcome, &mut resolution);
                }
            }
            _ => {
                let outcomes = join_all(plan.fetches.iter().map(|node| self.fetch(ctx, node, variables))).await;
                for (node, outcome) in plan.fetches.iter().zip(outcomes) {
                    self.merge(node, outcome, &mut resolution);
                }
            }
        }
        Ok(resolution)
    }

    async fn subscribe(
        &self,
        ctx: RequestContext,
        plan: Arc<ExecutionPlan>,
        variables: Map<String, Value>,
        mut writer: Box<dyn SubscriptionWriter>,
        id: SubscriptionIdentifier,
    ) -> Result<()> {
        let node = plan
            .fetches
            .first()
            .ok_or_else(|| Error::Resolve("subscription plan has no subgraph fetch".into()))?;

        let mut headers = HeaderMap::new();
        forward_headers(&ctx.headers, &mut headers);
        let request = UpstreamRequest {
            subgraph: node.subgraph.clone(),
            url: node.url.clone(),
            query: node.operation.clone(),
            operation_name: node.operation_name.clone(),
            variables: node.variables_from(&variables),
            init_payload: ctx.init_payload.clone(),
            headers,
        };

        let cancel = CancellationToken::new();
        self.subscriptions.insert(id, cancel.clone());

        let source = self.subscriptions_source.clone();
        let subscriptions = self.subscriptions.clone();
        tokio::spawn(async move {
            let result = source.run(request, writer.as_mut(), cancel.clone()).await;
            if !cancel.is_cancelled() {
                match result {
                    Ok(()) => writer.complete().await,
                    Err(e) => {
                        warn!(?id, error = %e, "upstream subscription failed");
                        writer.close().await;
                    }
                }
            }
            subscriptions.remove(&id);
            debug!(?id, "subscription finished");
        });
        Ok(())
    }

    fn complete_subscription(&self, id: SubscriptionIdentifier) -> bool {
        match self.subscriptions.remove(&id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn unsubscribe_client(&self, connection_id: u64) -> usize {
        let ids: Vec<SubscriptionIdentifier> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.key().connection_id == connection_id)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter()
            .filter(|id| self.complete_subscription(*id))
            .count()
    }

    fn outstanding_subscriptions(&self, connection_id: u64) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.key().connection_id == connection_id)
            .count()
    }
}
