//! Operation execution against one composed configuration.
//!
//! An [`Executor`] is immutable once built. Schema changes produce a new executor; requests
//! that already hold the old one finish against it.

pub mod introspection;
pub mod normalize;
pub mod plan_cache;
pub mod query_planner;
pub mod resolver;
pub mod subscription_client;
pub mod validation;

use async_trait::async_trait;
use graphql_parser::query::parse_query;
use serde_json::{Map, Value, json};
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::composition::ComposedConfiguration;
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::schema::{SchemaModel, value_to_json};
use crate::transport::{HttpTransport, SubgraphTransport};
use crate::{GraphQLRequest, RequestContext};

use normalize::{extract_variables, normalize};
use plan_cache::PlanCache;
use query_planner::{ExecutionPlan, QueryPlanner, RootFieldPlanner};
use resolver::{Resolver, SubgraphResolver};
use subscription_client::{SubscriptionSource, WsSubscriptionClient};
use validation::{validate_operation, validate_variables};

/// Identifies one subscription across the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionIdentifier {
    pub connection_id: u64,
    pub subscription_id: u64,
}

/// Sink for the events of one subscription.
///
/// Resolvers `write` the bytes of one JSON response and then `flush`; the writer decides
/// how that response is framed for the client.
#[async_trait]
pub trait SubscriptionWriter: Send {
    fn write(&mut self, data: &[u8]);
    async fn flush(&mut self) -> Result<()>;
    /// The subscription ended normally
    async fn complete(&mut self);
    /// The subscription ended abnormally
    async fn close(&mut self);
}

struct Prepared {
    plan: Arc<ExecutionPlan>,
    variables: Map<String, Value>,
}

pub struct Executor {
    config: Arc<ComposedConfiguration>,
    resolver: Arc<dyn Resolver>,
    planner: Arc<dyn QueryPlanner>,
    plan_cache: PlanCache,
    introspection: Option<Value>,
    options: ExecutorConfig,
}

impl Executor {
    pub fn builder(config: Arc<ComposedConfiguration>) -> ExecutorBuilder {
        ExecutorBuilder::new(config)
    }

    pub fn config(&self) -> &ComposedConfiguration {
        &self.config
    }

    /// SDL served to clients
    pub fn client_schema(&self) -> &str {
        &self.config.client_sdl
    }

    /// Schema operations are validated and planned against
    pub fn router_schema(&self) -> &SchemaModel {
        &self.config.schema
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn cached_plans(&self) -> usize {
        self.plan_cache.len()
    }

    /// Execute a query or mutation and write the JSON response to `writer`
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        request: &GraphQLRequest,
        writer: &mut (dyn io::Write + Send),
    ) -> Result<()> {
        let prepared = self.prepare(request)?;
        let response = self.respond(ctx, &prepared).await?;
        serde_json::to_writer(writer, &response)?;
        Ok(())
    }

    /// Execute a subscription.
    ///
    /// Subscriptions served by a subgraph continue on the resolver after this returns; the
    /// returned plan reports that through [`ExecutionPlan::is_async`]. Anything else is
    /// resolved immediately, written, and completed.
    pub async fn execute_subscription(
        &self,
        ctx: RequestContext,
        request: &GraphQLRequest,
        mut writer: Box<dyn SubscriptionWriter>,
        id: SubscriptionIdentifier,
    ) -> Result<Arc<ExecutionPlan>> {
        let prepared = self.prepare(request)?;
        if prepared.plan.is_async() {
            self.resolver
                .subscribe(ctx, prepared.plan.clone(), prepared.variables, writer, id)
                .await?;
        } else {
            let response = self.respond(&ctx, &prepared).await?;
            writer.write(&serde_json::to_vec(&response)?);
            writer.flush().await?;
            writer.complete().await;
        }
        Ok(prepared.plan)
    }

    fn prepare(&self, request: &GraphQLRequest) -> Result<Prepared> {
        if request.query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must not be empty".into()));
        }
        let document = parse_query::<String>(&request.query).map_err(|e| Error::Parse(e.to_string()))?;
        let mut operation = normalize(document, request.operation_name.as_deref())?;
        let schema = &self.config.schema;
        validate_operation(&operation, schema, self.options.enable_introspection).map_err(Error::Validation)?;

        let mut variables = match &request.variables {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(variables)) => variables.clone(),
            Some(_) => return Err(Error::InvalidRequest("variables must be an object".into())),
        };
        extract_variables(&mut operation, schema, &mut variables);
        validate_variables(&operation, schema, &variables).map_err(Error::Variables)?;
        for definition in &operation.variable_definitions {
            if let Some(default) = &definition.default_value {
                if !variables.contains_key(&definition.name) {
                    variables.insert(definition.name.clone(), value_to_json(default, &Map::new()));
                }
            }
        }

        let key = operation.hash();
        let plan = match self.plan_cache.get(key) {
            Some(plan) => {
                debug!(key, "plan cache hit");
                plan
            }
            None => {
                let plan = Arc::new(self.planner.plan(&operation, &self.config)?);
                self.plan_cache.insert(key, plan.clone());
                plan
            }
        };
        Ok(Prepared { plan, variables })
    }

    async fn respond(&self, ctx: &RequestContext, prepared: &Prepared) -> Result<Value> {
        let plan = &prepared.plan;
        let mut data = Map::new();
        let mut errors = Vec::new();
        if !plan.fetches.is_empty() {
            let resolution = self.resolver.resolve(ctx, plan, &prepared.variables).await?;
            data = resolution.data;
            errors = resolution.errors;
        }
        data.extend(introspection::resolve_local_fields(
            &plan.local_fields,
            &plan.root_type,
            self.introspection.as_ref(),
            &prepared.variables,
        ));

        let ordered: Map<String, Value> = plan
            .response_keys
            .iter()
            .map(|key| (key.clone(), data.remove(key).unwrap_or(Value::Null)))
            .collect();
        let mut response = json!({ "data": ordered });
        if !errors.is_empty() {
            response["errors"] = Value::Array(errors);
        }
        Ok(response)
    }
}

pub struct ExecutorBuilder {
    config: Arc<ComposedConfiguration>,
    options: ExecutorConfig,
    planner: Option<Arc<dyn QueryPlanner>>,
    resolver: Option<Arc<dyn Resolver>>,
    transport: Option<Arc<dyn SubgraphTransport>>,
    subscription_source: Option<Arc<dyn SubscriptionSource>>,
}

impl ExecutorBuilder {
    fn new(config: Arc<ComposedConfiguration>) -> Self {
        ExecutorBuilder {
            config,
            options: ExecutorConfig::default(),
            planner: None,
            resolver: None,
            transport: None,
            subscription_source: None,
        }
    }

    pub fn options(mut self, options: ExecutorConfig) -> Self {
        self.options = options;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Use a ready-made resolver; `transport` and `subscription_source` are then ignored
    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn SubgraphTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn subscription_source(mut self, source: Arc<dyn SubscriptionSource>) -> Self {
        self.subscription_source = Some(source);
        self
    }

    pub fn build(self) -> Result<Executor> {
        let capacity = NonZeroUsize::new(self.options.plan_cache_size)
            .ok_or_else(|| Error::ExecutorBuild("plan cache size must be positive".into()))?;
        if self.config.schema.get(&self.config.schema.query_type).is_none() {
            return Err(Error::ExecutorBuild("composed schema has no query type".into()));
        }

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => {
                let transport = match self.transport {
                    Some(transport) => transport,
                    None => Arc::new(HttpTransport::new(Duration::from_secs(30))?),
                };
                let source = self
                    .subscription_source
                    .unwrap_or_else(|| Arc::new(WsSubscriptionClient::default()));
                Arc::new(SubgraphResolver::new(
                    transport,
                    source,
                    self.options.propagate_subgraph_errors,
                ))
            }
        };

        let introspection = self
            .options
            .enable_introspection
            .then(|| introspection::schema_json(&self.config.schema));

        info!(
            hash = %self.config.hash,
            subgraphs = self.config.subgraphs.len(),
            "built executor"
        );
        Ok(Executor {
            config: self.config,
            resolver,
            planner: self.planner.unwrap_or_else(|| Arc::new(RootFieldPlanner::new())),
            plan_cache: PlanCache::new(capacity),
            introspection,
            options: self.options,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::SubgraphConfig;
    use crate::composition::compose;
    use crate::executor::normalize::NormalizedOperation;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records what a subscription would send: flushed payloads, then "complete" or "close"
    pub(crate) struct RecordingWriter {
        buffer: Vec<u8>,
        events: mpsc::UnboundedSender<String>,
    }

    impl RecordingWriter {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
            let (events, rx) = mpsc::unbounded_channel();
            (
                RecordingWriter {
                    buffer: Vec::new(),
                    events,
                },
                rx,
            )
        }
    }

    #[async_trait]
    impl SubscriptionWriter for RecordingWriter {
        fn write(&mut self, data: &[u8]) {
            self.buffer.extend_from_slice(data);
        }

        async fn flush(&mut self) -> Result<()> {
            let payload = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            let _ = self.events.send(payload);
            Ok(())
        }

        async fn complete(&mut self) {
            let _ = self.events.send("complete".into());
        }

        async fn close(&mut self) {
            let _ = self.events.send("close".into());
        }
    }

    struct CountingPlanner {
        calls: AtomicUsize,
    }

    impl QueryPlanner for CountingPlanner {
        fn plan(&self, operation: &NormalizedOperation<'_>, config: &ComposedConfiguration) -> Result<ExecutionPlan> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            RootFieldPlanner::new().plan(operation, config)
        }
    }

    fn config(accounts_url: &str) -> Arc<ComposedConfiguration> {
        Arc::new(
            compose(&[SubgraphConfig {
                name: "accounts".into(),
                url: accounts_url.into(),
                schema: r#"
                    type Query { me: User, user(id: ID!): User }
                    type Subscription { userCreated: User }
                    type User { id: ID!, name: String }
                "#
                .into(),
            }])
            .unwrap(),
        )
    }

    fn request(query: &str) -> GraphQLRequest {
        GraphQLRequest {
            query: query.into(),
            variables: None,
            operation_name: None,
            extensions: None,
        }
    }

    async fn execute(executor: &Executor, request: &GraphQLRequest) -> Result<Value> {
        let mut out = Vec::new();
        executor.execute(&RequestContext::default(), request, &mut out).await?;
        Ok(serde_json::from_slice(&out).unwrap())
    }

    #[tokio::test]
    async fn test_repeated_operations_hit_the_plan_cache() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "user": { "id": "1" } } })))
            .mount(&server)
            .await;

        let planner = Arc::new(CountingPlanner {
            calls: AtomicUsize::new(0),
        });
        let executor = Executor::builder(config(&server.uri()))
            .planner(planner.clone())
            .build()
            .unwrap();

        execute(&executor, &request("{ user(id: 1) { id } }")).await.unwrap();
        execute(&executor, &request("query {\n  user(id: 1) {\n    id\n  }\n}")).await.unwrap();
        execute(&executor, &request("{ user(id: 2) { id } }")).await.unwrap();

        assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.cached_plans(), 1);
    }

    #[tokio::test]
    async fn test_response_follows_document_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "me": { "name": "Ada" } }
            })))
            .mount(&server)
            .await;
        let executor = Executor::builder(config(&server.uri())).build().unwrap();

        let response = execute(&executor, &request("{ me { name } __typename }")).await.unwrap();
        assert_eq!(response, json!({ "data": { "me": { "name": "Ada" }, "__typename": "Query" } }));
        let keys: Vec<&String> = response["data"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["me", "__typename"]);
    }

    #[tokio::test]
    async fn test_pipeline_errors() {
        let executor = Executor::builder(config("http://127.0.0.1:9")).build().unwrap();

        let err = execute(&executor, &request("{ me { ")).await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        let err = execute(&executor, &request("{ me { email } }")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut with_variables = request("query($id: ID!) { user(id: $id) { id } }");
        with_variables.variables = Some(json!({ "id": true }));
        let err = execute(&executor, &with_variables).await.unwrap_err();
        assert!(matches!(err, Error::Variables(_)));

        let err = execute(&executor, &request("  ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_introspection_only_subscription_completes_immediately() {
        let executor = Executor::builder(config("http://127.0.0.1:9")).build().unwrap();
        let (writer, mut events) = RecordingWriter::new();
        let id = SubscriptionIdentifier {
            connection_id: 1,
            subscription_id: 1,
        };

        let plan = executor
            .execute_subscription(RequestContext::default(), &request("subscription { __typename }"), Box::new(writer), id)
            .await
            .unwrap();

        assert!(!plan.is_async());
        assert_eq!(
            events.recv().await.unwrap(),
            json!({ "data": { "__typename": "Subscription" } }).to_string()
        );
        assert_eq!(events.recv().await.unwrap(), "complete");
        assert_eq!(executor.resolver().outstanding_subscriptions(1), 0);
    }

    #[test]
    fn test_zero_sized_plan_cache_is_rejected() {
        let options = ExecutorConfig {
            plan_cache_size: 0,
            ..ExecutorConfig::default()
        };
        let result = Executor::builder(config("http://127.0.0.1:9")).options(options).build();
        assert!(matches!(result, Err(Error::ExecutorBuild(_))));
    }
}
