//! HTTP edge: GraphQL over HTTP, WebSocket upgrades, the playground and health probes.

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::federation_manager::FederationManager;
use crate::websocket::{WebSocketService, is_upgrade_request};
use crate::{GraphQLRequest, RequestContext};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const GRAPHIQL_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Portkey Federation Gateway</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    const token = localStorage.getItem('auth_token') || '';

    function graphQLFetcher(graphQLParams) {
      return fetch('/graphql', {
        method: 'post',
        headers: {
          'Content-Type': 'application/json',
          'Authorization': token ? `Bearer ${token}` : '',
        },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

/// Everything a request needs, shared by all connections
pub struct Gateway {
    manager: Arc<FederationManager>,
    websocket: WebSocketService,
    playground: bool,
}

impl Gateway {
    pub fn new(
        manager: Arc<FederationManager>,
        websocket: WebSocketConfig,
        playground: bool,
        shutdown: CancellationToken,
    ) -> Self {
        let websocket = WebSocketService::new(manager.clone(), websocket, shutdown);
        Gateway {
            manager,
            websocket,
            playground,
        }
    }

    pub fn manager(&self) -> &Arc<FederationManager> {
        &self.manager
    }
}

/// Route one request
pub async fn handle_request<B>(
    req: Request<B>,
    gateway: Arc<Gateway>,
    remote_addr: Option<SocketAddr>,
) -> std::result::Result<Response<ResponseBody>, Infallible>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Display,
{
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => execute_graphql(req, &gateway, remote_addr).await,

        (&Method::GET, "/ws") if is_upgrade_request(&req) => {
            let ctx = RequestContext {
                headers: req.headers().clone(),
                init_payload: None,
                remote_addr,
            };
            match gateway.websocket.accept(req, ctx) {
                Ok(response) => response.map(|()| full("")),
                Err(e) => error_response(&e),
            }
        }

        (&Method::GET, "/graphiql") if gateway.playground => Response::builder()
            .header(header::CONTENT_TYPE, "text/html")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full(GRAPHIQL_HTML))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/") if gateway.playground => Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, "/graphiql")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/health/live") => json_response(StatusCode::OK, &json!({ "status": "ok" })),

        (&Method::GET, "/health/ready") => {
            if gateway.manager.is_ready() {
                json_response(StatusCode::OK, &json!({ "status": "ready" }))
            } else {
                json_response(StatusCode::SERVICE_UNAVAILABLE, &json!({ "status": "starting" }))
            }
        }

        (&Method::OPTIONS, _) => Response::builder()
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS")
            .header(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                "Content-Type, Authorization, x-api-key, x-token",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full("Not Found"))
            .unwrap_or_else(|_| internal_server_error()),
    };

    Ok(response)
}

async fn execute_graphql<B>(req: Request<B>, gateway: &Gateway, remote_addr: Option<SocketAddr>) -> Response<ResponseBody>
where
    B: Body<Data = Bytes>,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_response(&Error::InvalidRequest(format!("failed to read request body: {}", e)));
        }
    };
    let request: GraphQLRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&Error::InvalidRequest(format!("invalid JSON request: {}", e))),
    };

    // Snapshot the handler; a concurrent swap does not affect this request.
    let Some(executor) = gateway.manager.current_executor() else {
        return error_response(&Error::NotReady);
    };

    let ctx = RequestContext {
        headers: parts.headers,
        init_payload: None,
        remote_addr,
    };
    let mut out = Vec::new();
    match executor.execute(&ctx, &request, &mut out).await {
        Ok(()) => Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(full(out))
            .unwrap_or_else(|_| internal_server_error()),
        Err(e) => {
            if e.is_client_error() {
                debug!(error = %e, "rejected operation");
            } else {
                warn!(error = %e, "operation failed");
            }
            error_response(&e)
        }
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(full(body.to_string()))
        .unwrap_or_else(|_| internal_server_error())
}

fn error_response(error: &Error) -> Response<ResponseBody> {
    json_response(error.status_code(), &error.to_response())
}

// Create a standard internal server error response
fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[derive(Clone)]
// An Executor that uses the tokio runtime.
pub struct TokioExecutor;

impl<F> hyper::rt::Executor<F> for TokioExecutor
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    fn execute(&self, fut: F) {
        tokio::task::spawn(fut);
    }
}

/// Accept connections until `shutdown` fires, then let open connections finish gracefully
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>, shutdown: CancellationToken) -> Result<()> {
    info!(addr = %listener.local_addr()?, "GraphQL federation gateway listening");

    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let gateway = gateway.clone();
        let shutdown = shutdown.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| handle_request(req, gateway.clone(), Some(remote_addr)));
            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor);
            let connection = builder.serve_connection_with_upgrades(io, service);
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = shutdown.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    connection.await
                }
            };
            if let Err(e) = result {
                debug!(%remote_addr, error = %e, "error processing connection");
            }
        });
    }

    info!("gateway stopped accepting connections");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubgraphConfig;
    use crate::config::{ExecutorConfig, ProviderConfig};
    use crate::transport::HttpTransport;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use wiremock::matchers::{header as header_is, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(playground: bool) -> Arc<Gateway> {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(2)).unwrap());
        let manager = Arc::new(FederationManager::new(
            transport,
            ExecutorConfig::default(),
            ProviderConfig::default(),
        ));
        Arc::new(Gateway::new(
            manager,
            WebSocketConfig::default(),
            playground,
            CancellationToken::new(),
        ))
    }

    async fn send(gateway: &Arc<Gateway>, request: Request<Full<Bytes>>) -> (StatusCode, Bytes) {
        let response = handle_request(request, gateway.clone(), None).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    fn post(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/graphql")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(path).body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn test_not_ready_before_first_composition() {
        let gateway = gateway(false);
        let (status, body) = send(&gateway, post(r#"{"query":"{ me }"}"#)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0]["extensions"]["code"], "NOT_READY");

        let (status, _) = send(&gateway, get("/health/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = send(&gateway, get("/health/live")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_graphql_request_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_is("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "me": "ada" } })))
            .mount(&server)
            .await;

        let gateway = gateway(false);
        gateway
            .manager()
            .apply(&[SubgraphConfig {
                name: "accounts".into(),
                url: server.uri(),
                schema: "type Query { me: String }".into(),
            }])
            .await
            .unwrap();

        let (status, body) = send(&gateway, post(r#"{"query":"{ me }"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({ "data": { "me": "ada" } }));

        let (status, _) = send(&gateway, get("/health/ready")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_client_errors_are_400() {
        let gateway = gateway(false);
        gateway
            .manager()
            .apply(&[SubgraphConfig {
                name: "accounts".into(),
                url: "http://127.0.0.1:9".into(),
                schema: "type Query { me: String }".into(),
            }])
            .await
            .unwrap();

        let (status, _) = send(&gateway, post("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&gateway, post(r#"{"query":"{ nope }"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["errors"][0]["extensions"]["code"], "GRAPHQL_VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn test_playground_routes() {
        let (status, _) = send(&gateway(false), get("/graphiql")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let enabled = gateway(true);
        let (status, body) = send(&enabled, get("/graphiql")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("GraphiQL"));
        let (status, _) = send(&enabled, get("/")).await;
        assert_eq!(status, StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/graphql")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = handle_request(request, gateway(false), None).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
