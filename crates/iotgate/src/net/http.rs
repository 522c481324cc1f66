//! HTTP Adapter
//!
//! Serves the gateway protocol over HTTP with axum. Each method has a
//! validator that turns the exchange into an envelope (or rejects it with a
//! client error); the envelope then takes the same dispatch path as TCP and
//! UDP messages.
//!
//! | Method        | Envelope source                                  |
//! |---------------|--------------------------------------------------|
//! | GET, DELETE   | query parameters                                 |
//! | POST, PUT     | `application/json` body merged with query params |

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, header},
    routing::{any, get},
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

use super::connection::HttpConnection;
use crate::command::CommandRouter;
use crate::pool::PoolStatus;

#[derive(Clone)]
struct HttpState {
    router: CommandRouter,
    response_timeout: Duration,
}

/// Create the HTTP router serving the gateway on `route`
pub fn create_router(router: CommandRouter, route: &str, response_timeout: Duration) -> Router {
    Router::new()
        .route(route, any(handle_exchange))
        // Health check for monitoring/load balancers
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(HttpState {
            router,
            response_timeout,
        })
}

type Reply = (StatusCode, Json<Value>);

fn error_reply(status: StatusCode, message: impl Into<String>) -> Reply {
    (
        status,
        Json(json!({"status": "error", "message": message.into()})),
    )
}

/// The parts of an exchange validators look at
struct Exchange<'a> {
    query: &'a [(String, String)],
    headers: &'a HeaderMap,
    body: &'a Bytes,
}

/// Builds the envelope for an exchange or rejects it
type Validator = fn(&Exchange<'_>) -> Result<Value, Reply>;

fn validator_for(method: &Method) -> Option<Validator> {
    match *method {
        Method::GET | Method::DELETE => Some(envelope_from_query),
        Method::POST | Method::PUT => Some(envelope_from_json_body),
        _ => None,
    }
}

async fn handle_exchange(
    State(state): State<HttpState>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Reply {
    let Some(validate) = validator_for(&method) else {
        return error_reply(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    };

    let exchange = Exchange {
        query: &query,
        headers: &headers,
        body: &body,
    };
    match validate(&exchange) {
        Ok(envelope) => forward(&state, envelope).await,
        Err(reply) => reply,
    }
}

fn envelope_from_query(exchange: &Exchange<'_>) -> Result<Value, Reply> {
    let mut command = None;
    let mut explicit_data = None;
    let mut params = Map::new();

    for (key, value) in exchange.query {
        match key.as_str() {
            "command" => command = Some(value.clone()),
            "data" => match serde_json::from_str::<Value>(value) {
                Ok(Value::Object(data)) => explicit_data = Some(data),
                _ => {
                    params.insert(key.clone(), Value::String(value.clone()));
                }
            },
            _ => {
                params.insert(key.clone(), Value::String(value.clone()));
            }
        }
    }

    let command = command
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| error_reply(StatusCode::BAD_REQUEST, "Missing 'command' query parameter"))?;
    let data = explicit_data.unwrap_or(params);
    Ok(json!({"command": command, "data": data}))
}

fn envelope_from_json_body(exchange: &Exchange<'_>) -> Result<Value, Reply> {
    let is_json = exchange
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    if !is_json {
        return Err(error_reply(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Content-Type. Expected application/json",
        ));
    }

    let mut body = match serde_json::from_slice::<Value>(exchange.body) {
        Ok(Value::Object(body)) => body,
        _ => return Err(error_reply(StatusCode::BAD_REQUEST, "Invalid JSON body")),
    };
    for (key, value) in exchange.query {
        body.insert(key.clone(), Value::String(value.clone()));
    }
    Ok(Value::Object(body))
}

/// Controller shared by every method: run the envelope through the router
/// and wait for the handler's answer
async fn forward(state: &HttpState, envelope: Value) -> Reply {
    let message = envelope.to_string();
    let (connection, reply) = HttpConnection::new(format!("http-{}", Uuid::new_v4()));
    state.router.dispatch(Arc::new(connection), message.as_bytes());

    match tokio::time::timeout(state.response_timeout, reply).await {
        Ok(Ok(bytes)) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(response) => (StatusCode::OK, Json(response)),
            Err(e) => {
                warn!("Handler produced invalid JSON: {}", e);
                error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Invalid response from handler")
            }
        },
        Ok(Err(_)) => error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Request finished without a response",
        ),
        Err(_) => error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Timed out waiting for a response",
        ),
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    pool: PoolStatus,
    commands: Vec<String>,
}

async fn health_check(State(state): State<HttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        pool: state.router.pool().status(),
        commands: state.router.registry().names(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandRegistry, register_builtins};
    use crate::pool::WorkerPool;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let registry = Arc::new(CommandRegistry::default());
        register_builtins(&registry);
        let router = CommandRouter::new(registry, WorkerPool::with_name("http-test", 2).unwrap());
        create_router(router, "/iots", Duration::from_secs(5))
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_post_register_company() {
        let request = Request::post("/iots")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"command":"Register Company","data":{"company_name":"acme","company_id":"9"}}"#,
            ))
            .unwrap();

        let (status, body) = call(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["company_id"], "9");
    }

    #[tokio::test]
    async fn test_post_requires_json_content_type() {
        let request = Request::post("/iots")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = call(app(), request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_put_invalid_body() {
        let request = Request::put("/iots")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = call(app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Invalid JSON body");
    }

    #[tokio::test]
    async fn test_get_builds_envelope_from_query() {
        let request = Request::get("/iots?command=Register%20Company&company_name=acme&company_id=3")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["company_name"], "acme");
    }

    #[tokio::test]
    async fn test_get_without_command_is_bad_request() {
        let request = Request::get("/iots?company_name=acme")
            .body(Body::empty())
            .unwrap();
        let (status, _) = call(app(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let request = Request::patch("/iots").body(Body::empty()).unwrap();
        let (status, body) = call(app(), request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["message"], "Method Not Allowed");
    }

    #[tokio::test]
    async fn test_envelope_error_is_protocol_level() {
        let request = Request::post("/iots")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"command":"Register Company"}"#))
            .unwrap();
        let (status, body) = call(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_health_lists_commands() {
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = call(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pool"]["configured_workers"], 2);
        assert_eq!(body["commands"].as_array().unwrap().len(), 4);
    }
}
