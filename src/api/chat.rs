//! Client-facing API — the OpenAI-compatible surface this gateway exposes.
//!
//! Grounded on `api/client.rs` (thin handlers, all routing logic
//! delegated elsewhere) and on `original_source/src/app.py`'s Flask routes for
//! which endpoints exist and what each one does.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::dispatch::{self, DispatchOutcome};
use crate::error::GatewayError;
use crate::model::{ChatRequest, Route};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(descriptor))
        .route("/health", get(super::health::health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(legacy_completions))
        .route("/api/route", post(route_override))
        .with_state(state)
}

/// `GET /` — a minimal service descriptor (`SPEC_FULL.md` §2), not part of the
/// OpenAI surface but handy for a human or a load balancer poking the root.
async fn descriptor(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "service": "ai-router",
        "virtual_model": state.config.virtual_model,
        "routes": ["primary", "xai", "enrich", "meta"],
    }))
}

/// `GET /v1/models` — a single synthetic entry for the virtual model clients
/// should request, regardless of which concrete models back each route.
async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data = vec![json!({"id": state.config.virtual_model, "object": "model", "owned_by": "ai-router"})];
    Json(json!({"object": "list", "data": data}))
}

/// `POST /v1/chat/completions` — the gateway's primary entry point: classify,
/// speculate, and route.
async fn chat_completions(State(state): State<Arc<AppState>>, Json(body): Json<ChatRequest>) -> Result<Response, GatewayError> {
    validate(&body)?;
    let outcome = dispatch::handle_chat(&state, body, None).await?;
    Ok(outcome_to_response(outcome))
}

/// `POST /v1/completions` — minimal, unlogged legacy passthrough (`SPEC_FULL.md`
/// §2): validates `prompt` is present, overwrites `model`, and forwards the body
/// to local-reasoning's own legacy endpoint as-is. Bypasses the session trace,
/// system-prompt injection, and classification entirely — this endpoint does not
/// participate in the routing system the rest of the gateway implements. A
/// transport failure maps to a flat `502`, distinct from the richer 500/503/504
/// split the routed surface uses.
async fn legacy_completions(State(state): State<Arc<AppState>>, Json(mut body): Json<Value>) -> Result<Response, GatewayError> {
    if body.get("prompt").and_then(Value::as_str).is_none() {
        return Err(GatewayError::BadRequest("missing required field: prompt".into()));
    }

    let object = body.as_object_mut().ok_or_else(|| GatewayError::BadRequest("request body must be a JSON object".into()))?;
    object.insert("model".to_string(), json!(state.config.local_reasoning.model));

    match state.backend.legacy_completion(&body).await {
        Ok(reply) => {
            let mut response = Response::builder().status(reply.status).body(Body::from(reply.body)).expect("valid response parts");
            if let Ok(value) = HeaderValue::from_str(&reply.content_type) {
                response.headers_mut().insert(axum::http::header::CONTENT_TYPE, value);
            }
            Ok(response)
        }
        Err(e) => Ok((
            axum::http::StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "Bad gateway", "message": e.to_string() })),
        )
            .into_response()),
    }
}

/// `POST /api/route` — test-only entry point that lets a caller force a specific
/// route instead of letting the classifier decide. `route: "auto"` (or an absent
/// field) behaves exactly like `/v1/chat/completions`, including the meta fast
/// path; `route: "meta"` is rejected, since `meta` is only ever reachable via that
/// fast path, never by explicit request (`SPEC_FULL.md` §3.3).
async fn route_override(State(state): State<Arc<AppState>>, Json(mut body): Json<Value>) -> Result<Response, GatewayError> {
    let requested_route = match body.as_object_mut().and_then(|o| o.remove("route")) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s == "auto" => None,
        Some(Value::String(s)) => Some(parse_route(&s)?),
        Some(other) => return Err(GatewayError::BadRequest(format!("route must be a string, got {other}"))),
    };

    let request: ChatRequest = serde_json::from_value(body).map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    validate(&request)?;
    let outcome = dispatch::handle_chat(&state, request, requested_route).await?;
    Ok(outcome_to_response(outcome))
}

fn parse_route(s: &str) -> Result<Route, GatewayError> {
    match s {
        "primary" => Ok(Route::Primary),
        "xai" => Ok(Route::Xai),
        "enrich" => Ok(Route::Enrich),
        "meta" => Err(GatewayError::BadRequest(
            "route \"meta\" cannot be requested explicitly — it is only reachable via the meta fast path".into(),
        )),
        other => Err(GatewayError::BadRequest(format!("unknown route: {other}"))),
    }
}

fn validate(request: &ChatRequest) -> Result<(), GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::BadRequest("messages must not be empty".into()));
    }
    Ok(())
}

fn outcome_to_response(outcome: DispatchOutcome) -> Response {
    match outcome {
        DispatchOutcome::Buffered { status, content_type, body } => {
            let mut response = Response::builder().status(status).body(Body::from(body)).expect("valid response parts");
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(axum::http::header::CONTENT_TYPE, value);
            }
            response
        }
        DispatchOutcome::Streamed { status, stream } => Response::builder()
            .status(status)
            .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
            .body(Body::from_stream(stream))
            .expect("valid response parts"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_route_rejects_meta() {
        assert!(parse_route("meta").is_err());
    }

    #[test]
    fn parse_route_accepts_primary_xai_enrich() {
        assert_eq!(parse_route("primary").unwrap(), Route::Primary);
        assert_eq!(parse_route("xai").unwrap(), Route::Xai);
        assert_eq!(parse_route("enrich").unwrap(), Route::Enrich);
    }

    #[test]
    fn parse_route_rejects_unknown_string() {
        assert!(parse_route("not-a-route").is_err());
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            extra: Default::default(),
        };
        assert!(validate(&request).is_err());
    }

    use std::sync::Arc;

    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::{BackendTarget, CloudTarget, Config, PromptPaths};

    async fn test_state(local_fast_uri: String, local_reasoning_uri: String) -> Arc<AppState> {
        let config = Config {
            local_fast: BackendTarget { base_url: local_fast_uri, model: "fast-model".into() },
            local_reasoning: BackendTarget { base_url: local_reasoning_uri, model: "reasoning-model".into() },
            cloud: CloudTarget { base_url: "http://cloud.invalid".into(), model: "cloud-model".into(), api_key: None },
            virtual_model: "ai-router".into(),
            search_tools: vec!["web_search".into()],
            classification_context_budget: 112_000,
            classifier_max_tokens: 64,
            cloud_max_tokens_floor: 16_384,
            timezone: "America/Los_Angeles".parse().unwrap(),
            log_dir: std::env::temp_dir().join(format!("ai-router-test-{}", uuid::Uuid::new_v4())),
            sessions_max_age_days: 7,
            sessions_max_count: 5000,
            prompts: PromptPaths {
                primary_system: "/nonexistent/primary.md".into(),
                routing_system: "/nonexistent/routing_system.md".into(),
                routing_request: "/nonexistent/routing_request.md".into(),
                routing_truncation_note: "/nonexistent/truncation.md".into(),
                enrichment_system: "/nonexistent/enrichment_system.md".into(),
                enrichment_injection: "/nonexistent/enrichment_injection.md".into(),
                meta_system: "/nonexistent/meta_system.md".into(),
                xai_system: "/nonexistent/xai_system.md".into(),
            },
            port: 0,
        };
        AppState::new(config).unwrap()
    }

    #[tokio::test]
    async fn chat_completions_routes_explicit_primary_through_to_local_reasoning() {
        let fast = MockServer::start().await;
        let reasoning = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "hello back"}, "finish_reason": "stop"}]
            })))
            .mount(&reasoning)
            .await;

        let state = test_state(fast.uri(), reasoning.uri()).await;
        let app = router(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/route")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "route": "primary",
                    "model": "ai-router",
                    "messages": [{"role": "user", "content": "hi"}],
                }))
                .unwrap(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "hello back");
    }

    #[tokio::test]
    async fn route_override_rejects_explicit_meta() {
        let fast = MockServer::start().await;
        let reasoning = MockServer::start().await;
        let state = test_state(fast.uri(), reasoning.uri()).await;
        let app = router(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/route")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "route": "meta",
                    "messages": [{"role": "user", "content": "hi"}],
                }))
                .unwrap(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
