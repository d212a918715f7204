//! Backend client (C4): the three configured targets (local-fast, local-reasoning,
//! cloud), all speaking the OpenAI-compatible wire protocol, plus the per-route
//! system-prompt injection and sampling overrides every forwarded request goes
//! through.
//!
//! Follows the enum-dispatch-over-adapters shape common to this kind of gateway
//! (a [`Target`] enum, the [`SseStream`] type alias, a uniform call surface) and
//! `backends/openai.rs`'s dual buffered/streaming-client pattern for each adapter.
//! There is no multi-vendor schema translation here — every target speaks the same
//! protocol, so one adapter type covers local-fast and local-reasoning, and a
//! second covers the cloud backend (which additionally exposes `/v1/responses`
//! for enrichment and needs a bearer token).

mod cloud;
mod local;

pub use cloud::CloudAdapter;
pub use local::LocalAdapter;

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::config::Config;
use crate::model::{ChatRequest, Route};
use crate::prompts::PromptRegistry;
use crate::session::{Session, StepKind};

/// A `Send`-able, heap-allocated SSE byte stream — backend bytes are proxied
/// verbatim, never buffered or re-encoded.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

const BACKEND_TIMEOUT: Duration = Duration::from_secs(300);
const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(10);
const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    LocalFast,
    LocalReasoning,
    Cloud,
}

impl Target {
    fn provider_label(self) -> &'static str {
        match self {
            Target::LocalFast => "local-fast",
            Target::LocalReasoning => "primary",
            Target::Cloud => "xai",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendCallError {
    #[error("timeout")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendCallError {
    /// Short marker recorded on a [`crate::session::Step`] when a call fails at the
    /// transport level.
    pub fn marker(&self) -> String {
        match self {
            Self::Timeout => "timeout".to_string(),
            Self::Connection(m) => format!("connection_error: {m}"),
            Self::Other(e) => format!("error: {e}"),
        }
    }
}

impl From<reqwest::Error> for BackendCallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connection(e.to_string())
        } else {
            Self::Other(e.into())
        }
    }
}

/// A buffered (non-streaming) HTTP reply from a backend. Deliberately keeps the raw
/// body bytes rather than a parsed [`Value`]: a non-2xx or malformed-JSON response is
/// still forwarded to the client verbatim (see `spec.md` §7 — only transport-level
/// failures are turned into gateway errors).
pub struct RawHttpReply {
    pub status: reqwest::StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

/// Best-effort extraction of assistant text and finish reason from a chat
/// completions response body, for session-trace logging. Returns `None` if the body
/// isn't parseable JSON in the expected shape — callers fall back to the raw text.
pub fn extract_chat_fields(body: &[u8]) -> Option<(String, Option<String>)> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let choice = value.get("choices")?.get(0)?;
    let message = choice.get("message")?;
    let text = message
        .get("content")
        .and_then(Value::as_str)
        .or_else(|| message.get("reasoning_content").and_then(Value::as_str))
        .unwrap_or("")
        .to_string();
    let finish_reason = choice.get("finish_reason").and_then(Value::as_str).map(str::to_string);
    Some((text, finish_reason))
}

fn lossy_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

/// Unified handle to the three configured backends.
pub struct BackendClient {
    local_fast: LocalAdapter,
    local_reasoning: LocalAdapter,
    cloud: CloudAdapter,
    cloud_max_tokens_floor: u64,
}

impl BackendClient {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            local_fast: LocalAdapter::new(cfg.local_fast.base_url.clone(), cfg.local_fast.model.clone())?,
            local_reasoning: LocalAdapter::new(
                cfg.local_reasoning.base_url.clone(),
                cfg.local_reasoning.model.clone(),
            )?,
            cloud: CloudAdapter::new(cfg.cloud.base_url.clone(), cfg.cloud.model.clone(), cfg.cloud.api_key.clone())?,
            cloud_max_tokens_floor: cfg.cloud_max_tokens_floor,
        })
    }

    pub fn endpoint(&self, target: Target) -> (&str, &str) {
        match target {
            Target::LocalFast => (self.local_fast.base_url(), self.local_fast.model()),
            Target::LocalReasoning => (self.local_reasoning.base_url(), self.local_reasoning.model()),
            Target::Cloud => (self.cloud.base_url(), self.cloud.model()),
        }
    }

    /// Classifier call (C5): fixed 10s timeout, no system-prompt injection (the
    /// classifier builds its own request from scratch).
    pub async fn call_classifier(&self, body: &Value) -> Result<RawHttpReply, BackendCallError> {
        self.local_fast.chat_completions(body, CLASSIFIER_TIMEOUT).await
    }

    /// Enrichment call (C6): `/v1/responses` on the cloud backend, 60s timeout.
    pub async fn call_enrichment(&self, body: &Value) -> Result<RawHttpReply, BackendCallError> {
        self.cloud.responses(body, ENRICHMENT_TIMEOUT).await
    }

    pub async fn health_check(&self, target: Target) -> anyhow::Result<()> {
        match target {
            Target::LocalFast => self.local_fast.health_check().await,
            Target::LocalReasoning => self.local_reasoning.health_check().await,
            Target::Cloud => self.cloud.health_check().await,
        }
    }

    pub fn cloud_configured(&self) -> bool {
        self.cloud.api_key_configured()
    }

    /// Legacy `/v1/completions` passthrough: no session trace, no system-prompt
    /// injection, no sampling overrides — just local-reasoning's own legacy
    /// endpoint with `model` already overwritten by the caller.
    pub async fn legacy_completion(&self, body: &Value) -> Result<RawHttpReply, BackendCallError> {
        self.local_reasoning.completions(body, BACKEND_TIMEOUT).await
    }

    /// The un-logged speculative primary call (dispatch engine fires this
    /// concurrently with classification; the caller decides afterward whether to
    /// log it as the winning step).
    pub async fn speculative_primary(
        &self,
        mut request: ChatRequest,
        prompts: &PromptRegistry,
        temporal: &str,
    ) -> Result<SpeculativeResponse, BackendCallError> {
        inject_system_prompt(&mut request, Route::Primary, prompts, temporal);
        self.apply_target_overrides(Target::LocalReasoning, &mut request);
        let body = serde_json::to_value(&request).map_err(|e| BackendCallError::Other(e.into()))?;

        if request.stream {
            let (status, stream) = self.local_reasoning.chat_completions_stream(&body).await?;
            Ok(SpeculativeResponse::Streamed(status, stream))
        } else {
            let reply = self.local_reasoning.chat_completions(&body, BACKEND_TIMEOUT).await?;
            Ok(SpeculativeResponse::Buffered(reply))
        }
    }

    /// The full forward contract for route handlers (C4 + C7): injects the
    /// route's system-prompt template prefixed with temporal context, applies
    /// per-target sampling overrides, sends the request, and records a
    /// provider_call [`crate::session::Step`].
    pub async fn forward(
        &self,
        target: Target,
        route: Route,
        mut request: ChatRequest,
        prompts: &PromptRegistry,
        temporal: &str,
        session: &mut Session,
    ) -> Result<crate::dispatch::DispatchOutcome, BackendCallError> {
        inject_system_prompt(&mut request, route, prompts, temporal);
        self.apply_target_overrides(target, &mut request);

        let (base_url, model) = self.endpoint(target);
        let url = format!("{base_url}/v1/chat/completions");
        let params = forward_params(&request);
        session.begin_step(StepKind::ProviderCall, target.provider_label(), url, model, None, Some(params));

        let body = serde_json::to_value(&request).map_err(|e| BackendCallError::Other(e.into()))?;
        let adapter = match target {
            Target::LocalFast => &self.local_fast,
            Target::LocalReasoning => &self.local_reasoning,
            Target::Cloud => return self.forward_cloud(request.stream, &body, session).await,
        };

        forward_with_adapter(adapter, request.stream, &body, session).await
    }

    async fn forward_cloud(
        &self,
        stream: bool,
        body: &Value,
        session: &mut Session,
    ) -> Result<crate::dispatch::DispatchOutcome, BackendCallError> {
        if stream {
            let (status, stream) = self.cloud.chat_completions_stream(body).await?;
            session.end_step(Some(status.as_u16()), Some("[streamed]"), None, None);
            Ok(crate::dispatch::DispatchOutcome::Streamed { status, stream })
        } else {
            let reply = self.cloud.chat_completions(body, BACKEND_TIMEOUT).await?;
            log_buffered_reply(session, &reply);
            Ok(crate::dispatch::DispatchOutcome::Buffered {
                status: reply.status,
                content_type: reply.content_type,
                body: reply.body,
            })
        }
    }

    fn apply_target_overrides(&self, target: Target, request: &mut ChatRequest) {
        match target {
            Target::LocalReasoning => {
                request.temperature = Some(1.0);
                request.top_p = Some(1.0);
                request.max_tokens = None;
            }
            Target::Cloud => {
                let floor = self.cloud_max_tokens_floor;
                let current = request.max_tokens.unwrap_or(0);
                if current < floor {
                    tracing::info!(from = current, to = floor, "raising max_tokens to cloud floor");
                    request.max_tokens = Some(floor);
                }
            }
            Target::LocalFast => {}
        }
        request.model = self.endpoint(target).1.to_string();
    }
}

async fn forward_with_adapter(
    adapter: &LocalAdapter,
    stream: bool,
    body: &Value,
    session: &mut Session,
) -> Result<crate::dispatch::DispatchOutcome, BackendCallError> {
    if stream {
        let (status, stream) = adapter.chat_completions_stream(body).await?;
        session.end_step(Some(status.as_u16()), Some("[streamed]"), None, None);
        Ok(crate::dispatch::DispatchOutcome::Streamed { status, stream })
    } else {
        let reply = adapter.chat_completions(body, BACKEND_TIMEOUT).await?;
        log_buffered_reply(session, &reply);
        Ok(crate::dispatch::DispatchOutcome::Buffered {
            status: reply.status,
            content_type: reply.content_type,
            body: reply.body,
        })
    }
}

fn log_buffered_reply(session: &mut Session, reply: &RawHttpReply) {
    let (text, finish_reason) = extract_chat_fields(&reply.body).unwrap_or_else(|| (lossy_text(&reply.body), None));
    session.end_step(Some(reply.status.as_u16()), Some(&text), finish_reason.as_deref(), None);
}

/// The speculative primary call's result, named distinctly from
/// [`crate::dispatch::DispatchOutcome`] because the dispatch engine still has to
/// decide whether to adopt it before it becomes a real response.
pub enum SpeculativeResponse {
    Buffered(RawHttpReply),
    Streamed(reqwest::StatusCode, SseStream),
}

/// Builds the non-message parameters logged alongside a provider call.
pub fn forward_params(request: &ChatRequest) -> Value {
    let mut map = serde_json::Map::new();
    if let Some(t) = request.temperature {
        map.insert("temperature".into(), Value::from(t));
    }
    if let Some(t) = request.top_p {
        map.insert("top_p".into(), Value::from(t));
    }
    if let Some(t) = request.max_tokens {
        map.insert("max_tokens".into(), Value::from(t));
    }
    map.insert("stream".into(), Value::from(request.stream));
    Value::Object(map)
}

/// System-prompt injection (C4 item 1): selects the route's template, prefixes it
/// with temporal context, and either prepends it into the first existing system
/// message or inserts a new leading one.
pub fn inject_system_prompt(request: &mut ChatRequest, route: Route, prompts: &PromptRegistry, temporal: &str) {
    let composite = format!("{temporal}\n{}", prompts.system_template(route));
    prepend_or_insert_system_message(&mut request.messages, &composite);
}

fn prepend_or_insert_system_message(messages: &mut Vec<crate::model::ChatMessage>, composite: &str) {
    use crate::model::{ChatMessage, Role};
    if let Some(existing) = messages.iter_mut().find(|m| m.role == Role::System) {
        existing.content = format!("{composite}\n{}", existing.content);
    } else {
        messages.insert(0, ChatMessage::system(composite.to_string()));
    }
}

/// Enrichment-context injection (C7): appends to the first existing system message,
/// or inserts a new one immediately before the last user message if none exists.
pub fn inject_enrichment_block(messages: &mut Vec<crate::model::ChatMessage>, injection: &str) {
    use crate::model::{ChatMessage, Role};
    if let Some(existing) = messages.iter_mut().find(|m| m.role == Role::System) {
        existing.content = format!("{}\n\n{injection}", existing.content);
    } else {
        let pos = messages.len().saturating_sub(1);
        messages.insert(pos, ChatMessage::system(injection.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, Role};

    #[test]
    fn extract_chat_fields_reads_content_and_finish_reason() {
        let body = serde_json::to_vec(&serde_json::json!({
            "choices": [{"message": {"content": "hi"}, "finish_reason": "stop"}]
        }))
        .unwrap();
        let (text, reason) = extract_chat_fields(&body).unwrap();
        assert_eq!(text, "hi");
        assert_eq!(reason.as_deref(), Some("stop"));
    }

    #[test]
    fn extract_chat_fields_falls_back_to_reasoning_content() {
        let body = serde_json::to_vec(&serde_json::json!({
            "choices": [{"message": {"reasoning_content": "thinking..."}}]
        }))
        .unwrap();
        let (text, _) = extract_chat_fields(&body).unwrap();
        assert_eq!(text, "thinking...");
    }

    #[test]
    fn extract_chat_fields_returns_none_on_malformed_body() {
        assert!(extract_chat_fields(b"not json").is_none());
    }

    #[test]
    fn prepend_or_insert_creates_leading_system_message_when_absent() {
        let mut messages = vec![ChatMessage::user("hi")];
        prepend_or_insert_system_message(&mut messages, "temporal+template");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "temporal+template");
    }

    #[test]
    fn prepend_or_insert_prepends_into_existing_system_message() {
        let mut messages = vec![ChatMessage::system("original"), ChatMessage::user("hi")];
        prepend_or_insert_system_message(&mut messages, "temporal+template");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "temporal+template\noriginal");
    }

    #[test]
    fn inject_enrichment_block_inserts_before_last_user_message_when_no_system() {
        let mut messages = vec![ChatMessage::user("earlier"), ChatMessage::user("latest")];
        inject_enrichment_block(&mut messages, "context block");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::System);
        assert_eq!(messages[1].content, "context block");
        assert_eq!(messages[2].content, "latest");
    }

    #[test]
    fn inject_enrichment_block_appends_to_existing_system_message() {
        let mut messages = vec![ChatMessage::system("original"), ChatMessage::user("hi")];
        inject_enrichment_block(&mut messages, "context block");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "original\n\ncontext block");
    }
}
