//! Real-time context enrichment (C6): a `/v1/responses` round trip against the
//! cloud backend with web/X search tools enabled, used to ground the `enrich`
//! route in current information before the primary model answers.
//!
//! Grounded on `original_source/src/app.py`'s enrichment fetch (the `/v1/responses`
//! request shape and the `output[].content[].output_text.text` walk used to pull
//! plain text back out of it) and on `backends/openai.rs` for the
//! request/response plumbing style.

use serde_json::Value;

use crate::backends::BackendClient;
use crate::config::Config;
use crate::model::{ChatMessage, Role};
use crate::prompts::PromptRegistry;
use crate::session::{Session, StepKind};

/// Fetches supplementary context for the user's query. Degrades gracefully: a
/// transport failure or an unparseable response logs a warning and returns `None`
/// rather than failing the whole request — an un-enriched answer beats no answer.
pub async fn fetch_context(
    request: &crate::model::ChatRequest,
    temporal: &str,
    cfg: &Config,
    prompts: &PromptRegistry,
    backend: &BackendClient,
    session: &mut Session,
) -> Option<String> {
    if !request.messages.iter().any(|m| m.role == Role::User) {
        return None;
    }

    let input = build_input(temporal, &prompts.enrichment_system, &request.messages);
    let tools = build_tools(&cfg.search_tools);
    let body = serde_json::json!({
        "model": cfg.cloud.model,
        "input": input,
        "max_output_tokens": 1024,
        "temperature": 0,
        "tools": tools,
    });

    let url = format!("{}/v1/responses", cfg.cloud.base_url);
    session.begin_step(StepKind::Enrichment, "xai", url, cfg.cloud.model.as_str(), None, None);

    match backend.call_enrichment(&body).await {
        Ok(reply) => {
            let text = extract_responses_text(&reply.body);
            match &text {
                Some(t) => session.end_step(Some(reply.status.as_u16()), Some(t), None, None),
                None => session.end_step(Some(reply.status.as_u16()), None, None, Some("unparseable response")),
            }
            text
        }
        Err(e) => {
            tracing::warn!(session_id = session.id(), error = %e, "enrichment call failed, continuing without it");
            session.end_step(None, None, None, Some(&e.marker()));
            None
        }
    }
}

fn build_input(temporal: &str, system_prompt: &str, messages: &[ChatMessage]) -> Value {
    let mut input = vec![serde_json::json!({"role": "system", "content": format!("{temporal}\n\n{system_prompt}")})];
    input.extend(
        messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content})),
    );
    Value::Array(input)
}

fn build_tools(search_tools: &[String]) -> Vec<Value> {
    search_tools.iter().map(|name| serde_json::json!({"type": name})).collect()
}

/// Walks a `/v1/responses` body's `output[].content[].output_text.text` blocks and
/// joins them — the response shape nests plain-text output under a tool-call-shaped
/// envelope even when no tool call happened.
fn extract_responses_text(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let output = value.get("output")?.as_array()?;

    let mut chunks = Vec::new();
    for item in output {
        let Some(content) = item.get("content").and_then(Value::as_array) else { continue };
        for block in content {
            if let Some(text) = block.get("output_text").and_then(|t| t.get("text")).and_then(Value::as_str) {
                chunks.push(text.to_string());
            } else if let Some(text) = block.get("text").and_then(Value::as_str) {
                chunks.push(text.to_string());
            }
        }
    }

    if chunks.is_empty() {
        None
    } else {
        Some(chunks.join("\n"))
    }
}

/// Builds the system-message injection block carrying the fetched context, per the
/// enrichment prompt template's `{context}` and `{date}` placeholders.
pub fn render_injection(prompts: &PromptRegistry, context: &str, temporal: &str) -> String {
    prompts.enrichment_injection.replace("{context}", context).replace("{date}", temporal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_responses_text_walks_output_text_blocks() {
        let body = serde_json::to_vec(&serde_json::json!({
            "output": [
                {"content": [{"output_text": {"text": "first"}}]},
                {"content": [{"output_text": {"text": "second"}}]},
            ]
        }))
        .unwrap();
        assert_eq!(extract_responses_text(&body).unwrap(), "first\nsecond");
    }

    #[test]
    fn extract_responses_text_falls_back_to_plain_text_blocks() {
        let body = serde_json::to_vec(&serde_json::json!({
            "output": [{"content": [{"text": "plain"}]}]
        }))
        .unwrap();
        assert_eq!(extract_responses_text(&body).unwrap(), "plain");
    }

    #[test]
    fn extract_responses_text_returns_none_when_no_text_blocks_present() {
        let body = serde_json::to_vec(&serde_json::json!({"output": []})).unwrap();
        assert!(extract_responses_text(&body).is_none());
    }

    #[test]
    fn build_tools_maps_names_to_type_objects() {
        let tools = build_tools(&["web_search".to_string(), "x_search".to_string()]);
        assert_eq!(tools, vec![serde_json::json!({"type": "web_search"}), serde_json::json!({"type": "x_search"})]);
    }

    #[test]
    fn render_injection_substitutes_context_and_date_placeholders() {
        let prompts = test_registry("before {context} on {date} after");
        assert_eq!(render_injection(&prompts, "ctx text", "July 28"), "before ctx text on July 28 after");
    }

    #[test]
    fn build_input_keeps_user_and_assistant_turns_in_order_and_drops_system() {
        let messages = vec![
            ChatMessage::system("ignored"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("second"),
        ];
        let input = build_input("Today is Tuesday.", "be helpful", &messages);
        let roles: Vec<&str> = input.as_array().unwrap().iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert!(input[0]["content"].as_str().unwrap().starts_with("Today is Tuesday.\n\nbe helpful"));
        assert_eq!(input[3]["content"], "second");
    }

    fn test_registry(enrichment_injection: &str) -> PromptRegistry {
        PromptRegistry {
            primary_system: String::new(),
            routing_system: String::new(),
            routing_request: String::new(),
            routing_truncation_note: String::new(),
            enrichment_system: String::new(),
            enrichment_injection: enrichment_injection.to_string(),
            meta_system: String::new(),
            xai_system: String::new(),
        }
    }
}
