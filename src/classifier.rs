//! Query classification (C5): decides which route a request should take before
//! the dispatch engine races it against a speculative primary call.
//!
//! Grounded on `original_source/src/app.py`'s routing logic (the `<think>` stripping,
//! the SIMPLE/MODERATE/COMPLEX/ENRICH vocabulary, and the meta-prompt short circuit)
//! and on `router.rs` for the overall "classify, then act on the
//! decision" shape.

use serde_json::Value;

use crate::backends::BackendClient;
use crate::config::Config;
use crate::model::{ChatMessage, ChatRequest, Role, Route};
use crate::prompts::PromptRegistry;
use crate::session::{Session, StepKind};
use crate::temporal::temporal_context;

/// A single user message this long or longer, containing one of these markers, is
/// almost certainly a structured meta-prompt (an orchestration harness asking the
/// model to process a prior transcript) rather than a fresh question — route it
/// straight to `meta` without spending a classification round trip on it.
const META_MIN_LEN: usize = 300;
const META_MARKERS: &[&str] = &["USER:", "ASSISTANT:", "<chat_history>", "### Task:", "### Guidelines:"];

pub fn is_meta_fast_path(messages: &[ChatMessage]) -> bool {
    let [only] = messages else { return false };
    only.role == Role::User && only.content.len() > META_MIN_LEN && META_MARKERS.iter().any(|m| only.content.contains(m))
}

/// Strips `<think>...</think>` reasoning blocks a classifier model may emit before
/// its one-word decision. Handles both a properly closed block and one left
/// unclosed because the model was cut off mid-thought — in that case everything
/// from the opening tag onward is discarded, since there's no decision left in it
/// worth keeping.
pub fn strip_think_blocks(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        match rest.find("<think>") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(open) => {
                out.push_str(&rest[..open]);
                let after_open = &rest[open + "<think>".len()..];
                match after_open.find("</think>") {
                    Some(close) => rest = &after_open[close + "</think>".len()..],
                    None => break,
                }
            }
        }
    }
    out.trim().to_string()
}

/// Maps a (post-think-stripping) raw classifier decision onto a route. Returns
/// whether the text was actually recognized so the caller can log a warning for an
/// unparseable decision instead of silently defaulting.
pub fn parse_decision(stripped: &str) -> (Route, bool) {
    let upper = stripped.to_uppercase();
    if upper.contains("ENRICH") {
        (Route::Enrich, true)
    } else if upper.contains("COMPLEX") {
        (Route::Xai, true)
    } else if upper.contains("MODERATE") || upper.contains("SIMPLE") {
        (Route::Primary, true)
    } else {
        (Route::Primary, false)
    }
}

/// Truncates an over-long meta fast-path message by keeping its *suffix*, not its
/// prefix — the most recent turns of an embedded chat history matter more than the
/// oldest ones. If the message carries a `<chat_history>...</chat_history>` block
/// that alone exceeds `budget`, keeps only the tail of that block (snapped forward
/// to the next line break so the kept text starts at a clean line boundary) and
/// re-closes the tag around it; everything before and after the block is left
/// alone. Absent such a block, keeps the last `budget` characters of the whole
/// message.
pub fn truncate_meta_history(content: &str, budget: usize) -> (String, bool) {
    if content.chars().count() <= budget {
        return (content.to_string(), false);
    }

    if let (Some(open), Some(close)) = (content.find("<chat_history>"), content.find("</chat_history>")) {
        let history_start = open + "<chat_history>".len();
        if close > history_start {
            let before = &content[..history_start];
            let history = &content[history_start..close];
            let after = &content[close + "</chat_history>".len()..];

            if history.chars().count() > budget {
                let drop = history.chars().count() - budget;
                let boundary = history.char_indices().nth(drop).map(|(i, _)| i).unwrap_or(history.len());
                let snapped = match history[boundary..].find('\n') {
                    Some(offset) => boundary + offset + 1,
                    None => boundary,
                };
                let kept = &history[snapped..];
                return (format!("{before}{kept}</chat_history>{after}"), true);
            }
            return (content.to_string(), false);
        }
    }

    let total = content.chars().count();
    let drop = total - budget;
    let boundary = content.char_indices().nth(drop).map(|(i, _)| i).unwrap_or(0);
    (content[boundary..].to_string(), true)
}

/// Builds a short transcript of the conversation so far (everything except the
/// final user turn, which is classified directly) for the classifier's context.
/// Strips `<details>...</details>` blocks — collapsed reasoning traces from earlier
/// assistant turns — since they bloat the context budget without informing intent.
pub fn build_context_prefix(messages: &[ChatMessage]) -> String {
    let history_end = messages.iter().rposition(|m| m.role == Role::User).unwrap_or(messages.len());
    messages[..history_end]
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .map(|m| {
            let label = if m.role == Role::User { "User" } else { "Assistant" };
            format!("{label}: {}", strip_details_blocks(&m.content))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_details_blocks(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    loop {
        match rest.find("<details>") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(open) => {
                out.push_str(&rest[..open]);
                let after_open = &rest[open..];
                match after_open.find("</details>") {
                    Some(close) => rest = &after_open[close + "</details>".len()..],
                    None => {
                        rest = "";
                        break;
                    }
                }
            }
        }
    }
    out.trim().to_string()
}

/// Runs the classification round trip and records it on the session trace. Falls
/// back to [`Route::Primary`] — with a warning — on both an unrecognized decision
/// text and an outright transport failure, since a stuck classifier should degrade
/// the routing decision, not the whole request.
pub async fn classify(
    request: &ChatRequest,
    cfg: &Config,
    prompts: &PromptRegistry,
    backend: &BackendClient,
    session: &mut Session,
) -> Route {
    let Some(last_user) = request.messages.iter().rev().find(|m| m.role == Role::User) else {
        return Route::Primary;
    };

    // The classifier path never truncates the query it classifies (only the meta
    // fast-path history is truncated, and meta bypasses classification entirely),
    // so `{truncation_note}` always renders empty here.
    let context_prefix = build_context_prefix(&request.messages);

    let user_prompt = prompts.routing_request.replace("{query}", &last_user.content).replace("{truncation_note}", "");
    let user_prompt =
        if context_prefix.is_empty() { user_prompt } else { format!("{context_prefix}\n\n{user_prompt}") };

    let temporal = temporal_context(&cfg.timezone);
    let system_prompt = format!("{temporal}\n\n{}", prompts.routing_system);

    let body = serde_json::json!({
        "model": cfg.local_fast.model,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user_prompt},
        ],
        "max_tokens": cfg.classifier_max_tokens,
        "temperature": 0,
        "stream": false,
    });

    let (base_url, model) = backend.endpoint(crate::backends::Target::LocalFast);
    let url = format!("{base_url}/v1/chat/completions");
    session.begin_step(StepKind::Classification, "local-fast", url, model, None, None);

    let start = std::time::Instant::now();
    let outcome = backend.call_classifier(&body).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (route, raw_decision) = match outcome {
        Ok(reply) => {
            let raw = extract_decision_text(&reply.body).unwrap_or_default();
            let stripped = strip_think_blocks(&raw);
            let (route, recognized) = parse_decision(&stripped);
            if !recognized {
                tracing::warn!(session_id = session.id(), decision = %stripped, "unrecognized classifier decision, defaulting to primary");
            }
            session.end_step(Some(reply.status.as_u16()), Some(&stripped), None, None);
            (route, stripped)
        }
        Err(e) => {
            tracing::warn!(session_id = session.id(), error = %e, "classification call failed, defaulting to primary");
            session.end_step(None, None, None, Some(&e.marker()));
            (Route::Primary, format!("error: {e}"))
        }
    };

    session.set_route(route, raw_decision, duration_ms);
    route
}

fn extract_decision_text(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let message = value.get("choices")?.get(0)?.get("message")?;
    message.get("content").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_fast_path_requires_single_long_user_message_with_marker() {
        let long_with_marker = format!("{}\n### Task: do the thing", "x".repeat(310));
        assert!(is_meta_fast_path(&[ChatMessage::user(long_with_marker)]));

        let long_without_marker = "x".repeat(400);
        assert!(!is_meta_fast_path(&[ChatMessage::user(long_without_marker)]));

        let short_with_marker = "### Task: short".to_string();
        assert!(!is_meta_fast_path(&[ChatMessage::user(short_with_marker)]));
    }

    #[test]
    fn meta_fast_path_rejects_multi_message_conversations() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("x".repeat(400))];
        assert!(!is_meta_fast_path(&messages));
    }

    #[test]
    fn strip_think_blocks_removes_closed_block() {
        assert_eq!(strip_think_blocks("<think>reasoning here</think>MODERATE"), "MODERATE");
    }

    #[test]
    fn strip_think_blocks_removes_unclosed_trailing_block() {
        assert_eq!(strip_think_blocks("preamble <think>cut off mid thought"), "preamble");
    }

    #[test]
    fn strip_think_blocks_passes_through_plain_text() {
        assert_eq!(strip_think_blocks("COMPLEX"), "COMPLEX");
    }

    #[test]
    fn parse_decision_priority_is_enrich_then_complex_then_moderate_simple() {
        assert_eq!(parse_decision("ENRICH").0, Route::Enrich);
        assert_eq!(parse_decision("this is COMPLEX work").0, Route::Xai);
        assert_eq!(parse_decision("MODERATE").0, Route::Primary);
        assert_eq!(parse_decision("SIMPLE").0, Route::Primary);
    }

    #[test]
    fn parse_decision_reports_unrecognized_text() {
        let (route, recognized) = parse_decision("uh, I'm not sure");
        assert_eq!(route, Route::Primary);
        assert!(!recognized);
    }

    #[test]
    fn truncate_meta_history_leaves_short_content_untouched() {
        let (text, truncated) = truncate_meta_history("short query", 100);
        assert_eq!(text, "short query");
        assert!(!truncated);
    }

    #[test]
    fn truncate_meta_history_keeps_suffix_of_plain_text_without_tags() {
        let content = format!("{}\n{}", "a".repeat(20), "b".repeat(20));
        let (text, truncated) = truncate_meta_history(&content, 20);
        assert!(truncated);
        assert_eq!(text, "b".repeat(20));
    }

    #[test]
    fn truncate_meta_history_keeps_tail_of_chat_history_block_and_recloses_tag() {
        let history = format!("{}\n{}", "old".repeat(20), "recent".repeat(20));
        let content = format!("before<chat_history>{history}</chat_history>after");
        let (text, truncated) = truncate_meta_history(&content, 30);

        assert!(truncated);
        assert!(text.starts_with("before<chat_history>"));
        assert!(text.ends_with("</chat_history>after"));
        assert!(text.contains("recent"));
        assert!(!text.contains("old"));
    }

    #[test]
    fn truncate_meta_history_snapped_tail_starts_at_a_line_boundary() {
        let history = format!("{}\nsecond\nthird", "x".repeat(50));
        let content = format!("<chat_history>{history}</chat_history>");
        let (text, truncated) = truncate_meta_history(&content, 10);

        assert!(truncated);
        let inner = text.strip_prefix("<chat_history>").unwrap().strip_suffix("</chat_history>").unwrap();
        assert!(history.ends_with(inner));
        assert!(!inner.starts_with('x'));
    }

    #[test]
    fn build_context_prefix_strips_details_blocks_and_excludes_final_turn() {
        let messages = vec![
            ChatMessage::user("earlier question"),
            ChatMessage::assistant("<details>reasoning</details>the answer"),
            ChatMessage::user("final question"),
        ];
        let prefix = build_context_prefix(&messages);
        assert!(prefix.contains("User: earlier question"));
        assert!(prefix.contains("Assistant: the answer"));
        assert!(!prefix.contains("final question"));
        assert!(!prefix.contains("reasoning"));
    }
}
