//! Dispatch engine (C7): the core request lifecycle. Builds a session trace,
//! decides a route (short-circuiting to `meta` where applicable), races
//! classification against a speculative primary call, and resolves the race into a
//! single response.
//!
//! Grounded on `original_source/src/app.py`'s `/v1/chat/completions` handler for the
//! overall shape (classify, speculate, adopt-or-fallback, log) and on
//! `router.rs` for how a dispatch engine built on this backend stack structures that
//! flow in Rust (a single entry point delegating to per-route handlers, each
//! producing a uniform outcome type the API layer turns into an HTTP response).

use std::time::Instant;

use bytes::Bytes;
use reqwest::StatusCode;

use crate::backends::{BackendCallError, SseStream, Target};
use crate::classifier;
use crate::enricher;
use crate::error::GatewayError;
use crate::model::{ChatRequest, Route};
use crate::session::Session;
use crate::state::AppState;
use crate::temporal::temporal_context;

/// The resolved outcome of a dispatched request, uniform across every route and
/// both streaming and buffered responses. The `api` layer turns this into the
/// actual axum [`axum::response::Response`].
pub enum DispatchOutcome {
    Buffered { status: StatusCode, content_type: String, body: Bytes },
    Streamed { status: StatusCode, stream: SseStream },
}

/// Per-route latency thresholds (milliseconds) past which a completed request logs
/// a `SLOW_REQUEST` warning in addition to its normal summary line.
fn slow_threshold_ms(route: Route) -> u64 {
    match route {
        Route::Primary | Route::Meta => 5_000,
        Route::Xai => 30_000,
        Route::Enrich => 60_000,
    }
}

pub async fn handle_chat(
    state: &AppState,
    mut request: ChatRequest,
    requested_route: Option<Route>,
) -> Result<DispatchOutcome, GatewayError> {
    if requested_route == Some(Route::Meta) {
        return Err(GatewayError::BadRequest(
            "route \"meta\" cannot be requested explicitly — it is only reachable via the meta fast path".into(),
        ));
    }

    let mut session = Session::new(&state.config.timezone);
    session.set_query(&request.messages);
    let temporal = temporal_context(&state.config.timezone);

    let outcome = if let Some(route) = requested_route {
        session.set_route(route, "explicit", 0);
        run_route(state, route, request, &temporal, &mut session).await
    } else if classifier::is_meta_fast_path(&request.messages) {
        session.set_route(Route::Meta, "meta_fast_path", 0);
        truncate_meta_message(&mut request, state.config.classification_context_budget);
        run_route(state, Route::Meta, request, &temporal, &mut session).await
    } else {
        run_with_speculation(state, request, &temporal, &mut session).await
    };

    let route = session.route().unwrap_or(Route::Primary);
    let classification_ms = session.classification_ms().unwrap_or(0);
    let inference_ms: u64 = session
        .steps()
        .iter()
        .filter(|s| s.step == crate::session::StepKind::ProviderCall)
        .filter_map(|s| s.duration_ms)
        .sum();
    let enrichment_ms =
        session.steps().iter().find(|s| s.step == crate::session::StepKind::Enrichment).and_then(|s| s.duration_ms);
    let total_ms = session.elapsed_ms();
    log_summary(session.id(), route, classification_ms, inference_ms, enrichment_ms, total_ms);

    if let Err(e) = &outcome {
        session.set_error(e.to_string());
    }
    session.finish(&state.sessions).await;

    outcome
}

/// Races classification against a speculative primary completion (`tokio::join!`
/// fires both at once). If classification lands on `primary`, the speculative call
/// is almost certainly already the right answer and is adopted directly; any other
/// route discards it and makes its own call.
async fn run_with_speculation(
    state: &AppState,
    request: ChatRequest,
    temporal: &str,
    session: &mut Session,
) -> Result<DispatchOutcome, GatewayError> {
    let spec_request = request.clone();
    let spec_start = Instant::now();

    let (route, spec_result) = tokio::join!(
        classifier::classify(&request, &state.config, &state.prompts, &state.backend, session),
        state.backend.speculative_primary(spec_request, &state.prompts, temporal)
    );

    match route {
        Route::Primary => adopt_speculative(spec_result, spec_start, session),
        Route::Xai => run_route(state, Route::Xai, request, temporal, session).await,
        Route::Enrich => run_route(state, Route::Enrich, request, temporal, session).await,
        Route::Meta => unreachable!("classifier never returns meta — it is a fast-path-only route"),
    }
}

/// Logs the speculative primary call as the winning provider_call step (backdated
/// to when it actually started, since it ran concurrently with classification) and
/// turns it into a [`DispatchOutcome`]. Falls back to a fresh primary call if the
/// speculative call itself failed at the transport level.
fn adopt_speculative(
    spec_result: Result<crate::backends::SpeculativeResponse, BackendCallError>,
    spec_start: Instant,
    session: &mut Session,
) -> Result<DispatchOutcome, GatewayError> {
    use crate::backends::{extract_chat_fields, SpeculativeResponse};
    use crate::session::StepKind;

    session.begin_step(StepKind::ProviderCall, "primary", "[speculative]", "", None, None);
    session.backdate_current_step(spec_start);

    match spec_result {
        Ok(SpeculativeResponse::Buffered(reply)) => {
            let (text, finish_reason) =
                extract_chat_fields(&reply.body).unwrap_or_else(|| (String::from_utf8_lossy(&reply.body).into_owned(), None));
            session.end_step(Some(reply.status.as_u16()), Some(&text), finish_reason.as_deref(), None);
            Ok(DispatchOutcome::Buffered { status: reply.status, content_type: reply.content_type, body: reply.body })
        }
        Ok(SpeculativeResponse::Streamed(status, stream)) => {
            session.end_step(Some(status.as_u16()), Some("[streamed]"), None, None);
            Ok(DispatchOutcome::Streamed { status, stream })
        }
        Err(e) => {
            session.end_step(None, None, None, Some(&e.marker()));
            Err(e.into())
        }
    }
}

/// Executes a single resolved route: `xai` and `meta` forward as-is, `enrich`
/// fetches supplementary context first and injects it before forwarding.
async fn run_route(
    state: &AppState,
    route: Route,
    mut request: ChatRequest,
    temporal: &str,
    session: &mut Session,
) -> Result<DispatchOutcome, GatewayError> {
    let target = match route {
        Route::Primary | Route::Meta | Route::Enrich => Target::LocalReasoning,
        Route::Xai => Target::Cloud,
    };

    if route == Route::Enrich {
        if let Some(context) =
            enricher::fetch_context(&request, temporal, &state.config, &state.prompts, &state.backend, session).await
        {
            let injection = enricher::render_injection(&state.prompts, &context, temporal);
            crate::backends::inject_enrichment_block(&mut request.messages, &injection);
        }
    }

    let outcome = state.backend.forward(target, route, request, &state.prompts, temporal, session).await?;
    Ok(outcome)
}

/// Truncates the meta fast-path message in place if it exceeds `budget`, per the
/// suffix-keeping algorithm in [`classifier::truncate_meta_history`]. The meta
/// fast path guarantees exactly one message, so there is nothing to iterate over.
fn truncate_meta_message(request: &mut ChatRequest, budget: usize) {
    if let Some(message) = request.messages.first_mut() {
        let (truncated, changed) = classifier::truncate_meta_history(&message.content, budget);
        if changed {
            message.content = truncated;
        }
    }
}

fn log_summary(
    session_id: &str,
    route: Route,
    classification_ms: u64,
    inference_ms: u64,
    enrichment_ms: Option<u64>,
    total_ms: u64,
) {
    match enrichment_ms {
        Some(enrichment_ms) => tracing::info!(
            session_id,
            route = %route,
            classification_ms,
            inference_ms,
            enrichment_ms,
            total_ms,
            "request completed"
        ),
        None => tracing::info!(
            session_id,
            route = %route,
            classification_ms,
            inference_ms,
            total_ms,
            "request completed"
        ),
    }

    let threshold = slow_threshold_ms(route);
    if total_ms > threshold {
        tracing::warn!(session_id, route = %route, total_ms, threshold, "SLOW_REQUEST");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slow_threshold_matches_route_table() {
        assert_eq!(slow_threshold_ms(Route::Primary), 5_000);
        assert_eq!(slow_threshold_ms(Route::Meta), 5_000);
        assert_eq!(slow_threshold_ms(Route::Xai), 30_000);
        assert_eq!(slow_threshold_ms(Route::Enrich), 60_000);
    }

    #[test]
    fn truncate_meta_message_rewrites_the_single_message_in_place() {
        use crate::model::ChatMessage;

        let long = format!("{}\n{}", "a".repeat(20), "b".repeat(20));
        let mut request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user(long)],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            extra: Default::default(),
        };

        truncate_meta_message(&mut request, 20);
        assert_eq!(request.messages[0].content, "b".repeat(20));
    }

    #[test]
    fn truncate_meta_message_leaves_short_message_untouched() {
        use crate::model::ChatMessage;

        let mut request = ChatRequest {
            model: "m".into(),
            messages: vec![ChatMessage::user("short")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: false,
            extra: Default::default(),
        };

        truncate_meta_message(&mut request, 1000);
        assert_eq!(request.messages[0].content, "short");
    }
}
