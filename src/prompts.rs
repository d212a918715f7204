//! Prompt registry (C3): every natural-language template the gateway injects into
//! outbound requests, loaded once at startup from configured file paths with a
//! hardcoded fallback so the service degrades gracefully instead of failing to start.
//!
//! Grounded on `original_source/src/config.py`'s `load_prompt_file` and its fallback
//! strings. Unlike the original, a missing file logs a `warn`, not an `error`
//! (`spec.md` §4.3 is explicit about this).

use std::path::Path;

use crate::config::PromptPaths;

pub struct PromptRegistry {
    pub primary_system: String,
    pub routing_system: String,
    pub routing_request: String,
    pub routing_truncation_note: String,
    pub enrichment_system: String,
    pub enrichment_injection: String,
    pub meta_system: String,
    pub xai_system: String,
}

impl PromptRegistry {
    pub fn load(paths: &PromptPaths) -> Self {
        Self {
            primary_system: load_file(
                &paths.primary_system,
                "Use this as background context only — do not repeat or display it in your response.",
                "primary system prompt",
            ),
            routing_system: load_file(
                &paths.routing_system,
                "You are a query classifier. Respond with ONLY ONE WORD: SIMPLE, MODERATE, or COMPLEX.",
                "routing system prompt",
            ),
            routing_request: load_file(
                &paths.routing_request,
                "Classify this query as SIMPLE, MODERATE, COMPLEX, or ENRICH.\n\
                 User query: \"{query}\"\n\
                 {truncation_note}\n\
                 Respond with ONLY ONE WORD: SIMPLE, MODERATE, COMPLEX, or ENRICH",
                "routing prompt",
            ),
            routing_truncation_note: load_file(
                &paths.routing_truncation_note,
                "Note: The above query was truncated. Classify based on what you can see.",
                "routing truncation note",
            ),
            enrichment_system: load_file(
                &paths.enrichment_system,
                "You are a real-time information retrieval assistant. Provide concise, \
                 factual, current information relevant to the user's query. Do not answer \
                 the question directly — your output will be used as context for another model.",
                "enrichment system prompt",
            ),
            enrichment_injection: load_file(
                &paths.enrichment_injection,
                "The following is supplementary real-time context retrieved from an \
                 external source:\n\n---\n{context}\n---",
                "enrichment injection prompt",
            ),
            meta_system: load_file(
                &paths.meta_system,
                "You are processing a structured task about a prior conversation. Follow \
                 the task instructions exactly. Be concise.",
                "meta system prompt",
            ),
            xai_system: load_file(
                &paths.xai_system,
                "Be direct and concise. Lead with the answer, then provide supporting \
                 detail only if it adds clear value.",
                "xai system prompt",
            ),
        }
    }

    /// The template to prepend temporal context to for a given route, per the
    /// routing table in `SPEC_FULL.md` §3.2 (`enrich` reuses `primary`, `meta` gets
    /// its own template).
    pub fn system_template(&self, route: crate::model::Route) -> &str {
        use crate::model::Route;
        match route {
            Route::Primary | Route::Enrich => &self.primary_system,
            Route::Xai => &self.xai_system,
            Route::Meta => &self.meta_system,
        }
    }
}

fn load_file(path: &Path, fallback: &str, label: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim().to_string();
            tracing::info!(path = %path.display(), label, "loaded prompt from file");
            trimmed
        }
        Err(_) => {
            tracing::warn!(path = %path.display(), label, "prompt file not found, using fallback");
            fallback.to_string()
        }
    }
}
