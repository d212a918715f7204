//! Session trace (C2): one JSON file per request lifecycle, capturing the route
//! decision and every backend call ("step") made while serving it.
//!
//! Grounded on `original_source/src/session_logger.py`. The placeholder-substitution
//! trick that file uses to embed pre-serialized `client_messages` without a second
//! JSON pass isn't needed here — storing the messages as a typed field and letting
//! `serde_json` serialize the whole record in one pass achieves the same effect
//! (`spec.md` §9's design note calls this out explicitly).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{ChatMessage, Role, Route};

const MAX_QUERY_CHARS: usize = 500;
const MAX_RESPONSE_CHARS: usize = 2000;

const CLEANUP_INTERVAL: u64 = 100;
const CLEANUP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Classification,
    ProviderCall,
    Enrichment,
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub step: StepKind,
    pub provider: String,
    pub url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_sent: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub duration_ms: Option<u64>,
    pub status: Option<u16>,
    pub finish_reason: Option<String>,
    pub response_content: Option<String>,
    #[serde(skip)]
    start: Option<Instant>,
}

/// A request's trace, accumulated as it flows through the dispatch engine and
/// written to disk once the response has been produced.
pub struct Session {
    id: String,
    timestamp_local: chrono::DateTime<Tz>,
    start: Instant,
    user_query: Option<String>,
    client_messages: Option<Vec<ChatMessage>>,
    route: Option<Route>,
    classification_raw: Option<String>,
    classification_ms: Option<u64>,
    steps: Vec<Step>,
    error: Option<String>,
}

impl Session {
    pub fn new(tz: &Tz) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            timestamp_local: Utc::now().with_timezone(tz),
            start: Instant::now(),
            user_query: None,
            client_messages: None,
            route: None,
            classification_raw: None,
            classification_ms: None,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route(&self) -> Option<Route> {
        self.route
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn classification_ms(&self) -> Option<u64> {
        self.classification_ms
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Snapshots the original client messages verbatim and records the truncated
    /// last user message for quick inspection.
    pub fn set_query(&mut self, messages: &[ChatMessage]) {
        if let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) {
            self.user_query = Some(truncate_chars(&last_user.content, MAX_QUERY_CHARS));
        }
        self.client_messages = Some(messages.to_vec());
    }

    pub fn set_route(&mut self, route: Route, raw_decision: impl Into<String>, duration_ms: u64) {
        self.route = Some(route);
        self.classification_raw = Some(raw_decision.into());
        self.classification_ms = Some(duration_ms);
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn begin_step(
        &mut self,
        step: StepKind,
        provider: impl Into<String>,
        url: impl Into<String>,
        model: impl Into<String>,
        messages_sent: Option<Value>,
        params: Option<Value>,
    ) {
        self.steps.push(Step {
            step,
            provider: provider.into(),
            url: url.into(),
            model: model.into(),
            messages_sent,
            params,
            duration_ms: None,
            status: None,
            finish_reason: None,
            response_content: None,
            start: Some(Instant::now()),
        });
    }

    /// Retroactively sets the current step's start time — used when a step's real
    /// work began earlier than `begin_step` was called (the speculative-adoption
    /// path logs a step only after the race has already been won).
    pub fn backdate_current_step(&mut self, start: Instant) {
        if let Some(step) = self.steps.last_mut() {
            step.start = Some(start);
        }
    }

    pub fn end_step(
        &mut self,
        status: Option<u16>,
        response_content: Option<&str>,
        finish_reason: Option<&str>,
        error: Option<&str>,
    ) {
        let Some(step) = self.steps.last_mut() else { return };
        if let Some(start) = step.start.take() {
            step.duration_ms = Some(start.elapsed().as_millis() as u64);
        }
        step.status = status;
        step.finish_reason = finish_reason.map(str::to_string);
        step.response_content = match error {
            Some(e) => Some(format!("[error: {e}]")),
            None => response_content.map(|c| truncate_chars(c, MAX_RESPONSE_CHARS)),
        };
    }

    async fn save(self, sink: &SessionSink) -> std::io::Result<()> {
        let total_ms = self.start.elapsed().as_millis() as u64;
        let filename = format!(
            "{}_{}.json",
            self.timestamp_local.format("%Y-%m-%d_%H-%M-%S"),
            self.id
        );

        let record = SessionRecord {
            id: &self.id,
            timestamp: self.timestamp_local.to_rfc3339(),
            user_query: self.user_query.as_deref(),
            client_messages: self.client_messages.as_deref().unwrap_or(&[]),
            route: self.route,
            classification_raw: self.classification_raw.as_deref(),
            classification_ms: self.classification_ms,
            steps: &self.steps,
            total_ms,
            error: self.error.as_deref(),
        };

        let path = sink.dir.join(&filename);
        let body = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&path, body).await?;
        sink.maybe_cleanup().await;
        Ok(())
    }

    pub async fn finish(self, sink: &SessionSink) {
        let id = self.id.clone();
        if let Err(e) = self.save(sink).await {
            tracing::error!(session_id = %id, error = %e, "failed to write session trace");
        }
    }
}

#[derive(Serialize)]
struct SessionRecord<'a> {
    id: &'a str,
    timestamp: String,
    user_query: Option<&'a str>,
    client_messages: &'a [ChatMessage],
    route: Option<Route>,
    classification_raw: Option<&'a str>,
    classification_ms: Option<u64>,
    steps: &'a [Step],
    total_ms: u64,
    error: Option<&'a str>,
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Owns the session directory: writes land here, and housekeeping (age/count
/// bounding) runs on an amortized cadence rather than on every save.
pub struct SessionSink {
    dir: PathBuf,
    max_age: Duration,
    max_count: usize,
    save_count: AtomicU64,
    last_cleanup: Mutex<Instant>,
}

impl SessionSink {
    pub fn new(dir: PathBuf, max_age_days: u64, max_count: usize) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_age: Duration::from_secs(max_age_days * 86_400),
            max_count,
            save_count: AtomicU64::new(0),
            last_cleanup: Mutex::new(Instant::now()),
        })
    }

    async fn maybe_cleanup(&self) {
        let count = self.save_count.fetch_add(1, Ordering::Relaxed) + 1;
        let due_by_count = count >= CLEANUP_INTERVAL;
        let due_by_time = {
            let last = self.last_cleanup.lock().await;
            last.elapsed() > CLEANUP_PERIOD
        };
        if !due_by_count && !due_by_time {
            return;
        }

        self.save_count.store(0, Ordering::Relaxed);
        *self.last_cleanup.lock().await = Instant::now();

        let dir = self.dir.clone();
        let max_age = self.max_age;
        let max_count = self.max_count;
        let result = tokio::task::spawn_blocking(move || cleanup(&dir, max_age, max_count)).await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "session log cleanup task panicked");
        }
    }
}

fn cleanup(dir: &Path, max_age: Duration, max_count: usize) {
    let mut entries: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "session log cleanup: failed to list directory");
            return;
        }
    };
    // Filenames are `YYYY-MM-DD_HH-MM-SS_<id>.json`, so lexicographic order is
    // chronological order.
    entries.sort();

    if entries.len() > max_count {
        let overflow = entries.len() - max_count;
        for path in &entries[..overflow] {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove old session log");
            }
        }
    }

    let cutoff = std::time::SystemTime::now() - max_age;
    for path in &entries {
        let Ok(metadata) = std::fs::metadata(path) else { continue };
        if metadata.modified().map(|m| m < cutoff).unwrap_or(false) {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChatMessage;

    fn tz() -> Tz {
        "America/Los_Angeles".parse().unwrap()
    }

    #[test]
    fn set_query_truncates_long_user_message_and_keeps_full_history() {
        let mut session = Session::new(&tz());
        let long = "x".repeat(600);
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user(long.clone())];
        session.set_query(&messages);
        assert_eq!(session.user_query.as_ref().unwrap().chars().count(), MAX_QUERY_CHARS);
        assert_eq!(session.client_messages.as_ref().unwrap().len(), 2);
        assert_eq!(session.client_messages.as_ref().unwrap()[1].content, long);
    }

    #[test]
    fn end_step_marks_error_and_ignores_response_content() {
        let mut session = Session::new(&tz());
        session.begin_step(StepKind::ProviderCall, "primary", "http://x", "m", None, None);
        session.end_step(None, Some("would be ignored"), None, Some("timeout"));
        assert_eq!(session.steps()[0].response_content.as_deref(), Some("[error: timeout]"));
        assert!(session.steps()[0].duration_ms.is_some());
    }

    #[test]
    fn end_step_truncates_long_response_content() {
        let mut session = Session::new(&tz());
        session.begin_step(StepKind::ProviderCall, "primary", "http://x", "m", None, None);
        let long = "y".repeat(3000);
        session.end_step(Some(200), Some(&long), Some("stop"), None);
        assert_eq!(
            session.steps()[0].response_content.as_ref().unwrap().chars().count(),
            MAX_RESPONSE_CHARS
        );
    }

    #[test]
    fn backdate_current_step_changes_measured_duration() {
        let mut session = Session::new(&tz());
        session.begin_step(StepKind::ProviderCall, "primary", "http://x", "m", None, None);
        let earlier = Instant::now() - Duration::from_millis(500);
        session.backdate_current_step(earlier);
        session.end_step(Some(200), Some("ok"), Some("stop"), None);
        assert!(session.steps()[0].duration_ms.unwrap() >= 500);
    }

    #[tokio::test]
    async fn save_writes_a_json_file_named_after_timestamp_and_id() {
        let dir = std::env::temp_dir().join(format!("ai-router-sessions-{}", Uuid::new_v4()));
        let sink = SessionSink::new(dir.clone(), 7, 5000).unwrap();

        let mut session = Session::new(&tz());
        session.set_query(&[ChatMessage::user("hello")]);
        session.set_route(Route::Primary, "MODERATE", 12);
        session.finish(&sink).await;

        let mut entries: Vec<_> = std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries.remove(0).path()).unwrap();
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["route"], "primary");
        assert_eq!(parsed["user_query"], "hello");
        assert_eq!(parsed["client_messages"][0]["content"], "hello");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn cleanup_removes_oldest_files_beyond_max_count() {
        let dir = std::env::temp_dir().join(format!("ai-router-cleanup-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..5 {
            std::fs::write(dir.join(format!("2026-01-01_00-00-{:02}_aaaaaaaa.json", i)), "{}").unwrap();
        }
        cleanup(&dir, Duration::from_secs(86_400 * 7), 3);
        let remaining: Vec<_> = std::fs::read_dir(&dir).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(remaining.len(), 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
