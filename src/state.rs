//! Shared application state, built once at startup and handed to every handler via
//! axum's `State` extractor.
//!
//! Grounded on `main.rs` (which assembles an equivalent `RouterState`
//! once before binding the listener).

use std::sync::Arc;

use crate::backends::BackendClient;
use crate::config::Config;
use crate::prompts::PromptRegistry;
use crate::session::SessionSink;

pub struct AppState {
    pub config: Config,
    pub prompts: PromptRegistry,
    pub backend: BackendClient,
    pub sessions: SessionSink,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let prompts = PromptRegistry::load(&config.prompts);
        let backend = BackendClient::new(&config)?;
        let sessions = SessionSink::new(config.log_dir.join("sessions"), config.sessions_max_age_days, config.sessions_max_count)?;
        Ok(Arc::new(Self { config, prompts, backend, sessions }))
    }
}
