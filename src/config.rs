//! Environment-variable-driven configuration.
//!
//! Every env var name and default below mirrors `original_source/src/config.py`.
//! In style, follows the validated-struct-built-once-at-startup pattern (a `mod
//! defaults` module for the default-value functions) used elsewhere in this
//! codebase for config structs backed by a file format — but there is no config
//! file to parse or hot-reload here: this gateway's whole configuration surface is
//! backend URLs, model ids, prompt file paths, and a handful of tunables, all read
//! from the environment once at startup.

use std::path::PathBuf;

use anyhow::Context;
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct CloudTarget {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PromptPaths {
    pub primary_system: PathBuf,
    pub routing_system: PathBuf,
    pub routing_request: PathBuf,
    pub routing_truncation_note: PathBuf,
    pub enrichment_system: PathBuf,
    pub enrichment_injection: PathBuf,
    pub meta_system: PathBuf,
    pub xai_system: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub local_fast: BackendTarget,
    pub local_reasoning: BackendTarget,
    pub cloud: CloudTarget,
    pub virtual_model: String,
    pub search_tools: Vec<String>,
    pub classification_context_budget: usize,
    pub classifier_max_tokens: u64,
    pub cloud_max_tokens_floor: u64,
    pub timezone: Tz,
    pub log_dir: PathBuf,
    pub sessions_max_age_days: u64,
    pub sessions_max_count: usize,
    pub prompts: PromptPaths,
    pub port: u16,
}

/// Fixed per `spec.md`'s "Exit codes and CLI" section — this gateway has exactly one
/// bound port and no other CLI surface.
pub const PORT: u16 = 8002;

mod defaults {
    pub const LOCAL_FAST_URL: &str = "http://router:8001";
    pub const LOCAL_REASONING_URL: &str = "http://primary:8000";
    pub const CLOUD_URL: &str = "https://api.x.ai";
    pub const LOCAL_FAST_MODEL: &str = "cyankiwi/Nemotron-Orchestrator-8B-AWQ-4bit";
    pub const LOCAL_REASONING_MODEL: &str = "unsloth/NVIDIA-Nemotron-3-Nano-30B-A3B-NVFP4";
    pub const CLOUD_MODEL: &str = "grok-4-1-fast-reasoning";
    pub const VIRTUAL_MODEL: &str = "ai-router";
    pub const SEARCH_TOOLS: &str = "web_search,x_search";
    pub const CLASSIFICATION_CONTEXT_BUDGET: usize = 112_000;
    pub const CLASSIFIER_MAX_TOKENS: u64 = 1024;
    pub const CLOUD_MAX_TOKENS_FLOOR: u64 = 16_384;
    pub const TIMEZONE: &str = "America/Los_Angeles";
    pub const LOG_DIR: &str = "/var/log/ai-router";
    pub const SESSIONS_MAX_AGE_DAYS: u64 = 7;
    pub const SESSIONS_MAX_COUNT: usize = 5000;

    pub const ROUTING_PROMPT_PATH: &str = "/app/config/prompts/routing/request.md";
    pub const ROUTING_TRUNCATION_NOTE_PATH: &str = "/app/config/prompts/routing/truncation_note.md";
    pub const ROUTING_SYSTEM_PROMPT_PATH: &str = "/app/config/prompts/routing/system.md";
    pub const PRIMARY_SYSTEM_PROMPT_PATH: &str = "/app/config/prompts/primary/system.md";
    pub const ENRICHMENT_SYSTEM_PROMPT_PATH: &str = "/app/config/prompts/enrichment/system.md";
    pub const ENRICHMENT_INJECTION_PROMPT_PATH: &str = "/app/config/prompts/enrichment/injection.md";
    pub const META_SYSTEM_PROMPT_PATH: &str = "/app/config/prompts/meta/system.md";
    pub const XAI_SYSTEM_PROMPT_PATH: &str = "/app/config/prompts/xai/system.md";
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let cloud_base_url = env_or("XAI_API_URL", defaults::CLOUD_URL);
        let cloud_api_key = read_secret("XAI_API_KEY", "");

        let config = Config {
            local_fast: BackendTarget {
                base_url: env_or("ROUTER_URL", defaults::LOCAL_FAST_URL),
                model: env_or("ROUTER_MODEL", defaults::LOCAL_FAST_MODEL),
            },
            local_reasoning: BackendTarget {
                base_url: env_or("PRIMARY_URL", defaults::LOCAL_REASONING_URL),
                model: env_or("PRIMARY_MODEL", defaults::LOCAL_REASONING_MODEL),
            },
            cloud: CloudTarget {
                base_url: cloud_base_url,
                model: env_or("XAI_MODEL", defaults::CLOUD_MODEL),
                api_key: if cloud_api_key.is_empty() { None } else { Some(cloud_api_key) },
            },
            virtual_model: env_or("VIRTUAL_MODEL", defaults::VIRTUAL_MODEL),
            search_tools: parse_search_tools(&env_or("XAI_SEARCH_TOOLS", defaults::SEARCH_TOOLS)),
            classification_context_budget: env_parse_or(
                "CLASSIFICATION_CONTEXT_BUDGET",
                defaults::CLASSIFICATION_CONTEXT_BUDGET,
            ),
            classifier_max_tokens: env_parse_or("CLASSIFIER_MAX_TOKENS", defaults::CLASSIFIER_MAX_TOKENS),
            cloud_max_tokens_floor: env_parse_or("XAI_MIN_MAX_TOKENS", defaults::CLOUD_MAX_TOKENS_FLOOR),
            timezone: env_or("TZ", defaults::TIMEZONE)
                .parse()
                .context("invalid TZ — expected an IANA timezone name such as America/Los_Angeles")?,
            log_dir: PathBuf::from(env_or("LOG_DIR", defaults::LOG_DIR)),
            sessions_max_age_days: env_parse_or("LOG_MAX_AGE_DAYS", defaults::SESSIONS_MAX_AGE_DAYS),
            sessions_max_count: env_parse_or("LOG_MAX_COUNT", defaults::SESSIONS_MAX_COUNT),
            prompts: PromptPaths {
                primary_system: PathBuf::from(env_or("PRIMARY_SYSTEM_PROMPT_PATH", defaults::PRIMARY_SYSTEM_PROMPT_PATH)),
                routing_system: PathBuf::from(env_or("ROUTING_SYSTEM_PROMPT_PATH", defaults::ROUTING_SYSTEM_PROMPT_PATH)),
                routing_request: PathBuf::from(env_or("ROUTING_PROMPT_PATH", defaults::ROUTING_PROMPT_PATH)),
                routing_truncation_note: PathBuf::from(env_or(
                    "ROUTING_TRUNCATION_NOTE_PATH",
                    defaults::ROUTING_TRUNCATION_NOTE_PATH,
                )),
                enrichment_system: PathBuf::from(env_or(
                    "ENRICHMENT_SYSTEM_PROMPT_PATH",
                    defaults::ENRICHMENT_SYSTEM_PROMPT_PATH,
                )),
                enrichment_injection: PathBuf::from(env_or(
                    "ENRICHMENT_INJECTION_PROMPT_PATH",
                    defaults::ENRICHMENT_INJECTION_PROMPT_PATH,
                )),
                meta_system: PathBuf::from(env_or("META_SYSTEM_PROMPT_PATH", defaults::META_SYSTEM_PROMPT_PATH)),
                xai_system: PathBuf::from(env_or("XAI_SYSTEM_PROMPT_PATH", defaults::XAI_SYSTEM_PROMPT_PATH)),
            },
            port: PORT,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.local_fast.base_url.is_empty(), "ROUTER_URL must not be empty");
        anyhow::ensure!(!self.local_reasoning.base_url.is_empty(), "PRIMARY_URL must not be empty");
        anyhow::ensure!(!self.cloud.base_url.is_empty(), "XAI_API_URL must not be empty");
        if self.cloud.api_key.is_none() {
            tracing::warn!("XAI_API_KEY not set — xai and enrich routes will fail at request time");
        }
        Ok(())
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_search_tools(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// Reads a secret from a Docker secret file (`/run/secrets/<name lowercased>`),
/// falling back to the environment variable of the same name. Docker secrets keep
/// sensitive values out of `docker inspect`'s env listing; the env fallback keeps
/// local development (outside Docker) working transparently.
///
/// Grounded on `original_source/src/config.py::read_secret`.
pub fn read_secret(name: &str, default: &str) -> String {
    let secret_path = format!("/run/secrets/{}", name.to_lowercase());
    if let Ok(contents) = std::fs::read_to_string(&secret_path) {
        let value = contents.trim();
        if !value.is_empty() {
            tracing::info!(path = %secret_path, name, "loaded secret from file");
            return value.to_string();
        }
    }
    env_or(name, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_search_tools_splits_and_trims() {
        assert_eq!(parse_search_tools("web_search, x_search"), vec!["web_search", "x_search"]);
        assert_eq!(parse_search_tools(""), Vec::<String>::new());
        assert_eq!(parse_search_tools("web_search"), vec!["web_search"]);
    }

    #[test]
    fn env_parse_or_falls_back_on_missing_or_unparseable() {
        std::env::remove_var("AI_ROUTER_TEST_UNSET_VALUE");
        let v: u64 = env_parse_or("AI_ROUTER_TEST_UNSET_VALUE", 42);
        assert_eq!(v, 42);
    }

    #[test]
    fn read_secret_falls_back_to_env_when_file_absent() {
        std::env::set_var("AI_ROUTER_TEST_SECRET", "from-env");
        assert_eq!(read_secret("AI_ROUTER_TEST_SECRET", ""), "from-env");
        std::env::remove_var("AI_ROUTER_TEST_SECRET");
    }
}
