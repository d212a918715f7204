//! Adapter for the two self-hosted, unauthenticated backends (local-fast and
//! local-reasoning). Both speak the same OpenAI-compatible `/v1/chat/completions`
//! protocol, so one adapter type serves both targets.
//!
//! Grounded on `backends/openai.rs`: a buffered client with a
//! configured timeout plus a separate client with no timeout for SSE streaming
//! (a `reqwest::Client` timeout applies to the whole request including body
//! consumption, which would kill a long-lived stream).

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::{BackendCallError, RawHttpReply, SseStream};

pub struct LocalAdapter {
    base_url: String,
    model: String,
    client: Client,
    stream_client: Client,
}

impl LocalAdapter {
    pub fn new(base_url: String, model: String) -> anyhow::Result<Self> {
        let client = Client::builder().build()?;
        let stream_client = Client::builder().build()?;
        Ok(Self { base_url, model, client, stream_client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat_completions(&self, body: &Value, timeout: Duration) -> Result<RawHttpReply, BackendCallError> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        read_raw(resp).await
    }

    pub async fn chat_completions_stream(&self, body: &Value) -> Result<(StatusCode, SseStream), BackendCallError> {
        let resp = self
            .stream_client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let stream = resp.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
        Ok((status, Box::pin(stream)))
    }

    /// Legacy completions endpoint (`/v1/completions`), used only by the gateway's
    /// own unauthenticated legacy passthrough — no system-prompt injection, no
    /// sampling overrides, just a forwarded `prompt`-shaped body.
    pub async fn completions(&self, body: &Value, timeout: Duration) -> Result<RawHttpReply, BackendCallError> {
        let resp = self.client.post(format!("{}/v1/completions", self.base_url)).timeout(timeout).json(body).send().await?;
        read_raw(resp).await
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let resp = self.client.get(format!("{}/health", self.base_url)).timeout(Duration::from_secs(5)).send().await?;
        anyhow::ensure!(resp.status().is_success(), "health check returned {}", resp.status());
        Ok(())
    }
}

pub(super) async fn read_raw(resp: reqwest::Response) -> Result<RawHttpReply, BackendCallError> {
    let status = resp.status();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = resp.bytes().await?;
    Ok(RawHttpReply { status, content_type, body })
}
