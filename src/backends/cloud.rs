//! Adapter for the cloud backend: the same `/v1/chat/completions` protocol as
//! [`super::local::LocalAdapter`], plus `/v1/responses` (used for enrichment) and a
//! bearer-token `Authorization` header.
//!
//! Grounded on `backends/openai.rs`, including its pattern of
//! surfacing a malformed API key as a startup-time panic rather than a deferred
//! request failure (an invalid header byte means the deployment is misconfigured,
//! not that this particular request is bad).

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::local::read_raw;
use super::{BackendCallError, RawHttpReply, SseStream};

pub struct CloudAdapter {
    base_url: String,
    model: String,
    client: Client,
    stream_client: Client,
    api_key_configured: bool,
}

impl CloudAdapter {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let api_key_configured = api_key.is_some();
        let headers = auth_headers(api_key.as_deref())?;
        let client = Client::builder().default_headers(headers.clone()).build()?;
        let stream_client = Client::builder().default_headers(headers).build()?;
        Ok(Self { base_url, model, client, stream_client, api_key_configured })
    }

    pub fn api_key_configured(&self) -> bool {
        self.api_key_configured
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

    /// `/v1/responses` — used only for enrichment fetches (C6).
    pub async fn responses(&self, body: &Value, timeout: Duration) -> Result<RawHttpReply, BackendCallError> {
        let resp = self.client.post(format!("{}/v1/responses", self.base_url)).timeout(timeout).json(body).send().await?;
        read_raw(resp).await
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        anyhow::ensure!(resp.status().is_success(), "health check returned {}", resp.status());
        Ok(())
    }
}

fn auth_headers(api_key: Option<&str>) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(key) = api_key {
        let mut value = HeaderValue::from_str(&format!("Bearer {key}"))
            .expect("configured API key must be valid header bytes");
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer, key: Option<&str>) -> CloudAdapter {
        CloudAdapter::new(server.uri(), "test-model".into(), key.map(str::to_string)).unwrap()
    }

    #[tokio::test]
    async fn chat_completions_sends_bearer_header_when_key_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let reply =
            adapter(&server, Some("secret-key")).chat_completions(&serde_json::json!({}), Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_completions_succeeds_without_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let reply = adapter(&server, None).chat_completions(&serde_json::json!({}), Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn responses_hits_the_responses_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"output": []})))
            .mount(&server)
            .await;

        let reply = adapter(&server, None).responses(&serde_json::json!({}), Duration::from_secs(5)).await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
    }
}
