//! OpenAI-compatible HTTP backend
//!
//! Posts one user message to `{base_url}/chat/completions` and maps the
//! response onto the coordination layer's backend errors:
//!
//! ```text
//! Response                         | BackendError
//! ---------------------------------|-------------
//! 429                              | RateLimited
//! 408, 504, client-side timeout    | Timeout
//! other 5xx, connection failure    | Server
//! other 4xx                        | Rejected
//! 2xx without usable content       | Server
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use inference_coordination::{Backend, BackendError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Map a non-success status to a backend error.
pub fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let detail = format!("{}: {}", status, truncate(body, 200));
    match status {
        StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendError::Timeout(detail),
        s if s.is_server_error() => BackendError::Server(detail),
        _ => BackendError::Rejected(detail),
    }
}

fn classify_transport(err: &reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(err.to_string())
    } else {
        BackendError::Server(err.to_string())
    }
}

fn extract_content(body: &str) -> Result<String, BackendError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::Server(format!("malformed response: {}", e)))?;
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| BackendError::Server("response had no content".into()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Backend calling an OpenAI-compatible chat completions endpoint
pub struct HttpBackend {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn call(&self, model: &str, prompt: &str, max_tokens: u32) -> Result<String, BackendError> {
        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens,
            temperature: 0.2,
        };

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| classify_transport(&e))?;
        debug!(model, status = status.as_u16(), bytes = body.len(), "http backend: response");

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        extract_content(&body)
    }
}
