//! OpenAI-compatible chat completions client.
//!
//! Used by the intent classifier, the query rewriter and the response
//! generator. Offers a blocking [`ChatClient::complete`] and a streaming
//! [`ChatClient::complete_stream`] that yields content deltas.
//!
//! # Retry Strategy
//!
//! Same policy as the embedding providers:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, ... (capped at 2^5)
//!
//! Streaming requests are retried only until the response headers arrive;
//! once fragments have been handed out the stream is never restarted.
//!
//! `[llm].timeout_secs` bounds connecting and each blocking completion. A
//! streamed completion has no overall deadline.

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::config::LlmConfig;
use crate::embedding::send_retrying;
use crate::traits::TokenStream;

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    timeout: Duration,
}

impl ChatClient {
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(API_KEY_ENV)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", API_KEY_ENV))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            timeout,
        })
    }

    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
        });
        let request = self.request(&body).timeout(self.timeout);
        let response = send_retrying(request, self.max_retries, "chat completion").await?;
        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }

    pub async fn complete_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<TokenStream> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "stream": true,
        });
        let request = self.request(&body);
        let mut response = send_retrying(request, self.max_retries, "chat completion").await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => {
                        // Last line may lack its newline.
                        if !buffer.is_empty() {
                            forward_line(&buffer, &tx).await;
                        }
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("stream interrupted: {}", e))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if !forward_line(&line, &tx).await {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
    }
}

/// Parses one stream line and passes its delta on. Returns `false` when
/// reading should stop.
async fn forward_line(line: &[u8], tx: &mpsc::Sender<Result<String>>) -> bool {
    match parse_stream_line(&String::from_utf8_lossy(line)) {
        Ok(StreamLine::Delta(text)) => {
            if tx.send(Ok(text)).await.is_err() {
                debug!("completion stream consumer dropped");
                return false;
            }
            true
        }
        Ok(StreamLine::Done) => false,
        Ok(StreamLine::Skip) => true,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

/// Extracts `choices[0].message.content`.
pub fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Invalid chat completion response: missing content"))
}

/// One line of a streamed completion.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamLine {
    Delta(String),
    Done,
    Skip,
}

pub fn parse_stream_line(line: &str) -> Result<StreamLine> {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(StreamLine::Done);
    }

    let json: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("Invalid stream chunk: {}", e))?;
    match json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(text) if !text.is_empty() => Ok(StreamLine::Delta(text.to_string())),
        _ => Ok(StreamLine::Skip),
    }
}
