//! Context retrieval against a hosted vector index.
//!
//! The query is embedded locally, then sent to `{index_url}/query`
//! (Pinecone-compatible data plane). Each match's `metadata.text` is one
//! snippet; matches without text are skipped.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::embedding::{send_with_retry, Embedder};
use crate::traits::ContextRetriever;

/// Environment variable holding the vector index API key.
pub const INDEX_API_KEY_ENV: &str = "VECTOR_INDEX_API_KEY";

const INDEX_MAX_RETRIES: u32 = 3;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IndexQuery<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

pub struct VectorIndexRetriever {
    embedder: Box<dyn Embedder>,
    http: reqwest::Client,
    index_url: String,
    namespace: Option<String>,
    api_key: Option<String>,
}

impl VectorIndexRetriever {
    /// # Errors
    ///
    /// Returns an error if `retrieval.index_url` is not configured.
    pub fn new(config: &RetrievalConfig, embedder: Box<dyn Embedder>) -> Result<Self> {
        let index_url = config
            .index_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("retrieval.index_url is not configured"))?
            .trim_end_matches('/')
            .to_string();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            embedder,
            http,
            index_url,
            namespace: config.namespace.clone(),
            api_key: std::env::var(INDEX_API_KEY_ENV).ok(),
        })
    }
}

#[async_trait]
impl ContextRetriever for VectorIndexRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        let vector = self.embedder.embed(query).await?;

        let body = IndexQuery {
            vector: &vector,
            top_k,
            include_metadata: true,
            namespace: self.namespace.as_deref(),
        };
        let mut request = self
            .http
            .post(format!("{}/query", self.index_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Api-Key", key);
        }

        let json = send_with_retry(request, INDEX_MAX_RETRIES, "vector index").await?;
        let snippets = parse_matches(&json)?;
        debug!(
            model = self.embedder.model_name(),
            matches = snippets.len(),
            "vector index query complete"
        );
        Ok(snippets)
    }
}

/// Stand-in used when no vector index is configured. Every call fails, so
/// the Context node degrades to an empty context.
pub struct UnconfiguredRetriever;

#[async_trait]
impl ContextRetriever for UnconfiguredRetriever {
    async fn retrieve(&self, _query: &str, _top_k: usize) -> Result<Vec<String>> {
        anyhow::bail!("no vector index configured (retrieval.index_url)")
    }
}

/// Extracts `matches[].metadata.text` in rank order.
pub fn parse_matches(json: &serde_json::Value) -> Result<Vec<String>> {
    let matches = json
        .get("matches")
        .and_then(|m| m.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid vector index response: missing matches array"))?;

    Ok(matches
        .iter()
        .filter_map(|m| m.pointer("/metadata/text").and_then(|t| t.as_str()))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect())
}

/// Joins snippets into the workflow's `context` field.
pub fn join_snippets(snippets: &[String]) -> String {
    snippets.join("\n\n")
}
