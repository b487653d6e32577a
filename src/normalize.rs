//! Query validation, normalization and history-aware rewriting.
//!
//! [`normalize`] is deterministic: lowercase, trim, and collapse every
//! whitespace run into one space. [`QueryNormalizer`] adds the optional
//! rewrite step, which asks a [`QueryRewriter`] to make a follow-up
//! question self-contained using the user's recent turns. Rewriting never
//! fails a request; any problem falls back to the normalized text.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::WorkflowError;
use crate::llm::{ChatClient, ChatMessage};
use crate::traits::{MemorySource, QueryRewriter};

/// Longest accepted query, in characters.
pub const MAX_QUERY_CHARS: usize = 5000;

/// Rejects queries that are blank or too long.
pub fn validate_query(query: &str) -> Result<(), WorkflowError> {
    if query.trim().is_empty() {
        return Err(WorkflowError::Validation("query is empty".to_string()));
    }
    let chars = query.chars().count();
    if chars > MAX_QUERY_CHARS {
        return Err(WorkflowError::Validation(format!(
            "query is {} characters, limit is {}",
            chars, MAX_QUERY_CHARS
        )));
    }
    Ok(())
}

pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The Normalize node's collaborator.
#[derive(Default)]
pub struct QueryNormalizer {
    rewriter: Option<Arc<dyn QueryRewriter>>,
    memory: Option<Arc<dyn MemorySource>>,
}

impl QueryNormalizer {
    /// Normalization only, no rewriting.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn with_rewriter(rewriter: Arc<dyn QueryRewriter>, memory: Arc<dyn MemorySource>) -> Self {
        Self {
            rewriter: Some(rewriter),
            memory: Some(memory),
        }
    }

    pub async fn normalize_query(&self, query: &str, user_id: Option<i32>) -> Result<String> {
        let normalized = normalize(query);

        let (Some(rewriter), Some(memory), Some(user_id)) =
            (&self.rewriter, &self.memory, user_id)
        else {
            return Ok(normalized);
        };

        let history = match memory.recent_turns(user_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(user_id, error = %format!("{:#}", e), "history unavailable, skipping query rewrite");
                return Ok(normalized);
            }
        };
        if history.trim().is_empty() {
            return Ok(normalized);
        }

        match rewriter.rewrite(&normalized, &history).await {
            Ok(rewritten) if !rewritten.trim().is_empty() => {
                let rewritten = rewritten.trim().to_string();
                debug!(user_id, original = %normalized, rewritten = %rewritten, "query rewritten");
                Ok(rewritten)
            }
            Ok(_) => {
                warn!(user_id, "query rewrite came back empty, using normalized query");
                Ok(normalized)
            }
            Err(e) => {
                warn!(user_id, error = %format!("{:#}", e), "query rewrite failed, using normalized query");
                Ok(normalized)
            }
        }
    }
}

const REWRITE_PROMPT: &str = "Rewrite the user's query so it works well for vector database \
retrieval, using the past conversation for context.\n\
1. Expand abbreviations and resolve references such as 'it', 'that' or 'the above'.\n\
2. Add context from the past conversation only when it is needed to make the query self-contained.\n\
3. Prefer specific, descriptive terms, but do not overcomplicate the query.\n\
4. Keep the original intent.\n\
5. If the query is already clear and self-contained, return it with minimal changes.\n\
Reply with the rewritten query only.";

pub struct LlmQueryRewriter {
    client: Arc<ChatClient>,
    model: String,
}

impl LlmQueryRewriter {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl QueryRewriter for LlmQueryRewriter {
    async fn rewrite(&self, query: &str, history: &str) -> Result<String> {
        let messages = [
            ChatMessage::system(REWRITE_PROMPT),
            ChatMessage::user(format!(
                "Past conversation:\n{}\n\nQuery: {}",
                history, query
            )),
        ];
        self.client.complete(&self.model, &messages, 0.0).await
    }
}
