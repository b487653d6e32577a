//! LLM-backed intent classification.
//!
//! The classifier model is asked for a bare JSON object with two booleans.
//! Models like to wrap JSON in prose or code fences, so [`parse_intent`]
//! takes the outermost `{ ... }` span before deserializing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::llm::{ChatClient, ChatMessage};
use crate::models::Intent;
use crate::traits::IntentClassifier;

const CLASSIFIER_PROMPT: &str = "You route questions for a knowledge assistant. \
Decide two things about the user's query.\n\
needs_context: true if answering requires internal documents or any domain specific \
information that might not be publicly available.\n\
needs_memory: true if the query refers to the previous conversation.\n\
Reply with only a JSON object of the form {\"needs_context\": <bool>, \"needs_memory\": <bool>}.";

pub struct LlmIntentClassifier {
    client: Arc<ChatClient>,
    model: String,
}

impl LlmIntentClassifier {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, query: &str) -> Result<Intent> {
        let messages = [
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(query),
        ];
        let reply = self.client.complete(&self.model, &messages, 0.0).await?;
        parse_intent(&reply)
    }
}

/// Extracts an [`Intent`] from a model reply.
pub fn parse_intent(reply: &str) -> Result<Intent> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &reply[s..=e],
        _ => anyhow::bail!("classifier reply contains no JSON object: {:?}", reply),
    };
    serde_json::from_str(json).with_context(|| format!("invalid classifier reply: {}", json))
}
