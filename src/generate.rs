//! Answer generation over the chat completions API.
//!
//! Blocking and streaming generation go through [`build_messages`], so for
//! the same request both modes send the model an identical prompt.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::llm::{ChatClient, ChatMessage};
use crate::models::GenerationRequest;
use crate::traits::{ResponseGenerator, TokenStream};

const BASE_PROMPT: &str = "You are a helpful AI assistant that answers questions based on the \
provided context and conversation history. Your goal is to provide accurate, clear, and helpful \
responses.";

pub struct LlmResponseGenerator {
    client: Arc<ChatClient>,
    model: String,
    temperature: f32,
}

impl LlmResponseGenerator {
    pub fn new(client: Arc<ChatClient>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            client,
            model: model.into(),
            temperature,
        }
    }
}

#[async_trait]
impl ResponseGenerator for LlmResponseGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let messages = build_messages(request);
        self.client
            .complete(&self.model, &messages, self.temperature)
            .await
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let messages = build_messages(request);
        self.client
            .complete_stream(&self.model, &messages, self.temperature)
            .await
    }
}

/// System prompt variant for the material available to the model.
pub fn system_prompt(context: &str, memory: &str) -> String {
    let has_context = !context.trim().is_empty();
    let has_memory = !memory.trim().is_empty();

    let guidance = match (has_context, has_memory) {
        (true, true) => {
            "You have access to both retrieved context from the knowledge base and previous \
             conversation history. Use both sources to provide a comprehensive answer. If the \
             context and conversation history are relevant, incorporate them into your response. \
             If the user's query refers to previous conversation, make sure to reference it \
             appropriately."
        }
        (true, false) => {
            "You have access to retrieved context from the knowledge base. Use this context to \
             answer the user's query accurately. If the context is relevant, base your answer on \
             it. If not, provide a general helpful response."
        }
        (false, true) => {
            "You have access to previous conversation history. Use this history to provide \
             context-aware responses. If the user's query refers to previous conversation, \
             reference it appropriately."
        }
        (false, false) => {
            "Answer the user's query to the best of your ability based on your general knowledge."
        }
    };

    format!("{}\n\n{}", BASE_PROMPT, guidance)
}

/// Message list for one generation request.
pub fn build_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt(
        &request.context,
        &request.memory,
    ))];

    if !request.memory.trim().is_empty() {
        messages.push(ChatMessage::system(format!(
            "Previous conversation history:\n{}",
            request.memory
        )));
    }

    let user = if request.context.trim().is_empty() {
        request.query.clone()
    } else {
        format!(
            "Context from knowledge base:\n{}\n\nUser query: {}",
            request.context, request.query
        )
    };
    messages.push(ChatMessage::user(user));

    messages
}
