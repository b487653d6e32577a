//! Collaborator traits the workflow is composed from.
//!
//! Every external capability the workflow calls is a trait object, so the
//! engine can be wired with the production clients (LLM, vector index,
//! database) or with in-memory stand-ins.
//!
//! ```text
//!   normalize ─▶ IntentClassifier ─▶ ┌ ContextRetriever ┐ ─▶ ResponseGenerator ─▶ AuditSink
//!   (QueryRewriter,                  └ MemorySource     ┘
//!    MemorySource)
//! ```
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use anyhow::Result;
//! use knowledge_assistant::models::Intent;
//! use knowledge_assistant::traits::IntentClassifier;
//!
//! pub struct AlwaysRetrieve;
//!
//! #[async_trait]
//! impl IntentClassifier for AlwaysRetrieve {
//!     async fn classify(&self, _query: &str) -> Result<Intent> {
//!         Ok(Intent { needs_context: true, needs_memory: false })
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::models::{AuditRecord, GenerationRequest, Intent};

/// Finite, non-restartable sequence of answer fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Decides which optional retrieval branches a query needs.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, query: &str) -> Result<Intent>;
}

/// Ranked text snippets relevant to a query.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Returns at most `top_k` snippets, best first.
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>>;
}

/// Produces the answer, either whole or as a live fragment stream.
///
/// Both methods must build the same prompt from the same request so that
/// the concatenated stream matches the blocking answer.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TokenStream>;
}

/// Recent conversation turns for a user, already rendered as text.
#[async_trait]
pub trait MemorySource: Send + Sync {
    /// At most three turns, newest first; `""` when there are none.
    async fn recent_turns(&self, user_id: i32) -> Result<String>;
}

/// Best-effort persistence of finished requests.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn save_conversation_turn(&self, user_id: i32, query: &str, answer: &str) -> Result<()>;

    async fn save_audit_record(&self, record: &AuditRecord) -> Result<()>;
}

/// Rewrites a normalized query into a self-contained one using history.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, query: &str, history: &str) -> Result<String>;
}
