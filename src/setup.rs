//! Wires the production collaborators into a [`Workflow`].
//!
//! Every component is constructed once at process start and shared by
//! reference; the connection manager is the only stateful piece and is
//! passed in by the caller so the server and the CLI can also use it.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classify::LlmIntentClassifier;
use crate::config::Config;
use crate::db::ConnectionManager;
use crate::embedding::create_embedder;
use crate::generate::LlmResponseGenerator;
use crate::llm::ChatClient;
use crate::normalize::{LlmQueryRewriter, QueryNormalizer};
use crate::retrieval::{UnconfiguredRetriever, VectorIndexRetriever};
use crate::store::{AuditLog, MemoryStore};
use crate::traits::{ContextRetriever, MemorySource};
use crate::workflow::{Collaborators, Workflow};

/// # Errors
///
/// Fails if the LLM client cannot be built (missing `OPENAI_API_KEY`) or
/// the configured embedding provider is invalid.
pub fn build_workflow(config: &Config, db: Arc<ConnectionManager>) -> Result<Workflow> {
    let chat = Arc::new(ChatClient::from_config(&config.llm)?);
    let memory: Arc<dyn MemorySource> = Arc::new(MemoryStore::new(Arc::clone(&db)));

    let retriever: Arc<dyn ContextRetriever> = if config.retrieval.index_url.is_some() {
        let embedder = create_embedder(&config.embedding)?;
        Arc::new(VectorIndexRetriever::new(&config.retrieval, embedder)?)
    } else {
        warn!("retrieval.index_url not set, context retrieval will always come back empty");
        Arc::new(UnconfiguredRetriever)
    };

    let normalizer = if config.normalizer.rewrite {
        QueryNormalizer::with_rewriter(
            Arc::new(LlmQueryRewriter::new(
                Arc::clone(&chat),
                config.llm.classifier_model.clone(),
            )),
            Arc::clone(&memory),
        )
    } else {
        QueryNormalizer::plain()
    };

    info!(
        model = %config.llm.model,
        classifier = %config.llm.classifier_model,
        rewrite = config.normalizer.rewrite,
        "workflow ready"
    );

    Ok(Workflow::new(Collaborators {
        normalizer,
        classifier: Arc::new(LlmIntentClassifier::new(
            Arc::clone(&chat),
            config.llm.classifier_model.clone(),
        )),
        retriever,
        memory,
        generator: Arc::new(LlmResponseGenerator::new(
            chat,
            config.llm.model.clone(),
            config.llm.temperature,
        )),
        audit: Arc::new(AuditLog::new(db)),
        top_k: config.retrieval.top_k,
    }))
}
