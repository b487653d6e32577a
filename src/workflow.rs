//! The query workflow engine.
//!
//! One request flows through a fixed DAG:
//!
//! ```text
//! Normalize ─▶ Classify ─▶ route ─┬─▶ Context ─┐
//!                                 └─▶ Memory  ─┴─▶ Generate ─▶ Log
//! ```
//!
//! [`route`] picks zero, one or both retrieval branches from the
//! classifier's [`Intent`]. Each selected branch runs as its own tokio task
//! and Generate starts only after every spawned branch has been joined.
//! The two branches own disjoint state fields, so the join order does not
//! matter.
//!
//! Nodes return a [`StateUpdate`] or a [`NodeError`]; they never touch the
//! state directly. [`settle`] is the single place where a node's result is
//! merged and where [`Node::failure_policy`] decides whether a failure
//! aborts the request or degrades to the node's empty output.
//!
//! [`Workflow::run`] returns the finished [`QueryOutcome`].
//! [`Workflow::run_stream`] runs the same preparation, then hands back an
//! [`EventStream`] of `metadata`, `token`* and a terminal `done` or
//! `error`. The Log node runs once after `done` has been delivered; if the
//! consumer goes away first the partial answer is not persisted. A caller
//! that exits right after the stream ends (the CLI) awaits
//! [`EventStream::finish`] so logging is not cut short.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{self, Poll};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{FailurePolicy, Node, NodeError, WorkflowError};
use crate::models::{Intent, QueryOutcome, StateUpdate, WorkflowEvent, WorkflowState};
use crate::normalize::{validate_query, QueryNormalizer};
use crate::retrieval::join_snippets;
use crate::traits::{AuditSink, ContextRetriever, IntentClassifier, MemorySource, ResponseGenerator};

const EVENT_BUFFER: usize = 32;

/// Live events of one streamed request, plus the task producing them.
///
/// Dropping it detaches the task; it still logs the answer if `done` was
/// delivered.
#[derive(Debug)]
pub struct EventStream {
    events: ReceiverStream<WorkflowEvent>,
    task: JoinHandle<()>,
}

impl EventStream {
    /// Waits for the producing task, including the Log node, to complete.
    pub async fn finish(self) {
        drop(self.events);
        if let Err(e) = self.task.await {
            warn!(error = %e, "streaming task did not complete");
        }
    }
}

impl Stream for EventStream {
    type Item = WorkflowEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<WorkflowEvent>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// An optional retrieval branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Context,
    Memory,
}

impl Branch {
    pub fn node(self) -> Node {
        match self {
            Branch::Context => Node::Context,
            Branch::Memory => Node::Memory,
        }
    }
}

/// Branches to run for a classified query, in a fixed order.
pub fn route(intent: Intent) -> Vec<Branch> {
    let mut targets = Vec::with_capacity(2);
    if intent.needs_context {
        targets.push(Branch::Context);
    }
    if intent.needs_memory {
        targets.push(Branch::Memory);
    }
    targets
}

/// Everything the engine calls out to.
pub struct Collaborators {
    pub normalizer: QueryNormalizer,
    pub classifier: Arc<dyn IntentClassifier>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub memory: Arc<dyn MemorySource>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub audit: Arc<dyn AuditSink>,
    /// Snippets requested from the retriever.
    pub top_k: usize,
}

#[derive(Clone)]
pub struct Workflow {
    normalizer: Arc<QueryNormalizer>,
    classifier: Arc<dyn IntentClassifier>,
    retriever: Arc<dyn ContextRetriever>,
    memory: Arc<dyn MemorySource>,
    generator: Arc<dyn ResponseGenerator>,
    audit: Arc<dyn AuditSink>,
    top_k: usize,
}

impl Workflow {
    pub fn new(parts: Collaborators) -> Self {
        Self {
            normalizer: Arc::new(parts.normalizer),
            classifier: parts.classifier,
            retriever: parts.retriever,
            memory: parts.memory,
            generator: parts.generator,
            audit: parts.audit,
            top_k: parts.top_k,
        }
    }

    /// Runs the whole DAG and returns the answer.
    #[tracing::instrument(name = "query", skip_all, fields(request_id = %Uuid::new_v4(), user_id = ?user_id))]
    pub async fn run(&self, query: &str, user_id: Option<i32>) -> Result<QueryOutcome, WorkflowError> {
        let mut state = self.prepare(query, user_id).await?;

        let generated = self.generate(&state).await;
        settle(&mut state, Node::Generate, generated)?;

        self.log(&state).await;
        info!(
            context_used = state.intent().needs_context,
            memory_used = state.intent().needs_memory,
            "query answered"
        );
        Ok(state.outcome())
    }

    /// Runs everything up to Generate, then streams the answer.
    ///
    /// Failures before streaming starts are returned as `Err`; a failure
    /// during generation arrives as an `error` event.
    #[tracing::instrument(name = "query_stream", skip_all, fields(request_id = %Uuid::new_v4(), user_id = ?user_id))]
    pub async fn run_stream(
        &self,
        query: &str,
        user_id: Option<i32>,
    ) -> Result<EventStream, WorkflowError> {
        let state = self.prepare(query, user_id).await?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        let task = tokio::spawn(async move { this.stream_answer(state, tx).await }.in_current_span());

        Ok(EventStream {
            events: ReceiverStream::new(rx),
            task,
        })
    }

    /// Validate, Normalize, Classify, then the routed retrieval branches.
    async fn prepare(&self, query: &str, user_id: Option<i32>) -> Result<WorkflowState, WorkflowError> {
        validate_query(query)?;
        let mut state = WorkflowState::new(query, user_id);

        let normalized = self.normalize(&state).await;
        settle(&mut state, Node::Normalize, normalized)?;

        let classified = self.classify(&state).await;
        settle(&mut state, Node::Classify, classified)?;

        self.gather(&mut state).await?;
        Ok(state)
    }

    async fn normalize(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
        self.normalizer
            .normalize_query(state.query(), state.user_id())
            .await
            .map(StateUpdate::NormalizedQuery)
            .map_err(|e| NodeError::new(Node::Normalize, e))
    }

    async fn classify(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
        self.classifier
            .classify(state.normalized_query())
            .await
            .map(StateUpdate::Intent)
            .map_err(|e| NodeError::new(Node::Classify, e))
    }

    /// Fans out to the routed branches and joins all of them.
    async fn gather(&self, state: &mut WorkflowState) -> Result<(), WorkflowError> {
        let targets = route(state.intent());
        debug!(?targets, "routing");

        let mut handles: Vec<(Branch, JoinHandle<Result<StateUpdate, NodeError>>)> =
            Vec::with_capacity(targets.len());
        for branch in targets {
            let task = match branch {
                Branch::Context => {
                    let retriever = Arc::clone(&self.retriever);
                    let query = state.normalized_query().to_string();
                    let top_k = self.top_k;
                    tokio::spawn(retrieve_context(retriever, query, top_k).in_current_span())
                }
                Branch::Memory => match state.user_id() {
                    Some(user_id) => {
                        let memory = Arc::clone(&self.memory);
                        tokio::spawn(recall_memory(memory, user_id).in_current_span())
                    }
                    None => {
                        debug!("no user id, skipping memory branch");
                        state.apply(StateUpdate::Memory(String::new()));
                        continue;
                    }
                },
            };
            handles.push((branch, task));
        }

        for (branch, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(NodeError::new(branch.node(), join_err)),
            };
            settle(state, branch.node(), result)?;
        }
        Ok(())
    }

    async fn generate(&self, state: &WorkflowState) -> Result<StateUpdate, NodeError> {
        self.generator
            .generate(&state.generation_request())
            .await
            .map(StateUpdate::Answer)
            .map_err(|e| NodeError::new(Node::Generate, e))
    }

    /// Best-effort persistence of the finished request.
    async fn log(&self, state: &WorkflowState) {
        let Some(record) = state.audit_record() else {
            debug!("no user id, skipping conversation log");
            return;
        };

        if let Err(e) = self
            .audit
            .save_conversation_turn(record.user_id, state.query(), state.answer())
            .await
        {
            degrade(Node::Log, &NodeError::new(Node::Log, e));
        }
        if let Err(e) = self.audit.save_audit_record(&record).await {
            degrade(Node::Log, &NodeError::new(Node::Log, e));
        }
    }

    async fn stream_answer(&self, mut state: WorkflowState, tx: mpsc::Sender<WorkflowEvent>) {
        if tx.send(WorkflowEvent::Metadata(state.metadata())).await.is_err() {
            debug!("stream consumer gone before metadata");
            return;
        }

        let mut fragments = match self.generator.generate_stream(&state.generation_request()).await {
            Ok(fragments) => fragments,
            Err(e) => {
                send_failure(&tx, NodeError::new(Node::Generate, e)).await;
                return;
            }
        };

        let mut answer = String::new();
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    answer.push_str(&text);
                    if tx.send(WorkflowEvent::Token(text)).await.is_err() {
                        info!("stream consumer disconnected, partial answer not logged");
                        return;
                    }
                }
                Err(e) => {
                    send_failure(&tx, NodeError::new(Node::Generate, e)).await;
                    return;
                }
            }
        }

        if tx.send(WorkflowEvent::done()).await.is_err() {
            info!("stream consumer disconnected before done, answer not logged");
            return;
        }
        drop(tx);

        state.apply(StateUpdate::Answer(answer));
        self.log(&state).await;
        debug!("streamed query answered");
    }
}

async fn retrieve_context(
    retriever: Arc<dyn ContextRetriever>,
    query: String,
    top_k: usize,
) -> Result<StateUpdate, NodeError> {
    retriever
        .retrieve(&query, top_k)
        .await
        .map(|snippets| StateUpdate::Context(join_snippets(&snippets)))
        .map_err(|e| NodeError::new(Node::Context, e))
}

async fn recall_memory(memory: Arc<dyn MemorySource>, user_id: i32) -> Result<StateUpdate, NodeError> {
    memory
        .recent_turns(user_id)
        .await
        .map(StateUpdate::Memory)
        .map_err(|e| NodeError::new(Node::Memory, e))
}

/// Merges a node result into the state, applying the failure policy.
fn settle(
    state: &mut WorkflowState,
    node: Node,
    result: Result<StateUpdate, NodeError>,
) -> Result<(), WorkflowError> {
    let err = match result {
        Ok(update) => {
            state.apply(update);
            return Ok(());
        }
        Err(err) => err,
    };

    match node.failure_policy() {
        FailurePolicy::Fatal => {
            error!(node = %node, error = %err, "workflow aborted");
            Err(err.into())
        }
        FailurePolicy::Degrade => {
            degrade(node, &err);
            if let Some(empty) = empty_output(node) {
                state.apply(empty);
            }
            Ok(())
        }
    }
}

fn degrade(node: Node, err: &NodeError) {
    warn!(node = %node, error = %err, "node failed, continuing without its output");
}

fn empty_output(node: Node) -> Option<StateUpdate> {
    match node {
        Node::Context => Some(StateUpdate::Context(String::new())),
        Node::Memory => Some(StateUpdate::Memory(String::new())),
        _ => None,
    }
}

async fn send_failure(tx: &mpsc::Sender<WorkflowEvent>, err: NodeError) {
    error!(node = %err.node, error = %err, "streaming generation failed");
    let err = WorkflowError::from(err);
    if tx.send(WorkflowEvent::error(err.user_message())).await.is_err() {
        debug!("stream consumer gone before error event");
    }
}
