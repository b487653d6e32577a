//! Core data models threaded through the query workflow.
//!
//! [`WorkflowState`] is the single record a request carries through the
//! DAG. Every field is written by exactly one node; not-yet-computed
//! fields are `None`. The remaining types are the shapes handed to and
//! returned from collaborators and the transport layer.

use serde::{Deserialize, Serialize};

/// Classifier verdict: which optional retrieval branches a query needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub needs_context: bool,
    pub needs_memory: bool,
}

/// Partial update returned by a node. Each variant names the one field
/// the producing node owns.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    NormalizedQuery(String),
    Intent(Intent),
    Context(String),
    Memory(String),
    Answer(String),
}

/// Per-request workflow state.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    query: String,
    user_id: Option<i32>,
    normalized_query: Option<String>,
    intent: Option<Intent>,
    context: Option<String>,
    memory: Option<String>,
    answer: Option<String>,
}

impl WorkflowState {
    pub fn new(query: impl Into<String>, user_id: Option<i32>) -> Self {
        Self {
            query: query.into(),
            user_id,
            normalized_query: None,
            intent: None,
            context: None,
            memory: None,
            answer: None,
        }
    }

    /// Merge a node's partial update. Fields are write-once.
    pub fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::NormalizedQuery(q) => set_once(&mut self.normalized_query, q),
            StateUpdate::Intent(i) => set_once(&mut self.intent, i),
            StateUpdate::Context(c) => set_once(&mut self.context, c),
            StateUpdate::Memory(m) => set_once(&mut self.memory, m),
            StateUpdate::Answer(a) => set_once(&mut self.answer, a),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn user_id(&self) -> Option<i32> {
        self.user_id
    }

    pub fn normalized_query(&self) -> &str {
        self.normalized_query.as_deref().unwrap_or("")
    }

    pub fn intent(&self) -> Intent {
        self.intent.unwrap_or_default()
    }

    /// Retrieved context, or `""` when the branch did not run or degraded.
    pub fn context(&self) -> &str {
        self.context.as_deref().unwrap_or("")
    }

    /// Recent conversation turns, or `""` when the branch did not run or degraded.
    pub fn memory(&self) -> &str {
        self.memory.as_deref().unwrap_or("")
    }

    pub fn answer(&self) -> &str {
        self.answer.as_deref().unwrap_or("")
    }

    pub fn generation_request(&self) -> GenerationRequest {
        GenerationRequest {
            query: self.normalized_query().to_string(),
            context: self.context().to_string(),
            memory: self.memory().to_string(),
        }
    }

    pub fn metadata(&self) -> StreamMetadata {
        let intent = self.intent();
        StreamMetadata {
            normalized_query: self.normalized_query().to_string(),
            needs_context: intent.needs_context,
            needs_memory: intent.needs_memory,
        }
    }

    /// The audit row for this request, if it belongs to a user.
    pub fn audit_record(&self) -> Option<AuditRecord> {
        self.user_id.map(|user_id| AuditRecord {
            user_id,
            query: self.query.clone(),
            processed_query: self.normalized_query().to_string(),
            context: self.context().to_string(),
            past_memory: self.memory().to_string(),
            llm_response: self.answer().to_string(),
        })
    }

    pub fn outcome(&self) -> QueryOutcome {
        let intent = self.intent();
        QueryOutcome {
            query: self.query.clone(),
            normalized_query: self.normalized_query().to_string(),
            answer: self.answer().to_string(),
            context_used: intent.needs_context,
            memory_used: intent.needs_memory,
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) {
    debug_assert!(slot.is_none(), "workflow state field written twice");
    *slot = Some(value);
}

/// Inputs to answer generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationRequest {
    pub query: String,
    pub context: String,
    pub memory: String,
}

/// Result of a blocking workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryOutcome {
    pub query: String,
    pub normalized_query: String,
    pub answer: String,
    pub context_used: bool,
    pub memory_used: bool,
}

/// One row of `audit_log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub user_id: i32,
    pub query: String,
    pub processed_query: String,
    pub context: String,
    pub past_memory: String,
    pub llm_response: String,
}

/// One row of `conversation_history`, as read back for memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationTurn {
    pub user_query: String,
    pub llm_response: String,
}

/// Payload of the `metadata` stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub normalized_query: String,
    pub needs_context: bool,
    pub needs_memory: bool,
}

/// Payload of the `error` stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Empty `{}` payload of the `done` stream event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// An event of the streaming workflow.
///
/// Serialized as `{"type": "...", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WorkflowEvent {
    Metadata(StreamMetadata),
    Token(String),
    Error(ErrorPayload),
    Done(Empty),
}

impl WorkflowEvent {
    pub fn error(message: impl Into<String>) -> Self {
        WorkflowEvent::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn done() -> Self {
        WorkflowEvent::Done(Empty {})
    }

    /// Server-Sent-Events frame: `data: <json>\n\n`.
    pub fn to_sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}
