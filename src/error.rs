//! Error taxonomy and the per-node failure policy.
//!
//! Nodes report failures as [`NodeError`]. The workflow engine looks the
//! failing [`Node`] up in [`Node::failure_policy`] and either aborts with a
//! [`WorkflowError`] or substitutes the node's empty output.

use std::fmt;

/// A step of the query workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Normalize,
    Classify,
    Context,
    Memory,
    Generate,
    Log,
}

/// What the engine does when a node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the request.
    Fatal,
    /// Continue with the node's empty output.
    Degrade,
}

impl Node {
    pub fn name(self) -> &'static str {
        match self {
            Node::Normalize => "normalize",
            Node::Classify => "classify",
            Node::Context => "context",
            Node::Memory => "memory",
            Node::Generate => "generate",
            Node::Log => "log",
        }
    }

    pub fn failure_policy(self) -> FailurePolicy {
        match self {
            Node::Normalize | Node::Classify | Node::Generate => FailurePolicy::Fatal,
            Node::Context | Node::Memory | Node::Log => FailurePolicy::Degrade,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failure raised inside one node.
#[derive(Debug, thiserror::Error)]
#[error("{node} node failed: {source:#}")]
pub struct NodeError {
    pub node: Node,
    #[source]
    pub source: anyhow::Error,
}

impl NodeError {
    pub fn new(node: Node, source: impl Into<anyhow::Error>) -> Self {
        Self {
            node,
            source: source.into(),
        }
    }
}

/// Coarse classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Upstream,
    Internal,
}

/// A fatal workflow failure.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid query: {0}")]
    Validation(String),
    #[error("upstream service failed in {node}: {source:#}")]
    Upstream {
        node: Node,
        #[source]
        source: anyhow::Error,
    },
    #[error("internal error in {node}: {source:#}")]
    Internal {
        node: Node,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Upstream { .. } => ErrorKind::Upstream,
            WorkflowError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Client-safe message. Never includes backend identity or error detail.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "Invalid query. Please provide a non-empty question of at most 5000 characters.",
            ErrorKind::Upstream => "AI service error. Please try again later.",
            ErrorKind::Internal => {
                "An error occurred while processing your query. Please try again."
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "bad_request",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Internal => "internal",
        }
    }
}

impl From<NodeError> for WorkflowError {
    fn from(err: NodeError) -> Self {
        match err.node {
            Node::Classify | Node::Generate => WorkflowError::Upstream {
                node: err.node,
                source: err.source,
            },
            node => WorkflowError::Internal {
                node,
                source: err.source,
            },
        }
    }
}
