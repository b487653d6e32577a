//! # Knowledge Assistant
//!
//! A retrieval-augmented question answering service built around a small
//! query workflow and a failover-aware persistence layer.
//!
//! ## Architecture
//!
//! ```text
//!  query ─▶ Normalize ─▶ Classify ─┬─▶ Context (vector index) ─┐
//!                                  └─▶ Memory  (conversation) ─┴─▶ Generate ─▶ Log
//!                                                   │                           │
//!                                                   ▼                           ▼
//!                                      ┌──────────────────────────────────────────┐
//!                                      │ ConnectionManager: primary ⇄ standby     │
//!                                      └──────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ka init                                   # create tables on both backends
//! ka ask "what is our refund policy?"       # one-off question
//! ka ask "and for digital goods?" --user-id 7 --stream
//! ka status                                 # which backend is active
//! ka serve                                  # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Workflow state, events and records |
//! | [`error`] | Error taxonomy and per-node failure policy |
//! | [`traits`] | Collaborator traits the workflow is built from |
//! | [`workflow`] | The DAG executor: `run` and `run_stream` |
//! | [`normalize`] | Query validation, normalization and rewriting |
//! | [`llm`] | Chat completions client |
//! | [`classify`] | LLM intent classifier |
//! | [`generate`] | LLM answer generator |
//! | [`embedding`] | Query embedding providers |
//! | [`retrieval`] | Vector index context retriever |
//! | [`db`] | Dual-backend connection manager |
//! | [`migrate`] | Schema creation |
//! | [`store`] | Conversation memory and audit log |
//! | [`setup`] | Production wiring |
//! | [`server`] | HTTP API |

pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod retrieval;
pub mod server;
pub mod setup;
pub mod store;
pub mod traits;
pub mod workflow;
