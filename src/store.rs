//! Conversation memory and audit persistence.
//!
//! Both stores borrow the process-wide [`ConnectionManager`] for exactly
//! one statement at a time and never keep a connection of their own.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;

use crate::db::{ConnectionManager, DbError};
use crate::models::{AuditRecord, ConversationTurn};
use crate::traits::{AuditSink, MemorySource};

/// Number of past turns fed back into a request.
pub const RECENT_TURNS: i64 = 3;

/// Renders turns newest first as `User: ..\nAssistant: ..`, separated by a blank line.
pub fn format_turns(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("User: {}\nAssistant: {}", t.user_query, t.llm_response))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct MemoryStore {
    db: Arc<ConnectionManager>,
}

impl MemoryStore {
    pub fn new(db: Arc<ConnectionManager>) -> Self {
        Self { db }
    }

    /// The user's most recent turns, newest first.
    pub async fn fetch_recent_turns(
        &self,
        user_id: i32,
    ) -> Result<Vec<ConversationTurn>, DbError> {
        let mut conn = self.db.get_connection().await?;
        let rows = sqlx::query(
            "SELECT user_query, llm_response FROM conversation_history \
             WHERE user_id = $1 ORDER BY timestamp DESC, id DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(RECENT_TURNS)
        .fetch_all(&mut **conn)
        .await?;

        rows.iter()
            .map(|row| -> Result<ConversationTurn, DbError> {
                Ok(ConversationTurn {
                    user_query: row.try_get("user_query")?,
                    llm_response: row.try_get("llm_response")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MemorySource for MemoryStore {
    async fn recent_turns(&self, user_id: i32) -> Result<String> {
        let turns = self.fetch_recent_turns(user_id).await?;
        Ok(format_turns(&turns))
    }
}

pub struct AuditLog {
    db: Arc<ConnectionManager>,
}

impl AuditLog {
    pub fn new(db: Arc<ConnectionManager>) -> Self {
        Self { db }
    }

    pub async fn insert_turn(&self, user_id: i32, query: &str, answer: &str) -> Result<(), DbError> {
        let mut conn = self.db.get_connection().await?;
        sqlx::query(
            "INSERT INTO conversation_history (user_id, timestamp, user_query, llm_response) \
             VALUES ($1, CURRENT_TIMESTAMP, $2, $3)",
        )
        .bind(user_id)
        .bind(query)
        .bind(answer)
        .execute(&mut **conn)
        .await
        .map_err(|source| DbError::Write {
            table: "conversation_history",
            source,
        })?;
        Ok(())
    }

    pub async fn insert_record(&self, record: &AuditRecord) -> Result<(), DbError> {
        let mut conn = self.db.get_connection().await?;
        sqlx::query(
            "INSERT INTO audit_log (u_id, query, processed_query, context, past_memory, llm_response) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.user_id)
        .bind(&record.query)
        .bind(&record.processed_query)
        .bind(&record.context)
        .bind(&record.past_memory)
        .bind(&record.llm_response)
        .execute(&mut **conn)
        .await
        .map_err(|source| DbError::Write {
            table: "audit_log",
            source,
        })?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn save_conversation_turn(&self, user_id: i32, query: &str, answer: &str) -> Result<()> {
        Ok(self.insert_turn(user_id, query, answer).await?)
    }

    async fn save_audit_record(&self, record: &AuditRecord) -> Result<()> {
        Ok(self.insert_record(record).await?)
    }
}
