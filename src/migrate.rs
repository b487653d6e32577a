use anyhow::{Context, Result};
use sqlx::AnyConnection;
use tracing::{info, warn};

use crate::db::ConnectionManager;

/// SQL dialect of a connected backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn of(conn: &AnyConnection) -> Self {
        if conn.backend_name().eq_ignore_ascii_case("sqlite") {
            Dialect::Sqlite
        } else {
            Dialect::Postgres
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Dialect::Postgres => "id SERIAL PRIMARY KEY",
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
        }
    }
}

/// Creates all tables on the active backend and on the standby.
///
/// Safe to run repeatedly. A standby failure is logged and tolerated as
/// long as the active backend was initialized.
pub async fn ensure_schema(manager: &ConnectionManager) -> Result<()> {
    {
        let mut conn = manager.get_connection().await?;
        let backend = conn.backend();
        create_tables(&mut conn)
            .await
            .with_context(|| format!("failed to create tables on {} database", backend))?;
        info!(%backend, "database schema ready");
    }

    match manager.get_standby_connection().await {
        Ok(mut standby) => {
            create_tables(&mut standby)
                .await
                .context("failed to create tables on standby database")?;
            if let Err(e) = sqlx::Connection::close(standby).await {
                warn!(error = %e, "error while closing standby schema connection");
            }
            info!("standby database schema ready");
        }
        Err(e) => warn!(error = %e, "standby schema not initialized"),
    }

    Ok(())
}

pub async fn create_tables(conn: &mut AnyConnection) -> Result<()> {
    let dialect = Dialect::of(conn);

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_history (
            {},
            user_id INTEGER NOT NULL,
            timestamp TIMESTAMP NOT NULL,
            user_query TEXT NOT NULL,
            llm_response TEXT NOT NULL
        )
        "#,
        dialect.id_column()
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            {},
            u_id INTEGER NOT NULL,
            timestamp TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            query TEXT,
            processed_query TEXT,
            context TEXT,
            past_memory TEXT,
            llm_response TEXT
        )
        "#,
        dialect.id_column()
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversation_history_user_ts ON conversation_history(user_id, timestamp DESC)",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}
