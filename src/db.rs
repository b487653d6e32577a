//! Dual-backend connection manager.
//!
//! Owns the single cached persistence connection for the whole process.
//! The primary backend is preferred; when it cannot be reached the manager
//! falls back to the standby and, while on standby, re-checks the primary
//! at most once per recovery interval.
//!
//! # State machine
//!
//! ```text
//!            primary ok                    recovery check ok
//!  UNSET ─────────────────▶ PRIMARY_ACTIVE ◀──────────────────┐
//!    │                            │                           │
//!    │ primary fails,             │ cached conn dead,         │
//!    │ standby ok                 │ primary fails, standby ok │
//!    ▼                            ▼                           │
//!  STANDBY_ACTIVE ◀───────────────┘                           │
//!    └────────────────────────────────────────────────────────┘
//! ```
//!
//! Every acquisition, probe and replacement happens under one
//! [`tokio::sync::Mutex`]. The returned [`ConnectionHandle`] keeps that
//! lock for as long as the caller holds it, so callers must drop it at
//! the end of a single operation.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use sqlx::{AnyConnection, Connection};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::DbConfig;

/// Which store produced a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Primary,
    Standby,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Primary => f.write_str("primary"),
            Backend::Standby => f.write_str("standby"),
        }
    }
}

/// Manager state as observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unset,
    PrimaryActive,
    StandbyActive,
}

impl ConnectionState {
    fn for_backend(backend: Backend) -> Self {
        match backend {
            Backend::Primary => ConnectionState::PrimaryActive,
            Backend::Standby => ConnectionState::StandbyActive,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unset => f.write_str("unset"),
            ConnectionState::PrimaryActive => f.write_str("primary"),
            ConnectionState::StandbyActive => f.write_str("standby"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("both database backends are unavailable (primary: {primary}; standby: {standby})")]
    BothBackendsUnavailable { primary: String, standby: String },
    #[error("standby database is unavailable: {0}")]
    StandbyUnavailable(String),
    #[error("no cached database connection")]
    NoConnection,
    #[error("database query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("failed to write to {table}: {source}")]
    Write {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// A live connection tagged with the backend that produced it.
pub struct BackendConnection {
    backend: Backend,
    conn: AnyConnection,
}

impl BackendConnection {
    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl Deref for BackendConnection {
    type Target = AnyConnection;

    fn deref(&self) -> &AnyConnection {
        &self.conn
    }
}

impl DerefMut for BackendConnection {
    fn deref_mut(&mut self) -> &mut AnyConnection {
        &mut self.conn
    }
}

/// Exclusive access to the cached connection for one operation.
pub type ConnectionHandle<'a> = MappedMutexGuard<'a, BackendConnection>;

/// Connection parameters for one backend.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: Option<String>,
    pub connect_timeout: Duration,
}

impl Endpoint {
    pub fn new(url: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
        }
    }
}

struct ManagerState {
    cached: Option<BackendConnection>,
    state: ConnectionState,
    last_recovery_check: Option<Instant>,
}

impl ManagerState {
    /// Forgets a dead handle. Nothing is cached afterwards, so no backend is
    /// active and the next selection starts from the primary.
    fn discard_stale(&mut self) {
        self.cached = None;
        self.state = ConnectionState::Unset;
    }

    fn recovery_due(&self, interval: Duration) -> bool {
        match self.last_recovery_check {
            Some(at) => at.elapsed() > interval,
            None => true,
        }
    }
}

pub struct ConnectionManager {
    primary: Endpoint,
    standby: Endpoint,
    recovery_interval: Duration,
    inner: Mutex<ManagerState>,
}

impl ConnectionManager {
    pub fn new(primary: Endpoint, standby: Endpoint, recovery_interval: Duration) -> Self {
        sqlx::any::install_default_drivers();
        Self {
            primary,
            standby,
            recovery_interval,
            inner: Mutex::new(ManagerState {
                cached: None,
                state: ConnectionState::Unset,
                last_recovery_check: None,
            }),
        }
    }

    pub fn from_config(config: &DbConfig) -> Self {
        Self::new(
            Endpoint::new(config.primary_url.clone(), config.primary_probe_timeout()),
            Endpoint::new(config.standby_url.clone(), config.standby_connect_timeout()),
            config.recovery_interval(),
        )
    }

    pub async fn current_state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Returns a live connection, failing over or recovering as needed.
    pub async fn get_connection(&self) -> Result<ConnectionHandle<'_>, DbError> {
        let mut guard = self.inner.lock().await;
        let recovery_due = guard.recovery_due(self.recovery_interval);

        let cached_alive = match guard.cached.as_mut() {
            Some(cached) => match cached.conn.ping().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(backend = %cached.backend, error = %e, "cached database connection is dead");
                    false
                }
            },
            None => false,
        };

        if cached_alive {
            if guard.state == ConnectionState::StandbyActive && recovery_due {
                self.try_recover(&mut guard).await;
            }
            return handle(guard);
        }

        // Stale handles are dropped without a close handshake.
        guard.discard_stale();
        let fresh = self.select(&mut guard).await?;
        guard.state = ConnectionState::for_backend(fresh.backend);
        guard.cached = Some(fresh);
        handle(guard)
    }

    /// Releases the cached connection and resets to `UNSET`.
    pub async fn close_connection(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(cached) = guard.cached.take() {
            if let Err(e) = cached.conn.close().await {
                debug!(error = %e, "error while closing database connection");
            }
        }
        guard.state = ConnectionState::Unset;
    }

    /// Opens a fresh standby connection, bypassing the cache.
    pub async fn get_standby_connection(&self) -> Result<AnyConnection, DbError> {
        self.open_standby()
            .await
            .map_err(|e| DbError::StandbyUnavailable(format!("{:#}", e)))
    }

    async fn try_recover(&self, guard: &mut MutexGuard<'_, ManagerState>) {
        debug!("standby active, checking primary for recovery");
        guard.last_recovery_check = Some(Instant::now());
        match self.open_primary().await {
            Ok(conn) => {
                if let Some(old) = guard.cached.take() {
                    if let Err(e) = old.conn.close().await {
                        debug!(error = %e, "error while closing standby connection");
                    }
                }
                guard.cached = Some(BackendConnection {
                    backend: Backend::Primary,
                    conn,
                });
                guard.state = ConnectionState::PrimaryActive;
                info!("primary database recovered, switched back from standby");
            }
            Err(e) => {
                debug!(error = %format!("{:#}", e), "primary still unavailable, staying on standby");
            }
        }
    }

    /// Primary first, then standby. Only runs with nothing cached, so there
    /// is no active backend whose recovery interval could apply.
    async fn select(&self, guard: &mut ManagerState) -> Result<BackendConnection, DbError> {
        guard.last_recovery_check = Some(Instant::now());
        let primary = match self.open_primary().await {
            Ok(conn) => {
                info!("connected to primary database");
                return Ok(BackendConnection {
                    backend: Backend::Primary,
                    conn,
                });
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), "primary database unavailable, using standby");
                format!("{:#}", e)
            }
        };

        match self.open_standby().await {
            Ok(conn) => {
                info!("connected to standby database");
                Ok(BackendConnection {
                    backend: Backend::Standby,
                    conn,
                })
            }
            Err(e) => Err(DbError::BothBackendsUnavailable {
                primary,
                standby: format!("{:#}", e),
            }),
        }
    }

    /// Short probe, then a full connection.
    async fn open_primary(&self) -> anyhow::Result<AnyConnection> {
        let url = self
            .primary
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("primary database is not configured"))?;

        let probe = connect_with_timeout(url, self.primary.connect_timeout).await?;
        if let Err(e) = probe.close().await {
            debug!(error = %e, "error while closing primary probe connection");
        }

        AnyConnection::connect(url)
            .await
            .map_err(|e| anyhow::anyhow!("primary connection failed: {}", e))
    }

    async fn open_standby(&self) -> anyhow::Result<AnyConnection> {
        let url = self
            .standby
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("standby database is not configured"))?;
        connect_with_timeout(url, self.standby.connect_timeout).await
    }
}

async fn connect_with_timeout(url: &str, timeout: Duration) -> anyhow::Result<AnyConnection> {
    match tokio::time::timeout(timeout, AnyConnection::connect(url)).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(anyhow::anyhow!("connection failed: {}", e)),
        Err(_) => Err(anyhow::anyhow!(
            "connection timed out after {}s",
            timeout.as_secs_f32()
        )),
    }
}

fn handle(guard: MutexGuard<'_, ManagerState>) -> Result<ConnectionHandle<'_>, DbError> {
    MutexGuard::try_map(guard, |state| state.cached.as_mut()).map_err(|_| DbError::NoConnection)
}
