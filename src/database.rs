//! Database handle and its connect/poll state machine.
//!
//! ```text
//! not_connected --connect--> connecting --poll--> connected
//!                    |            |
//!                    +------------+--> failed_connection
//! any state --(no driver for vendor)--> invalid_db
//! ```
//!
//! `connect` awaits one full handshake as a probe, then starts the remaining
//! pool slots in the background. `poll_status` never blocks: it collects
//! whichever handshakes have finished and reports the resulting state.

use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::DbConfig;
use crate::driver::{driver_for, Connection, Driver, Vendor};
use crate::error::{DbError, Result};
use crate::pool::ConnectionPool;

// ============================================================================
// Connectivity state
// ============================================================================

/// Connectivity state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    NotConnected,
    Connecting,
    Connected,
    FailedConnection,
    InvalidDb,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::NotConnected => "not_connected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::FailedConnection => "failed_connection",
            ConnState::InvalidDb => "invalid_db",
        }
    }

    /// `connected`, `failed_connection` and `invalid_db` never change on
    /// their own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnState::Connected | ConnState::FailedConnection | ConnState::InvalidDb
        )
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Handshake = JoinHandle<Result<Box<dyn Connection>>>;

struct Lifecycle {
    state: ConnState,
    /// Background handshakes keyed by the pool slot they will fill.
    pending: Vec<(usize, Handshake)>,
    probing: bool,
}

impl Lifecycle {
    fn abort_pending(&mut self) {
        for (_, handle) in self.pending.drain(..) {
            handle.abort();
        }
    }
}

// ============================================================================
// Database handle
// ============================================================================

/// A pooled, vendor-dispatched database handle shared by concurrent callers.
pub struct Database {
    config: DbConfig,
    driver: Option<Arc<dyn Driver>>,
    pool: ConnectionPool,
    lifecycle: Mutex<Lifecycle>,
}

impl Database {
    /// Create a handle for the configured vendor's registered driver.
    ///
    /// An unregistered vendor still yields a handle; it reports `invalid_db`
    /// on connect and on every query.
    pub fn create(config: DbConfig) -> Result<Self> {
        let driver = driver_for(config.vendor);
        Self::build(config, driver)
    }

    /// Create a handle backed by an explicit driver.
    pub fn with_driver(config: DbConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        Self::build(config, Some(driver))
    }

    fn build(config: DbConfig, driver: Option<Arc<dyn Driver>>) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(config.effective_pool_size());
        Ok(Self {
            config,
            driver,
            pool,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnState::NotConnected,
                pending: Vec::new(),
                probing: false,
            }),
        })
    }

    /// Probe one connection, then start the rest of the pool.
    ///
    /// Returns `connecting` (or `connected` for a pool of one). A failed
    /// probe leaves the handle in `failed_connection`. Calling it again on a
    /// handle that is already connecting or connected is a no-op.
    pub async fn connect(&self) -> Result<ConnState> {
        let driver = {
            let mut lifecycle = self.lifecycle.lock();

            let Some(driver) = self.driver.clone() else {
                lifecycle.state = ConnState::InvalidDb;
                return Err(DbError::InvalidDb(format!(
                    "no driver registered for vendor {}",
                    self.config.vendor
                )));
            };

            match lifecycle.state {
                ConnState::Connecting | ConnState::Connected => return Ok(lifecycle.state),
                _ if lifecycle.probing => {
                    return Err(DbError::ConnectionError(
                        "connect already in progress".to_string(),
                    ))
                }
                _ => {}
            }

            lifecycle.probing = true;
            driver
        };

        let params = self.config.connect_params();
        let probe = driver.connect(&params).await;

        let (state, stale) = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.probing = false;

            let conn = match probe {
                Ok(conn) => conn,
                Err(e) => {
                    error!(
                        vendor = driver.name(),
                        host = %params.host,
                        port = params.port,
                        error = %e,
                        "connection probe failed"
                    );
                    lifecycle.state = ConnState::FailedConnection;
                    return Err(match e {
                        DbError::ConnectionError(_) => e,
                        other => DbError::ConnectionError(other.to_string()),
                    });
                }
            };

            // A previous failed attempt may have filled some slots.
            let stale = self.pool.drain()?;
            self.pool.install(0, conn)?;

            for index in 1..self.pool.size() {
                let driver = Arc::clone(&driver);
                let params = params.clone();
                let handle = tokio::spawn(async move { driver.connect(&params).await });
                lifecycle.pending.push((index, handle));
            }

            lifecycle.state = if lifecycle.pending.is_empty() {
                ConnState::Connected
            } else {
                ConnState::Connecting
            };
            (lifecycle.state, stale)
        };

        info!(
            vendor = driver.name(),
            host = %params.host,
            database = %params.database,
            pool_size = self.pool.size(),
            state = %state,
            "database probe succeeded"
        );

        close_all(stale).await;
        Ok(state)
    }

    /// Advance pending handshakes without blocking and report the state.
    pub fn poll_status(&self) -> ConnState {
        let mut lifecycle = self.lifecycle.lock();

        if self.driver.is_none() {
            lifecycle.state = ConnState::InvalidDb;
            return lifecycle.state;
        }
        if lifecycle.state != ConnState::Connecting {
            return lifecycle.state;
        }

        let mut still_pending = Vec::with_capacity(lifecycle.pending.len());
        let mut failure = None;

        for (index, mut handle) in lifecycle.pending.drain(..) {
            if failure.is_some() || !handle.is_finished() {
                still_pending.push((index, handle));
                continue;
            }
            // A finished task can still report pending when the caller's
            // cooperative budget is spent; keep it for the next poll.
            match (&mut handle).now_or_never() {
                None => still_pending.push((index, handle)),
                Some(Ok(Ok(conn))) => {
                    if let Err(e) = self.pool.install(index, conn) {
                        failure = Some(e.to_string());
                    } else {
                        debug!(index, "pooled connection ready");
                    }
                }
                Some(Ok(Err(e))) => failure = Some(e.to_string()),
                Some(Err(join_error)) => failure = Some(join_error.to_string()),
            }
        }
        lifecycle.pending = still_pending;

        if let Some(reason) = failure {
            error!(error = %reason, "pooled connection handshake failed");
            lifecycle.abort_pending();
            lifecycle.state = ConnState::FailedConnection;
        } else if lifecycle.pending.is_empty() {
            info!(pool_size = self.pool.size(), "database connected");
            lifecycle.state = ConnState::Connected;
        }

        lifecycle.state
    }

    /// Current state without advancing any handshake.
    pub fn state(&self) -> ConnState {
        self.lifecycle.lock().state
    }

    /// Tear the pool down and return to `not_connected`.
    ///
    /// Refused while any lease is outstanding or a probe is in flight.
    pub async fn shutdown(&self) -> Result<()> {
        let drained = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.probing {
                return Err(DbError::PoolError(
                    "cannot shut down while connecting".to_string(),
                ));
            }
            let drained = self.pool.drain()?;
            lifecycle.abort_pending();
            if lifecycle.state != ConnState::InvalidDb {
                lifecycle.state = ConnState::NotConnected;
            }
            drained
        };

        let closed = drained.len();
        close_all(drained).await;
        info!(closed, "database shut down");
        Ok(())
    }

    /// `(available, size)` of the connection pool.
    pub fn pool_status(&self) -> (usize, usize) {
        (self.pool.available(), self.pool.size())
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn vendor(&self) -> Vendor {
        self.config.vendor
    }

    /// Vendor name used in result messages.
    pub fn vendor_name(&self) -> &'static str {
        self.driver.as_ref().map(|d| d.name()).unwrap_or("Invalid")
    }

    pub(crate) fn driver(&self) -> Option<&Arc<dyn Driver>> {
        self.driver.as_ref()
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.lifecycle.get_mut().abort_pending();
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("vendor", &self.config.vendor)
            .field("state", &self.state())
            .field("pool", &self.pool)
            .finish()
    }
}

async fn close_all(conns: Vec<Box<dyn Connection>>) {
    for mut conn in conns {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing connection");
        }
    }
}
