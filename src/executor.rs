//! Query execution.
//!
//! `exec` always hands back a [`ResultSet`]: every failure is folded into its
//! code and message. Exactly one lease is taken per call and it is returned
//! before classification starts.

use tracing::{debug, warn};

use crate::database::{ConnState, Database};
use crate::decoder;
use crate::driver::{Driver, RawResponse};
use crate::error::{format_message, ErrorCode, Result};
use crate::param::{marshal, Param};
use crate::pool::Lease;
use crate::result::ResultSet;

/// Pool acquisition attempts before a query fails with `unknown`.
pub const ACQUIRE_ATTEMPTS: usize = 5;

impl Database {
    /// Execute `query` with `params` on one pooled connection.
    ///
    /// With no parameters the plain query form is used, otherwise the
    /// parameterized form with the marshaled text values.
    pub async fn exec(&self, query: &str, params: &[Param]) -> ResultSet {
        let vendor = self.vendor_name();

        let Some(driver) = self.driver() else {
            return ResultSet::error(
                ErrorCode::InvalidDb,
                format_message("Invalid database vendor", vendor, &self.vendor().to_string()),
            );
        };

        let state = self.state();
        if state != ConnState::Connected {
            return ResultSet::error(
                ErrorCode::ConnectionError,
                format_message("Database not connected", vendor, state.as_str()),
            );
        }

        // Marshal before leasing so a bad parameter never holds a connection.
        let wire = match marshal(params) {
            Ok(wire) => wire,
            Err(e) => {
                debug!(error = %e, "rejected query parameters");
                return ResultSet::error(
                    e.code(),
                    format_message("Query has invalid param", vendor, &e.to_string()),
                );
            }
        };

        let Some(mut lease) = self.acquire().await else {
            let (available, size) = self.pool_status();
            warn!(available, size, "connection pool exhausted");
            return ResultSet::error(
                ErrorCode::Unknown,
                format_message(
                    "Fatal error",
                    vendor,
                    &format!(
                        "no connection after {} attempts: {} available of {} connections",
                        ACQUIRE_ATTEMPTS, available, size
                    ),
                ),
            );
        };

        if !lease.is_healthy() {
            if let Err(e) = self.reconnect(driver.as_ref(), &mut lease).await {
                self.pool().release(lease);
                return ResultSet::error(
                    ErrorCode::ConnectionError,
                    format_message("Database connection lost", vendor, &e.to_string()),
                );
            }
        }

        debug!(
            slot = lease.index(),
            params = wire.len(),
            "executing query"
        );
        let response = lease.execute(query, &wire).await;
        self.pool().release(lease);

        classify(driver.as_ref(), response)
    }

    /// Replace a leased connection the backend has dropped.
    async fn reconnect(&self, driver: &dyn Driver, lease: &mut Lease) -> Result<()> {
        warn!(slot = lease.index(), "pooled connection closed, reconnecting");
        let conn = driver.connect(&self.config().connect_params()).await?;
        if let Some(mut dead) = lease.replace(conn) {
            let _ = dead.close().await;
        }
        debug!(slot = lease.index(), "pooled connection replaced");
        Ok(())
    }

    /// Non-blocking acquisition with a fixed attempt bound.
    async fn acquire(&self) -> Option<Lease> {
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            if let Some(lease) = self.pool().try_acquire() {
                return Some(lease);
            }
            warn!(attempt, max = ACQUIRE_ATTEMPTS, "no pooled connection available");
            tokio::task::yield_now().await;
        }
        None
    }
}

/// Turn a backend response into a result set.
pub(crate) fn classify(driver: &dyn Driver, response: Result<RawResponse>) -> ResultSet {
    let vendor = driver.name();

    let raw = match response {
        Ok(raw) => raw,
        Err(e) => {
            return ResultSet::error(
                ErrorCode::Unknown,
                format_message("Query response was null", vendor, &e.to_string()),
            )
        }
    };

    let code = driver.map_status(raw.status);
    debug!(status = raw.status, code = %code, "classified response");

    match code {
        ErrorCode::Ok => {}
        ErrorCode::Processing => {
            return ResultSet::error(
                ErrorCode::Processing,
                format_message("Query is still processing", vendor, &raw.error_message),
            )
        }
        _ => return refine_error(driver, &raw.error_message),
    }

    let mut results = match decoder::decode(raw, |type_id| driver.map_type(type_id)) {
        Ok(results) => results,
        Err(e) => {
            return ResultSet::error(
                e.code(),
                format_message("Could not decode query result", vendor, &e.to_string()),
            )
        }
    };

    if results.entries_count() == 0 {
        results.set_outcome(
            ErrorCode::ZeroResults,
            format_message("Query returned 0 results", vendor, ""),
        );
    } else {
        results.set_outcome(
            ErrorCode::Ok,
            format_message("Query executed successfully", vendor, ""),
        );
    }
    results
}

/// First matching pattern wins; otherwise the error stays fatal.
fn refine_error(driver: &dyn Driver, text: &str) -> ResultSet {
    let (code, summary) = driver
        .error_patterns()
        .iter()
        .find(|(needle, _, _)| text.contains(needle))
        .map(|(_, code, summary)| (*code, *summary))
        .unwrap_or((ErrorCode::Unknown, "Fatal error"));

    ResultSet::error(code, format_message(summary, driver.name(), text))
}
