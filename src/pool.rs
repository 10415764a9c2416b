//! Fixed-size connection pool.
//!
//! The pool owns one slot per connection. A slot is either waiting for its
//! handshake, idle, or leased. Acquisition never waits: it either hands out
//! an exclusive [`Lease`] on an idle slot or reports that none is available.
//! The slot array and the checked-out counter share one mutex, so two callers
//! can never be handed the same slot.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::{Connection, RawResponse};
use crate::error::{DbError, Result};

// ============================================================================
// Slots
// ============================================================================

enum Slot {
    /// Not yet connected (handshake pending or pool drained).
    Pending,
    Idle(Box<dyn Connection>),
    Leased,
}

struct PoolState {
    slots: Vec<Slot>,
    checked_out: usize,
}

struct PoolInner {
    size: usize,
    state: Mutex<PoolState>,
}

impl PoolInner {
    /// Return a leased connection to its slot.
    ///
    /// Releasing into a fully available pool, or into a slot that is not
    /// leased, is a no-op so a caller bug cannot corrupt the counter.
    fn put_back(&self, index: usize, conn: Box<dyn Connection>) {
        let mut state = self.state.lock();

        if state.checked_out == 0 {
            warn!(index, "release into a fully available pool ignored");
            return;
        }

        match state.slots.get_mut(index) {
            Some(slot @ Slot::Leased) => {
                *slot = Slot::Idle(conn);
                state.checked_out -= 1;
                debug!(index, checked_out = state.checked_out, "connection released");
            }
            _ => warn!(index, "release of a slot that is not leased ignored"),
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive use of one pooled connection.
///
/// Dropping the lease returns the connection to its slot.
pub struct Lease {
    index: usize,
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
}

impl Lease {
    /// Slot index this lease holds.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Execute a query on the leased connection.
    pub async fn execute(&mut self, query: &str, params: &[String]) -> Result<RawResponse> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::ConnectionError("lease holds no connection".to_string()))?
            .execute(query, params)
            .await
    }

    /// Check if the leased connection is still open.
    pub fn is_healthy(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }

    /// Swap in a fresh connection, handing back the one it replaces.
    pub fn replace(&mut self, conn: Box<dyn Connection>) -> Option<Box<dyn Connection>> {
        self.conn.replace(conn)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(self.index, conn);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("index", &self.index).finish()
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A fixed-size pool of backend connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool of `size` slots, all pending.
    pub fn new(size: usize) -> Self {
        let slots = (0..size).map(|_| Slot::Pending).collect();
        Self {
            inner: Arc::new(PoolInner {
                size,
                state: Mutex::new(PoolState {
                    slots,
                    checked_out: 0,
                }),
            }),
        }
    }

    /// Place a freshly connected connection into a pending slot.
    pub fn install(&self, index: usize, conn: Box<dyn Connection>) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.slots.get_mut(index) {
            Some(slot @ Slot::Pending) => {
                *slot = Slot::Idle(conn);
                Ok(())
            }
            Some(_) => Err(DbError::PoolError(format!("slot {} is already filled", index))),
            None => Err(DbError::PoolError(format!(
                "slot {} out of range for pool of {}",
                index, self.inner.size
            ))),
        }
    }

    /// Lease an idle connection, or `None` if every connection is in use.
    pub fn try_acquire(&self) -> Option<Lease> {
        let mut state = self.inner.state.lock();

        let (index, conn) =
            state
                .slots
                .iter_mut()
                .enumerate()
                .find_map(|(index, slot)| match std::mem::replace(slot, Slot::Leased) {
                    Slot::Idle(conn) => Some((index, conn)),
                    other => {
                        *slot = other;
                        None
                    }
                })?;
        state.checked_out += 1;
        debug!(index, checked_out = state.checked_out, "connection acquired");

        Some(Lease {
            index,
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Return a lease to the pool.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    /// Take every connection out of the pool, leaving all slots pending.
    ///
    /// Fails without touching the pool while any lease is outstanding.
    pub fn drain(&self) -> Result<Vec<Box<dyn Connection>>> {
        let mut state = self.inner.state.lock();

        if state.checked_out > 0 {
            return Err(DbError::PoolError(format!(
                "cannot drain pool: {} of {} connections still leased",
                state.checked_out, self.inner.size
            )));
        }

        let drained = state
            .slots
            .iter_mut()
            .filter_map(|slot| match std::mem::replace(slot, Slot::Pending) {
                Slot::Idle(conn) => Some(conn),
                _ => None,
            })
            .collect();

        Ok(drained)
    }

    /// Total number of slots.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of idle connections ready to lease.
    pub fn available(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Idle(_)))
            .count()
    }

    /// Number of connections currently leased.
    pub fn checked_out(&self) -> usize {
        self.inner.state.lock().checked_out
    }

    #[cfg(test)]
    pub(crate) fn put_back_raw(&self, index: usize, conn: Box<dyn Connection>) {
        self.inner.put_back(index, conn);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}
