//! Vendor dispatch surface.
//!
//! Every backend implements [`Driver`] (handshake, status and type tables) and
//! hands out boxed [`Connection`]s. Drivers are looked up through a small
//! capability table keyed by [`Vendor`]; adding a vendor means registering one
//! more implementation here, not editing the executor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result};
use crate::pg::PostgresDriver;
use crate::types::CellType;

// ============================================================================
// Vendor
// ============================================================================

/// Backend database product a handle talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    Postgres,
    Postgres15,
    MySql,
    Firebird,
    Cassandra,
}

impl Vendor {
    /// Port used when the configuration leaves it unset.
    pub fn default_port(self) -> u16 {
        match self {
            Vendor::Postgres | Vendor::Postgres15 => 5432,
            _ => 3306,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Vendor::Postgres => "postgres",
            Vendor::Postgres15 => "postgres15",
            Vendor::MySql => "mysql",
            Vendor::Firebird => "firebird",
            Vendor::Cassandra => "cassandra",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Driver / Connection traits
// ============================================================================

/// Already-resolved connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Role assumed after authentication; empty for none.
    pub role: String,
}

/// Column descriptor as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    /// Backend-native type descriptor (an OID for Postgres).
    pub type_id: u32,
}

/// A complete backend response in text form, before classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResponse {
    /// Backend-native status, interpreted by [`Driver::map_status`].
    pub status: i32,
    /// Backend error text; empty on success.
    pub error_message: String,
    pub columns: Vec<RawColumn>,
    /// `None` marks a backend-reported null.
    pub rows: Vec<Vec<Option<String>>>,
}

/// A live backend connection, used by exactly one lease holder at a time.
#[async_trait]
pub trait Connection: Send {
    /// Run `query` verbatim. An empty `params` selects the plain form,
    /// otherwise the parameterized form with text-encoded values.
    ///
    /// `Err` means no response object was produced (transport failure).
    async fn execute(&mut self, query: &str, params: &[String]) -> Result<RawResponse>;

    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Substring refinement entry: `(needle, code, summary)`.
pub type ErrorPattern = (&'static str, ErrorCode, &'static str);

/// One backend implementation.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Human-readable vendor name used in messages.
    fn name(&self) -> &'static str;

    /// Open and fully authenticate one connection.
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>>;

    /// Fixed status table: native status to `Ok`, `Processing` or `Unknown` (fatal).
    fn map_status(&self, status: i32) -> ErrorCode;

    /// Native column descriptor to the shared taxonomy; unknown ones map to
    /// [`CellType::Invalid`].
    fn map_type(&self, type_id: u32) -> CellType;

    /// Ordered refinements applied to fatal error text; first match wins.
    fn error_patterns(&self) -> &'static [ErrorPattern];
}

// ============================================================================
// Capability table
// ============================================================================

static REGISTRY: Lazy<HashMap<Vendor, Arc<dyn Driver>>> = Lazy::new(|| {
    let postgres: Arc<dyn Driver> = Arc::new(PostgresDriver);
    let mut table = HashMap::new();
    table.insert(Vendor::Postgres, Arc::clone(&postgres));
    table.insert(Vendor::Postgres15, postgres);
    table
});

/// Driver registered for `vendor`, if any.
pub fn driver_for(vendor: Vendor) -> Option<Arc<dyn Driver>> {
    REGISTRY.get(&vendor).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        assert!(driver_for(Vendor::Postgres).is_some());
        assert!(driver_for(Vendor::Postgres15).is_some());
        assert!(driver_for(Vendor::MySql).is_none());
        assert!(driver_for(Vendor::Cassandra).is_none());
    }

    #[test]
    fn test_postgres_tags_share_one_driver() {
        let a = driver_for(Vendor::Postgres).unwrap();
        let b = driver_for(Vendor::Postgres15).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "Postgres 15");
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Vendor::Postgres.default_port(), 5432);
        assert_eq!(Vendor::MySql.default_port(), 3306);
    }
}
