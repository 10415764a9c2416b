//! PostgreSQL backend over the native wire protocol.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Startup, authentication and the query round trips
//! - `scram`: SCRAM-SHA-256 client
//! - `types`: OID taxonomy and execution statuses
//! - `driver`: The [`Driver`](crate::driver::Driver) binding

pub mod connection;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod scram;
pub mod types;


pub use connection::PgConnection;
pub use driver::PostgresDriver;
pub use error::{PgError, PgResult};
pub use types::{ExecStatus, Oid};
