//! dbkit - a pooled, vendor-dispatched database access layer.
//!
//! A [`Database`] owns a fixed-size pool of backend connections shared by
//! many concurrent tasks. Queries run through [`Database::exec`], which leases
//! one connection, marshals typed [`Param`]s to wire text, and decodes the
//! response into an owned, typed [`ResultSet`]. Every failure is reported
//! through the result set's [`ErrorCode`]; `exec` itself never fails.
//!
//! ```no_run
//! use dbkit::{ConnState, Database, DbConfig, ErrorCode, Param, Vendor};
//!
//! # async fn run() -> dbkit::Result<()> {
//! let config = DbConfig::new(Vendor::Postgres15, "localhost", "rinha", "postgres")
//!     .password("postgres")
//!     .pool_size(4);
//! let db = Database::create(config)?;
//!
//! db.connect().await?;
//! while !db.poll_status().is_terminal() {
//!     tokio::task::yield_now().await;
//! }
//! assert_eq!(db.state(), ConnState::Connected);
//!
//! let rs = db
//!     .exec("SELECT nome, stack FROM pessoas WHERE apelido = $1", &[Param::new("josé")])
//!     .await;
//! match rs.code() {
//!     ErrorCode::Ok => println!("{}", rs.to_json(true)),
//!     ErrorCode::ZeroResults => println!("not found"),
//!     other => eprintln!("{}: {}", other, rs.message()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Only PostgreSQL is implemented, over its native wire protocol (see [`pg`]).
//! Other backends plug in by implementing [`Driver`].

mod config;
mod database;
mod decoder;
mod driver;
mod error;
mod executor;
mod param;
pub mod pg;
mod pool;
mod result;
mod types;

#[cfg(test)]
mod tests;

pub use config::{DbConfig, DEFAULT_POOL_SIZE};
pub use database::{ConnState, Database};
pub use decoder::{decode, decode_cell, parse_array};
pub use driver::{
    driver_for, ConnectParams, Connection, Driver, ErrorPattern, RawColumn, RawResponse, Vendor,
};
pub use error::{format_message, DbError, ErrorCode, Result, MAX_MESSAGE_LEN};
pub use executor::ACQUIRE_ATTEMPTS;
pub use param::{marshal, Param, ParamValue, Value, WireParams};
pub use pool::{ConnectionPool, Lease};
pub use result::{Cell, ResultSet};
pub use types::{BaseType, CellType};
