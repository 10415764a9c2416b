//! [`Driver`] implementation for PostgreSQL.

use async_trait::async_trait;

use super::connection::PgConnection;
use super::types::{cell_type_for, ExecStatus, Oid};
use crate::driver::{ConnectParams, Connection, Driver, ErrorPattern};
use crate::error::{ErrorCode, Result};
use crate::types::CellType;

/// Refinements for fatal error text, checked in order.
const ERROR_PATTERNS: &[ErrorPattern] = &[
    (
        "invalid input syntax",
        ErrorCode::InvalidType,
        "Query has invalid param syntax",
    ),
    (
        "violates unique constraint",
        ErrorCode::UniqueViolation,
        "Entry already in database",
    ),
    ("too long", ErrorCode::InvalidRange, "Invalid range for field"),
    ("too short", ErrorCode::InvalidRange, "Invalid range for field"),
];

/// PostgreSQL over the native v3 wire protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "Postgres 15"
    }

    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>> {
        let conn = PgConnection::connect(params).await?;
        Ok(Box::new(conn))
    }

    fn map_status(&self, status: i32) -> ErrorCode {
        ExecStatus::from_i32(status)
            .map(ExecStatus::error_code)
            .unwrap_or(ErrorCode::Unknown)
    }

    fn map_type(&self, type_id: u32) -> CellType {
        cell_type_for(Oid::from_u32(type_id))
    }

    fn error_patterns(&self) -> &'static [ErrorPattern] {
        ERROR_PATTERNS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let d = PostgresDriver;
        assert_eq!(d.map_status(ExecStatus::TuplesOk.as_i32()), ErrorCode::Ok);
        assert_eq!(d.map_status(ExecStatus::CopyIn.as_i32()), ErrorCode::Processing);
        assert_eq!(d.map_status(ExecStatus::FatalError.as_i32()), ErrorCode::Unknown);
        assert_eq!(d.map_status(42), ErrorCode::Unknown);
    }

    #[test]
    fn test_pattern_order() {
        let needles: Vec<_> = PostgresDriver
            .error_patterns()
            .iter()
            .map(|(needle, _, _)| *needle)
            .collect();
        assert_eq!(
            needles,
            ["invalid input syntax", "violates unique constraint", "too long", "too short"]
        );
    }
}
