//! Failures raised by the PostgreSQL driver.

use std::collections::HashMap;
use std::io;

use thiserror::Error;

use crate::error::DbError;

pub type PgResult<T> = Result<T, PgError>;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("socket: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected backend traffic.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication: {0}")]
    Auth(String),

    /// An ErrorResponse, already rendered in libpq form.
    #[error("{text}")]
    Server { sqlstate: String, text: String },

    #[error("server closed the connection")]
    ConnectionClosed,
}

impl PgError {
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        PgError::Server {
            sqlstate: fields.get(&b'C').cloned().unwrap_or_default(),
            text: render_server_error(fields),
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            PgError::Server { sqlstate, .. } => Some(sqlstate),
            _ => None,
        }
    }
}

/// Render ErrorResponse fields the way libpq prints them:
/// `SEVERITY:  message`, then `DETAIL:` and `HINT:` lines when present.
pub fn render_server_error(fields: &HashMap<u8, String>) -> String {
    let severity = fields
        .get(&b'S')
        .or_else(|| fields.get(&b'V'))
        .map(String::as_str)
        .unwrap_or("ERROR");
    let message = fields.get(&b'M').map(String::as_str).unwrap_or_default();

    let mut text = format!("{}:  {}", severity, message);
    for (code, label) in [(b'D', "DETAIL"), (b'H', "HINT")] {
        if let Some(extra) = fields.get(&code) {
            text.push_str(&format!("\n{}:  {}", label, extra));
        }
    }
    text
}

impl From<PgError> for DbError {
    fn from(e: PgError) -> Self {
        match e {
            PgError::Protocol(msg) => DbError::NoResponse(msg),
            other => DbError::ConnectionError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn fields(pairs: &[(u8, &str)]) -> HashMap<u8, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_render_like_libpq() {
        let f = fields(&[
            (b'S', "ERROR"),
            (b'C', "23505"),
            (b'M', "duplicate key value violates unique constraint \"pessoas_apelido_key\""),
            (b'D', "Key (apelido)=(josé) already exists."),
        ]);
        assert_eq!(
            render_server_error(&f),
            "ERROR:  duplicate key value violates unique constraint \"pessoas_apelido_key\"\n\
             DETAIL:  Key (apelido)=(josé) already exists."
        );
    }

    #[test]
    fn test_render_with_hint_and_missing_severity() {
        let f = fields(&[(b'V', "FATAL"), (b'M', "boom"), (b'H', "try again")]);
        assert_eq!(render_server_error(&f), "FATAL:  boom\nHINT:  try again");
    }

    #[test]
    fn test_into_db_error() {
        let missing_db = PgError::from_fields(&fields(&[
            (b'S', "FATAL"),
            (b'C', "3D000"),
            (b'M', "database \"nope\" does not exist"),
        ]));
        assert_eq!(missing_db.sqlstate(), Some("3D000"));
        assert_eq!(
            missing_db.to_string(),
            "FATAL:  database \"nope\" does not exist"
        );
        assert_eq!(DbError::from(missing_db).code(), ErrorCode::ConnectionError);

        let auth = PgError::Auth("password required".to_string());
        assert_eq!(DbError::from(auth).code(), ErrorCode::ConnectionError);

        let framing = PgError::Protocol("bad frame".to_string());
        assert_eq!(DbError::from(framing).code(), ErrorCode::Unknown);
    }
}
