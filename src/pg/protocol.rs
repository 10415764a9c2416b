//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Covers the subset of the v3 protocol this driver speaks: startup and
//! authentication, the simple and extended query flows with text-format
//! values, and enough of the COPY sub-protocol to refuse or drain it.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_i16(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Write a tagged frame: type byte, then a length prefix covering itself
/// and whatever `body` appends.
fn frame(tag: u8, body: impl FnOnce(&mut BytesMut)) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(tag);
    buf.put_i32(0);
    body(&mut buf);
    let len = (buf.len() - 1) as i32;
    buf[1..5].copy_from_slice(&len.to_be_bytes());
    buf
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        // The startup packet is the one message without a type byte.
        let mut buf = BytesMut::new();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstr(&mut buf, "user");
        put_cstr(&mut buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstr(&mut buf, "database");
            put_cstr(&mut buf, db);
        }

        for (key, value) in &self.options {
            put_cstr(&mut buf, key);
            put_cstr(&mut buf, value);
        }

        buf.put_u8(0);

        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        frame(b'p', |b| put_cstr(b, &self.password))
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'Q', |b| put_cstr(b, self.query))
    }
}

/// Parse message ('P'). An empty `param_types` lets the server infer every
/// parameter type from the statement.
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in &self.param_types {
                b.put_u32(oid.as_u32());
            }
        })
    }
}

/// Bind message ('B') carrying text-format parameters.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [String],
    pub result_format: Format,
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'B', |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);

            // One format code applies to every parameter.
            b.put_i16(1);
            b.put_i16(Format::Text as i16);

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                b.put_i32(param.len() as i32);
                b.put_slice(param.as_bytes());
            }

            b.put_i16(1);
            b.put_i16(self.result_format as i16);
        })
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        })
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        })
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        frame(b'S', |_| {})
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        frame(b'X', |_| {})
    }
}

/// CopyFail message ('f') - Abort a COPY FROM STDIN
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub reason: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'f', |b| put_cstr(b, self.reason))
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'p', |b| {
            put_cstr(b, self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(self.data);
        })
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode(&self) -> BytesMut {
        frame(b'p', |b| b.put_slice(self.data))
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// One column of a RowDescription. Table OID, attribute number, type size
/// and modifier are skipped on the wire.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: Oid,
    pub format: Format,
}

/// Messages the driver understands from the server.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    NoData,

    /// Column counts only; per-column formats are ignored.
    CopyInResponse { columns: i16 },
    CopyOutResponse { columns: i16 },
    CopyBothResponse { columns: i16 },
    CopyData,
    CopyDone,

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    /// Asynchronous NOTIFY delivery on a channel this session LISTENs on.
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Decode one complete frame (type byte, length, body) from the front of
    /// `buf`, advancing past it.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let tag = buf.get_u8();
        let body_len = usize::try_from(buf.get_i32())
            .ok()
            .and_then(|len| len.checked_sub(4))
            .ok_or_else(|| PgError::Protocol("Invalid message length".to_string()))?;
        if buf.remaining() < body_len {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }
        let mut body = buf.split_to(body_len);

        let msg = match tag {
            b'R' => Self::decode_auth(body)?,
            b'T' => Self::decode_row_description(body)?,
            b'D' => Self::decode_data_row(body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: read_cstring(&mut body)?,
            },
            b'I' => BackendMessage::EmptyQueryResponse,
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'n' => BackendMessage::NoData,
            b'G' => BackendMessage::CopyInResponse {
                columns: copy_columns(&body)?,
            },
            b'H' => BackendMessage::CopyOutResponse {
                columns: copy_columns(&body)?,
            },
            b'W' => BackendMessage::CopyBothResponse {
                columns: copy_columns(&body)?,
            },
            b'd' => BackendMessage::CopyData,
            b'c' => BackendMessage::CopyDone,
            b'Z' => {
                need(&body, 1)?;
                BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from(body.get_u8()),
                }
            }
            b'S' => BackendMessage::ParameterStatus {
                name: read_cstring(&mut body)?,
                value: read_cstring(&mut body)?,
            },
            b'K' => {
                need(&body, 8)?;
                BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                }
            }
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            },
            b'A' => {
                need(&body, 4)?;
                BackendMessage::NotificationResponse {
                    process_id: body.get_i32(),
                    channel: read_cstring(&mut body)?,
                    payload: read_cstring(&mut body)?,
                }
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message type: {:?}",
                    other as char
                )))
            }
        };

        Ok(msg)
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        need(&body, 4)?;

        match body.get_i32() {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(&body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                // Mechanism names, closed by an empty string.
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    match read_cstring(&mut body)? {
                        mech if mech.is_empty() => break,
                        mech => mechanisms.push(mech),
                    }
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            method => Err(PgError::Auth(format!(
                "Unsupported authentication method: {}",
                method
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        let count = read_count(&mut body)?;
        let mut fields = Vec::with_capacity(count);

        for _ in 0..count {
            let name = read_cstring(&mut body)?;
            need(&body, 18)?;
            body.advance(6); // table oid, attribute number
            let type_oid = Oid::from_u32(body.get_u32());
            body.advance(6); // type size, type modifier
            let format = Format::from_i16(body.get_i16());
            fields.push(FieldDescription {
                name,
                type_oid,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        let count = read_count(&mut body)?;
        let mut values = Vec::with_capacity(count);

        for _ in 0..count {
            need(&body, 4)?;
            // A negative length marks NULL.
            let value = match usize::try_from(body.get_i32()) {
                Ok(len) => {
                    need(&body, len)?;
                    Some(body.split_to(len))
                }
                Err(_) => None,
            };
            values.push(value);
        }

        Ok(BackendMessage::DataRow { values })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(body: &Bytes, n: usize) -> PgResult<()> {
    if body.remaining() < n {
        return Err(PgError::Protocol(format!(
            "Message body too short: need {} bytes, have {}",
            n,
            body.remaining()
        )));
    }
    Ok(())
}

/// Int16 element count; negative counts read as zero.
fn read_count(body: &mut Bytes) -> PgResult<usize> {
    need(body, 2)?;
    Ok(body.get_i16().max(0) as usize)
}

/// Column count of a Copy{In,Out,Both}Response (after the overall format byte).
fn copy_columns(body: &Bytes) -> PgResult<i16> {
    need(body, 3)?;
    Ok(i16::from_be_bytes([body[1], body[2]]))
}

/// Read a null-terminated string; invalid UTF-8 is replaced, not rejected.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

/// Error and notice fields: (code byte, string) pairs closed by a zero byte.
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        match body.get_u8() {
            0 => break,
            code => {
                fields.insert(code, read_cstring(&mut body)?);
            }
        }
    }

    Ok(fields)
}
