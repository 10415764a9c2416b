//! PostgreSQL connection implementation.
//!
//! Handles:
//! - TCP connection establishment and the startup handshake
//! - Cleartext, MD5 and SCRAM-SHA-256 authentication
//! - Optional `SET ROLE` after authentication
//! - Simple and extended (unnamed statement, text format) query flows
//!
//! Every query runs to `ReadyForQuery` before returning, so a connection is
//! always left idle and reusable. Server errors are reported inside the
//! [`RawResponse`]; only transport failures surface as `Err`.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::debug;

use super::error::{render_server_error, PgError, PgResult};
use super::protocol::*;
use super::scram::{self, ScramSession};
use super::types::ExecStatus;
use crate::driver::{ConnectParams, Connection, RawColumn, RawResponse};

const APPLICATION_NAME: &str = "dbkit";

// ============================================================================
// Response collection
// ============================================================================

/// Accumulates backend messages for one round trip, keeping only the last
/// statement's result the way libpq's `PQexec` does.
#[derive(Default)]
struct Pending {
    status: Option<ExecStatus>,
    /// COPY status wins over whatever the refused/drained copy reports after.
    copy: Option<ExecStatus>,
    columns: Vec<RawColumn>,
    rows: Vec<Vec<Option<String>>>,
    described: bool,
    error: Option<HashMap<u8, String>>,
}

impl Pending {
    fn describe(&mut self, fields: Vec<FieldDescription>) {
        self.columns = fields
            .into_iter()
            .map(|f| RawColumn {
                name: f.name,
                type_id: f.type_oid.as_u32(),
            })
            .collect();
        self.rows.clear();
        self.described = true;
    }

    fn push_row(&mut self, values: Vec<Option<Bytes>>) {
        let row = values
            .into_iter()
            .map(|v| v.map(|b| String::from_utf8_lossy(&b).into_owned()))
            .collect();
        self.rows.push(row);
    }

    fn complete(&mut self) {
        if self.described {
            self.status = Some(ExecStatus::TuplesOk);
        } else {
            self.columns.clear();
            self.rows.clear();
            self.status = Some(ExecStatus::CommandOk);
        }
        self.described = false;
    }

    fn empty(&mut self) {
        self.columns.clear();
        self.rows.clear();
        self.described = false;
        self.status = Some(ExecStatus::EmptyQuery);
    }

    fn fail(&mut self, fields: HashMap<u8, String>) {
        self.columns.clear();
        self.rows.clear();
        self.described = false;
        self.status = Some(ExecStatus::FatalError);
        self.error = Some(fields);
    }

    fn finish(self) -> RawResponse {
        let status = self
            .copy
            .or(self.status)
            .unwrap_or(ExecStatus::EmptyQuery);
        RawResponse {
            status: status.as_i32(),
            error_message: self
                .error
                .as_ref()
                .map(render_server_error)
                .unwrap_or_default(),
            columns: self.columns,
            rows: self.rows,
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    transaction_status: TransactionStatus,
    backend_pid: i32,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    closed: bool,
    read_buffer: BytesMut,
}

impl PgConnection {
    /// Connect, authenticate and assume the configured role.
    pub async fn connect(params: &ConnectParams) -> PgResult<Self> {
        let addr = format!("{}:{}", params.host, params.port);
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = tokio::io::split(stream);

        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            transaction_status: TransactionStatus::Idle,
            backend_pid: 0,
            parameters: HashMap::new(),
            closed: false,
            read_buffer: BytesMut::with_capacity(32768),
        };

        conn.startup(params).await?;

        if !params.role.is_empty() {
            conn.set_role(&params.role).await?;
        }

        debug!(
            host = %params.host,
            port = params.port,
            pid = conn.backend_pid,
            "postgres connection established"
        );
        Ok(conn)
    }

    async fn startup(&mut self, params: &ConnectParams) -> PgResult<()> {
        let startup = StartupMessage {
            user: params.user.clone(),
            database: Some(params.database.clone()),
            options: vec![
                ("application_name".to_string(), APPLICATION_NAME.to_string()),
                ("client_encoding".to_string(), "UTF8".to_string()),
            ],
        };
        self.send_message(&startup).await?;

        let mut sasl: Option<ScramSession> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = required_password(params)?;
                    self.send_message(&PasswordMessage {
                        password: password.to_string(),
                    })
                    .await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    let password = required_password(params)?;
                    let hash = md5_password(&params.user, password, &salt);
                    self.send_message(&PasswordMessage { password: hash }).await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(PgError::Auth(format!(
                            "Server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let session = ScramSession::new(&params.user, required_password(params)?);
                    let first = session.client_first();
                    self.send_message(&SaslInitialResponseMessage {
                        mechanism: scram::MECHANISM,
                        data: &first,
                    })
                    .await?;
                    sasl = Some(session);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let session = sasl
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL challenge before SASL start".into()))?;
                    let client_final = session.client_final(&data)?;
                    self.send_message(&SaslResponseMessage {
                        data: &client_final,
                    })
                    .await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    sasl
                        .as_mut()
                        .ok_or_else(|| PgError::Protocol("SASL final before SASL start".into()))?
                        .verify_server(&data)?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                _ => {}
            }
        }
    }

    async fn set_role(&mut self, role: &str) -> PgResult<()> {
        let statement = format!("SET ROLE {}", quote_identifier(role));
        self.send_message(&QueryMessage { query: &statement }).await?;
        let pending = self.collect().await?;
        match pending.error {
            Some(fields) => Err(PgError::from_fields(&fields)),
            None => Ok(()),
        }
    }

    /// Run `query` with the simple query protocol. With several statements
    /// the last one's result is reported.
    pub async fn simple_query(&mut self, query: &str) -> PgResult<RawResponse> {
        self.ensure_open()?;
        let result = self.simple_round_trip(query).await;
        self.mark_broken_on(&result);
        result
    }

    /// Run `query` as an unnamed extended-protocol statement with
    /// text-format parameters and results.
    pub async fn query(&mut self, query: &str, params: &[String]) -> PgResult<RawResponse> {
        self.ensure_open()?;
        let result = self.extended_round_trip(query, params).await;
        self.mark_broken_on(&result);
        result
    }

    async fn simple_round_trip(&mut self, query: &str) -> PgResult<RawResponse> {
        self.send_message(&QueryMessage { query }).await?;
        Ok(self.collect().await?.finish())
    }

    async fn extended_round_trip(&mut self, query: &str, params: &[String]) -> PgResult<RawResponse> {
        if params.len() > i16::MAX as usize {
            return Err(PgError::Protocol(format!(
                "too many parameters: {}",
                params.len()
            )));
        }

        self.buffer_message(&ParseMessage {
            name: "",
            query,
            param_types: Vec::new(),
        })
        .await?;
        self.buffer_message(&BindMessage {
            portal: "",
            statement: "",
            params,
            result_format: Format::Text,
        })
        .await?;
        self.buffer_message(&DescribeMessage { kind: b'P', name: "" })
            .await?;
        self.buffer_message(&ExecuteMessage {
            portal: "",
            max_rows: 0,
        })
        .await?;
        self.buffer_message(&SyncMessage).await?;
        self.flush().await?;

        Ok(self.collect().await?.finish())
    }

    /// Read until ReadyForQuery.
    async fn collect(&mut self) -> PgResult<Pending> {
        let mut pending = Pending::default();

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { fields } => pending.describe(fields),
                BackendMessage::DataRow { values } => pending.push_row(values),
                BackendMessage::CommandComplete { .. } => pending.complete(),
                BackendMessage::EmptyQueryResponse => pending.empty(),
                BackendMessage::ErrorResponse { fields } => pending.fail(fields),
                BackendMessage::CopyInResponse { .. } => {
                    pending.copy = pending.copy.or(Some(ExecStatus::CopyIn));
                    self.send_message(&CopyFailMessage {
                        reason: "COPY FROM STDIN is not supported",
                    })
                    .await?;
                }
                BackendMessage::CopyOutResponse { .. } => {
                    pending.copy = pending.copy.or(Some(ExecStatus::CopyOut));
                }
                BackendMessage::CopyBothResponse { .. } => {
                    pending.copy = pending.copy.or(Some(ExecStatus::CopyBoth));
                    self.send_message(&CopyFailMessage {
                        reason: "COPY BOTH is not supported",
                    })
                    .await?;
                }
                BackendMessage::NoticeResponse { fields } => {
                    debug!(notice = %render_server_error(&fields), "postgres notice");
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    ..
                } => {
                    debug!(process_id, channel = %channel, "notification ignored");
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    return Ok(pending);
                }
                _ => {}
            }
        }
    }

    /// Close the connection.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;
        self.send_message(&TerminateMessage).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Get a server parameter reported during startup.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    fn ensure_open(&self) -> PgResult<()> {
        if self.closed {
            Err(PgError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    /// A transport or framing failure leaves the stream out of sync.
    fn mark_broken_on<T>(&mut self, result: &PgResult<T>) {
        if let Err(PgError::Io(_) | PgError::Protocol(_) | PgError::ConnectionClosed) = result {
            self.closed = true;
        }
    }

    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.buffer_message(msg).await?;
        self.flush().await
    }

    #[inline]
    async fn buffer_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.writer.write_all(&msg.encode()).await?;
        Ok(())
    }

    #[inline]
    async fn flush(&mut self) -> PgResult<()> {
        self.writer.flush().await?;
        Ok(())
    }

    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(len) = complete_frame_len(&self.read_buffer)? {
                let mut frame = self.read_buffer.split_to(len).freeze();
                return BackendMessage::decode(&mut frame);
            }

            self.read_buffer.reserve(8192);
            if self.reader.read_buf(&mut self.read_buffer).await? == 0 {
                return Err(PgError::ConnectionClosed);
            }
        }
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&mut self, query: &str, params: &[String]) -> crate::error::Result<RawResponse> {
        let response = if params.is_empty() {
            self.simple_query(query).await?
        } else {
            self.query(query, params).await?
        };
        Ok(response)
    }

    async fn close(&mut self) -> crate::error::Result<()> {
        PgConnection::close(self).await?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn required_password(params: &ConnectParams) -> PgResult<&str> {
    if params.password.is_empty() {
        Err(PgError::Auth("Password required".to_string()))
    } else {
        Ok(&params.password)
    }
}

/// Length of the first frame in `buf` once it is fully buffered.
fn complete_frame_len(buf: &BytesMut) -> PgResult<Option<usize>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let declared = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if declared < 4 {
        return Err(PgError::Protocol(format!("invalid frame length {}", declared)));
    }
    // The length counts itself but not the type byte.
    let total = 1 + declared as usize;
    Ok((buf.len() >= total).then_some(total))
}

/// `"md5" + md5(md5(password + user) + salt)`
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = Vec::with_capacity(inner.len() + salt.len());
    outer.extend_from_slice(inner.as_bytes());
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}

/// Double-quote an identifier, doubling embedded quotes.
fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
