//! End-to-end tests for the handle, pool and executor against a scripted
//! in-memory backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::DbConfig;
use crate::database::{ConnState, Database};
use crate::driver::{ConnectParams, Connection, Driver, ErrorPattern, RawColumn, RawResponse, Vendor};
use crate::error::{DbError, ErrorCode, Result};
use crate::param::Param;
use crate::pg::{ExecStatus, Oid, PostgresDriver};
use crate::types::CellType;

// ============================================================================
// Scripted backend
// ============================================================================

#[derive(Default)]
struct Script {
    /// Handshake number (0-based) that is refused.
    fail_handshake: Option<usize>,
    handshakes: AtomicUsize,
    queries: AtomicUsize,
    closed: AtomicUsize,
    in_use: Mutex<HashSet<usize>>,
    peak: AtomicUsize,
}

struct MockDriver {
    script: Arc<Script>,
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "Mock"
    }

    async fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn Connection>> {
        let id = self.script.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_handshake == Some(id) {
            return Err(DbError::ConnectionError(format!("handshake {} refused", id)));
        }
        Ok(Box::new(MockConnection {
            id,
            script: Arc::clone(&self.script),
            closed: false,
        }))
    }

    fn map_status(&self, status: i32) -> ErrorCode {
        PostgresDriver.map_status(status)
    }

    fn map_type(&self, type_id: u32) -> CellType {
        PostgresDriver.map_type(type_id)
    }

    fn error_patterns(&self) -> &'static [ErrorPattern] {
        PostgresDriver.error_patterns()
    }
}

struct MockConnection {
    id: usize,
    script: Arc<Script>,
    closed: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, query: &str, params: &[String]) -> Result<RawResponse> {
        self.script.queries.fetch_add(1, Ordering::SeqCst);
        {
            let mut in_use = self.script.in_use.lock();
            assert!(in_use.insert(self.id), "connection {} used twice", self.id);
            self.script.peak.fetch_max(in_use.len(), Ordering::SeqCst);
        }

        let response = respond(query, params).await;
        if query == "HANGUP" {
            self.closed = true;
        }

        self.script.in_use.lock().remove(&self.id);
        response
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.script.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

fn column(name: &str, oid: Oid) -> RawColumn {
    RawColumn {
        name: name.to_string(),
        type_id: oid.as_u32(),
    }
}

fn tuples(columns: Vec<RawColumn>, rows: Vec<Vec<Option<&str>>>) -> RawResponse {
    RawResponse {
        status: ExecStatus::TuplesOk.as_i32(),
        error_message: String::new(),
        columns,
        rows: rows
            .into_iter()
            .map(|row| row.into_iter().map(|v| v.map(str::to_string)).collect())
            .collect(),
    }
}

async fn respond(query: &str, params: &[String]) -> Result<RawResponse> {
    let response = match query {
        "SELECT id" => tuples(
            vec![column("id", Oid::INT4)],
            vec![vec![Some("1")], vec![Some("2")]],
        ),
        "SELECT nothing" => tuples(vec![column("id", Oid::INT4)], vec![]),
        "SELECT nulls" => tuples(
            vec![column("nascimento", Oid::DATE), column("nome", Oid::VARCHAR)],
            vec![vec![None, Some("x")]],
        ),
        "SELECT stack" => tuples(
            vec![column("stack", Oid::VARCHAR_ARRAY)],
            vec![vec![Some("{a,b,c}")], vec![Some("{}")]],
        ),
        "ECHO" => tuples(
            (0..params.len())
                .map(|i| column(&format!("p{}", i + 1), Oid::TEXT))
                .collect(),
            vec![params.iter().map(|p| Some(p.as_str())).collect()],
        ),
        "INSERT" => RawResponse {
            status: ExecStatus::FatalError.as_i32(),
            error_message: "ERROR:  duplicate key value violates unique constraint \"pessoas_apelido_key\"\n\
                            DETAIL:  Key (apelido)=(josé) already exists."
                .to_string(),
            ..Default::default()
        },
        "HANGUP" => return Err(DbError::NoResponse("server closed the connection".to_string())),
        "SLOW" => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tuples(vec![column("n", Oid::INT4)], vec![vec![Some("1")]])
        }
        "YIELD" => {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            tuples(vec![column("n", Oid::INT4)], vec![vec![Some("1")]])
        }
        other => RawResponse {
            status: ExecStatus::FatalError.as_i32(),
            error_message: format!("ERROR:  syntax error at or near \"{}\"", other),
            ..Default::default()
        },
    };
    Ok(response)
}

fn database(pool_size: usize, script: Script) -> (Arc<Database>, Arc<Script>) {
    let script = Arc::new(script);
    let config = DbConfig::new(Vendor::Postgres, "mock", "rinha", "postgres").pool_size(pool_size);
    let driver = Arc::new(MockDriver {
        script: Arc::clone(&script),
    });
    let db = Database::with_driver(config, driver).unwrap();
    (Arc::new(db), script)
}

async fn settle(db: &Database) -> ConnState {
    for _ in 0..1000 {
        let state = db.poll_status();
        if state.is_terminal() {
            return state;
        }
        tokio::task::yield_now().await;
    }
    db.state()
}

async fn connected(pool_size: usize) -> (Arc<Database>, Arc<Script>) {
    let (db, script) = database(pool_size, Script::default());
    db.connect().await.unwrap();
    assert_eq!(settle(&db).await, ConnState::Connected);
    (db, script)
}

// ============================================================================
// Connect / poll
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_connect_then_poll_until_connected() {
        let (db, script) = database(3, Script::default());
        assert_eq!(db.state(), ConnState::NotConnected);

        assert_eq!(db.connect().await.unwrap(), ConnState::Connecting);
        assert_eq!(settle(&db).await, ConnState::Connected);
        assert_eq!(db.pool_status(), (3, 3));
        assert_eq!(script.handshakes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_slot_pool_is_connected_after_probe() {
        let (db, _) = database(1, Script::default());
        assert_eq!(db.connect().await.unwrap(), ConnState::Connected);
        assert_eq!(db.poll_status(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let (db, script) = connected(2).await;
        assert_eq!(db.connect().await.unwrap(), ConnState::Connected);
        assert_eq!(script.handshakes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_probe() {
        let (db, _) = database(
            2,
            Script {
                fail_handshake: Some(0),
                ..Default::default()
            },
        );

        let err = db.connect().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConnectionError);
        assert_eq!(db.state(), ConnState::FailedConnection);
        assert_eq!(db.poll_status(), ConnState::FailedConnection);

        let rs = db.exec("SELECT id", &[]).await;
        assert_eq!(rs.code(), ErrorCode::ConnectionError);
        assert!(rs.message().contains("failed_connection"));
    }

    #[tokio::test]
    async fn test_failed_background_handshake() {
        let (db, script) = database(
            3,
            Script {
                fail_handshake: Some(2),
                ..Default::default()
            },
        );

        assert_eq!(db.connect().await.unwrap(), ConnState::Connecting);
        assert_eq!(settle(&db).await, ConnState::FailedConnection);

        // Reconnecting replaces whatever the failed attempt left behind.
        let closed_before = script.closed.load(Ordering::SeqCst);
        assert_eq!(db.connect().await.unwrap(), ConnState::Connecting);
        assert_eq!(settle(&db).await, ConnState::Connected);
        assert_eq!(db.pool_status(), (3, 3));
        assert!(script.closed.load(Ordering::SeqCst) > closed_before);
    }

    #[tokio::test]
    async fn test_unregistered_vendor_is_invalid_db() {
        let config = DbConfig::new(Vendor::MySql, "localhost", "rinha", "root");
        let db = Database::create(config).unwrap();

        let err = db.connect().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidDb);
        assert_eq!(db.state(), ConnState::InvalidDb);
        assert_eq!(db.poll_status(), ConnState::InvalidDb);

        let rs = db.exec("SELECT 1", &[]).await;
        assert_eq!(rs.code(), ErrorCode::InvalidDb);
        assert_eq!(rs.message(), "Invalid database vendor. (Invalid): mysql");
    }

    #[test]
    fn test_create_rejects_incomplete_config() {
        let config = DbConfig::new(Vendor::Postgres, "", "rinha", "postgres");
        assert!(Database::create(config).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_refused_while_leased() {
        let (db, script) = connected(2).await;

        let lease = db.pool().try_acquire().unwrap();
        assert!(db.shutdown().await.is_err());
        assert_eq!(db.state(), ConnState::Connected);

        db.pool().release(lease);
        db.shutdown().await.unwrap();
        assert_eq!(db.state(), ConnState::NotConnected);
        assert_eq!(db.pool_status(), (0, 2));
        assert_eq!(script.closed.load(Ordering::SeqCst), 2);

        let rs = db.exec("SELECT id", &[]).await;
        assert_eq!(rs.code(), ErrorCode::ConnectionError);
    }
}

// ============================================================================
// Query execution
// ============================================================================

mod execution {
    use super::*;

    #[tokio::test]
    async fn test_exec_before_connect() {
        let (db, script) = database(2, Script::default());
        let rs = db.exec("SELECT id", &[]).await;
        assert_eq!(rs.code(), ErrorCode::ConnectionError);
        assert_eq!(rs.message(), "Database not connected. (Mock): not_connected");
        assert_eq!(script.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rows() {
        let (db, _) = connected(2).await;
        let rs = db.exec("SELECT id", &[]).await;

        assert_eq!(rs.code(), ErrorCode::Ok);
        assert_eq!(rs.message(), "Query executed successfully. (Mock)");
        assert_eq!(rs.entries_count(), 2);
        assert_eq!(rs.fields(), ["id"]);
        assert_eq!(rs.read_integer(1, 0), Some(2));
        assert_eq!(db.pool_status(), (2, 2));
    }

    #[tokio::test]
    async fn test_zero_rows_is_zero_results() {
        let (db, _) = connected(1).await;
        let rs = db.exec("SELECT nothing", &[]).await;
        assert_eq!(rs.code(), ErrorCode::ZeroResults);
        assert_eq!(rs.fields_count(), 1);
        assert_eq!(rs.entries_count(), 0);
    }

    #[tokio::test]
    async fn test_unique_violation() {
        let (db, _) = connected(1).await;
        let rs = db.exec("INSERT", &[Param::new("josé")]).await;

        assert_eq!(rs.code(), ErrorCode::UniqueViolation);
        assert!(rs
            .message()
            .starts_with("Entry already in database. (Mock): ERROR:  duplicate key"));
        assert_eq!(rs.entries_count(), 0);

        let generic = db.exec("DELETE", &[]).await;
        assert_eq!(generic.code(), ErrorCode::Unknown);
        assert_ne!(generic.message(), rs.message());
    }

    #[tokio::test]
    async fn test_null_cells() {
        let (db, _) = connected(1).await;
        let rs = db.exec("SELECT nulls", &[]).await;

        assert_eq!(rs.code(), ErrorCode::Ok);
        assert!(rs.is_null(0, 0));
        assert!(rs.is_valid(0, 0));
        assert!(!rs.is_valid_and_not_null(0, 0));
        assert!(rs.is_valid_and_not_null(0, 1));
        assert_eq!(rs.read_string(0, 1), Some("x"));
    }

    #[tokio::test]
    async fn test_array_cells() {
        let (db, _) = connected(1).await;
        let rs = db.exec("SELECT stack", &[]).await;

        assert_eq!(rs.code(), ErrorCode::Ok);
        assert_eq!(
            rs.read_string_array(0, 0).unwrap(),
            ["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(rs.read_string_array(1, 0), Some(&[][..]));
        assert!(!rs.is_null(1, 0));
    }

    #[tokio::test]
    async fn test_params_reach_backend_as_text() {
        let (db, _) = connected(1).await;
        let params = [
            Param::new(7i32),
            Param::array(["a b", "c"]),
            Param::null(),
            Param::array([1.5f64, 2.0]),
        ];
        let rs = db.exec("ECHO", &params).await;

        assert_eq!(rs.code(), ErrorCode::Ok);
        assert_eq!(rs.read_string(0, 0), Some("7"));
        assert_eq!(rs.read_string(0, 1), Some("{\"a b\",c}"));
        assert_eq!(rs.read_string(0, 2), Some("null"));
        assert_eq!(rs.read_string(0, 3), Some("{1.5,2}"));
    }

    #[tokio::test]
    async fn test_invalid_param_never_leases() {
        let (db, script) = connected(1).await;
        let rs = db
            .exec("ECHO", &[Param::new(1i32), Param::array([Some("a"), None])])
            .await;

        assert_eq!(rs.code(), ErrorCode::InvalidType);
        assert_eq!(script.queries.load(Ordering::SeqCst), 0);
        assert_eq!(db.pool_status(), (1, 1));
    }

    #[tokio::test]
    async fn test_transport_failure_releases_connection() {
        let (db, _) = connected(1).await;
        let rs = db.exec("HANGUP", &[]).await;

        assert_eq!(rs.code(), ErrorCode::Unknown);
        assert!(rs.message().starts_with("Query response was null. (Mock)"));
        assert_eq!(db.pool_status(), (1, 1));
        assert_eq!(db.pool().checked_out(), 0);
    }

    #[tokio::test]
    async fn test_dropped_connection_is_replaced_on_next_exec() {
        let (db, script) = connected(1).await;
        let handshakes = script.handshakes.load(Ordering::SeqCst);

        let rs = db.exec("HANGUP", &[]).await;
        assert_eq!(rs.code(), ErrorCode::Unknown);

        for _ in 0..3 {
            let rs = db.exec("SELECT id", &[]).await;
            assert_eq!(rs.code(), ErrorCode::Ok, "{}", rs.message());
            assert_eq!(rs.entries_count(), 2);
        }
        assert_eq!(script.handshakes.load(Ordering::SeqCst), handshakes + 1);
        assert_eq!(db.pool_status(), (1, 1));
        assert_eq!(db.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_failed_reconnect_reports_connection_error() {
        // Handshake 0 is the probe that fills the only slot; 1 is the reconnect.
        let (db, _) = database(
            1,
            Script {
                fail_handshake: Some(1),
                ..Default::default()
            },
        );
        db.connect().await.unwrap();
        assert_eq!(settle(&db).await, ConnState::Connected);

        db.exec("HANGUP", &[]).await;
        let rs = db.exec("SELECT id", &[]).await;
        assert_eq!(rs.code(), ErrorCode::ConnectionError);
        assert!(rs.message().starts_with("Database connection lost. (Mock)"));
        assert_eq!(db.pool().checked_out(), 0);

        // The next call tries again and succeeds.
        assert_eq!(db.exec("SELECT id", &[]).await.code(), ErrorCode::Ok);
    }

    #[tokio::test]
    async fn test_slow_backend_exhausts_single_slot_pool() {
        let (db, script) = connected(1).await;

        let slow = {
            let db = Arc::clone(&db);
            tokio::spawn(async move { db.exec("SLOW", &[]).await })
        };
        while db.pool().checked_out() == 0 {
            tokio::task::yield_now().await;
        }

        let rs = db.exec("SELECT id", &[]).await;
        assert_eq!(rs.code(), ErrorCode::Unknown);
        assert!(
            rs.message().contains("0 available of 1 connections"),
            "{}",
            rs.message()
        );
        assert_eq!(script.queries.load(Ordering::SeqCst), 1);

        let first = slow.await.unwrap();
        assert_eq!(first.code(), ErrorCode::Ok);
        assert_eq!(db.pool_status(), (1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_exec_never_shares_a_connection() {
        let (db, script) = connected(4).await;

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let db = Arc::clone(&db);
                tokio::spawn(async move {
                    let mut codes = Vec::new();
                    for _ in 0..10 {
                        codes.push(db.exec("YIELD", &[]).await.code());
                    }
                    codes
                })
            })
            .collect();

        let mut ok = 0;
        for task in tasks {
            for code in task.await.unwrap() {
                assert!(matches!(code, ErrorCode::Ok | ErrorCode::Unknown));
                if code == ErrorCode::Ok {
                    ok += 1;
                }
            }
        }

        assert!(ok > 0);
        assert!(script.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(db.pool().checked_out(), 0);
        assert_eq!(db.pool_status(), (4, 4));
    }
}
