//! Interfaces to the two external collaborators of a connection: the
//! query compiler endpoint and the backing SQL connection.
//!
//! Both are exclusively owned by one connection for its lifetime, so
//! the traits take `&mut self` and need no internal locking.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use compact_str::CompactString;

use patina_types::dbview::{ModAliases, Settings};
use patina_types::error::ServerError;
use patina_types::unit::{QueryUnit, StmtMode, TxStatus};

use crate::buffer::WriteBuffer;

/// Failure reported by the SQL backend connection.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// An error the backend server reported, with its raw error fields.
    /// The compiler interprets these into a client-visible error.
    #[error("{}", message_field(.0))]
    Server(HashMap<u8, String>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn message_field(fields: &HashMap<u8, String>) -> &str {
    fields.get(&b'M').map(String::as_str).unwrap_or("backend error")
}

/// Failure of a compiler call.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// A user-facing error (bad query text, aborted transaction, ...)
    /// with a wire error code.
    #[error(transparent)]
    User(#[from] ServerError),
    /// The compiler endpoint itself failed.
    #[error("compiler endpoint: {0}")]
    Rpc(String),
}

/// The out-of-process query compiler.
#[async_trait]
pub trait Compiler: Send {
    async fn compile_eql(
        &mut self,
        dbver: i64,
        eql: &[u8],
        modaliases: &ModAliases,
        config: &Settings,
        json_mode: bool,
        stmt_mode: StmtMode,
    ) -> Result<Vec<QueryUnit>, CompileError>;

    async fn compile_eql_in_tx(
        &mut self,
        txid: u64,
        eql: &[u8],
        json_mode: bool,
        stmt_mode: StmtMode,
    ) -> Result<Vec<QueryUnit>, CompileError>;

    /// Compiles the leading `ROLLBACK` / `ROLLBACK TO SAVEPOINT` of a
    /// script, returning the unit and the number of statements left
    /// over after it. Fails when the script does not start with a
    /// rollback.
    async fn try_compile_rollback(
        &mut self,
        dbver: i64,
        eql: &[u8],
    ) -> Result<(QueryUnit, usize), CompileError>;

    async fn compile_graphql(
        &mut self,
        dbver: i64,
        gql: &[u8],
        modaliases: &ModAliases,
        config: &Settings,
    ) -> Result<QueryUnit, CompileError>;

    /// Translates a backend error, using schema context only the
    /// compiler has, into a client-visible error.
    async fn interpret_backend_error(
        &mut self,
        dbver: i64,
        fields: &HashMap<u8, String>,
    ) -> Result<ServerError, CompileError>;

    /// Decodes a stored session-config value.
    async fn setting_val_from_eql(
        &mut self,
        dbver: i64,
        name: &str,
        value: &[u8],
    ) -> Result<CompactString, CompileError>;
}

/// The backing SQL connection.
#[async_trait]
pub trait PgConn: Send {
    /// Prepares and/or executes a compiled unit. Row data is written as
    /// data messages directly into `out`, so results share the
    /// connection's outgoing datagram. With `send_sync` the backend
    /// appends its own sync to the round trip.
    #[allow(clippy::too_many_arguments)]
    async fn parse_execute(
        &mut self,
        parse: bool,
        execute: bool,
        unit: &QueryUnit,
        bind_data: Option<&[u8]>,
        send_sync: bool,
        use_prep_stmt: bool,
        out: &mut WriteBuffer,
    ) -> Result<(), BackendError>;

    /// Runs a SQL script outside the prepared-statement machinery.
    /// Returns the result rows unless `ignore_data` is set.
    async fn simple_query(
        &mut self,
        script: &[u8],
        ignore_data: bool,
    ) -> Result<Vec<Vec<Option<Bytes>>>, BackendError>;

    /// Synchronizes with the backend and returns its transaction
    /// status.
    async fn sync(&mut self) -> Result<TxStatus, BackendError>;

    /// Last observed transaction status, without a round trip.
    fn xact_status(&self) -> TxStatus;

    /// Address of the backing server, for developer diagnostics.
    fn pg_addr(&self) -> &str;

    async fn close(&mut self);
}

/// The per-connection bundle of external endpoints.
pub struct Backend {
    pub compiler: Box<dyn Compiler>,
    pub pgcon: Box<dyn PgConn>,
}

impl Backend {
    pub async fn close(&mut self) {
        self.pgcon.close().await;
    }
}

/// Opens backends for authenticated connections.
#[async_trait]
pub trait BackendProvider: Send + Sync + 'static {
    /// Opens a compiler/SQL bundle for `dbname`, returning it together
    /// with the database version the bundle is bound to.
    async fn open(&self, dbname: &str, user: &str) -> Result<(Backend, i64), ServerError>;
}

/// Decides whether a handshake is allowed to proceed.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(
        &self,
        user: &str,
        password: &str,
        dbname: &str,
    ) -> Result<(), ServerError>;
}

/// Accepts every handshake.
pub struct Trust;

#[async_trait]
impl Authenticator for Trust {
    async fn authenticate(
        &self,
        _user: &str,
        _password: &str,
        _dbname: &str,
    ) -> Result<(), ServerError> {
        Ok(())
    }
}
