//! Per-connection protocol handling.
//!
//! Each accepted socket is owned by exactly one task. The task performs
//! the handshake, then dispatches one message at a time: a handler
//! always runs to completion (including its error path) before the next
//! message is read, so no locking is needed anywhere in here.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use metrics::{counter, gauge};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use patina_types::config::EdgeConfig;
use patina_types::dbview::{DbView, ModAliases, Settings};
use patina_types::error::ServerError;
use patina_types::unit::{QueryUnit, StmtMode, TxStatus};

use crate::backend::{Authenticator, Backend, BackendError, BackendProvider, CompileError};
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::proto::*;

const READ_CHUNK: usize = 8 * 1024;

static NEXT_CONN_ID: AtomicI32 = AtomicI32::new(1);

fn next_conn_id() -> i32 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("connection aborted")]
    Aborted,
    #[error("connection cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<CompileError> for ConnError {
    fn from(e: CompileError) -> Self {
        match e {
            CompileError::User(e) => ConnError::Server(e),
            CompileError::Rpc(msg) => ConnError::Server(ServerError::internal(format!(
                "compiler endpoint failed: {msg}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    New,
    Started,
    Authenticated,
    Bad,
}

/// Everything that only exists once the handshake succeeded.
struct Session {
    dbview: DbView,
    backend: Backend,
    /// The most recently parsed anonymous statement.
    last_anon_compiled: Option<QueryUnit>,
}

pub struct Connection<S> {
    id: i32,
    status: Status,
    /// Released on abort.
    stream: Option<S>,
    buffer: ReadBuffer,
    out: WriteBuffer,
    cfg: EdgeConfig,
}

/// Drives one accepted socket until the client goes away, a fatal error
/// occurs, or the server shuts down.
pub(crate) async fn handle_conn<S>(
    stream: S,
    cfg: EdgeConfig,
    provider: Arc<dyn BackendProvider>,
    auth: Arc<dyn Authenticator>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let id = next_conn_id();
    let mut conn = Connection::new(id, stream, cfg);
    gauge!("patina.connections.active").increment(1.0);

    match conn.main(provider.as_ref(), auth.as_ref(), &cancel).await {
        Ok(()) => debug!(conn_id = id, "connection closed"),
        Err(ConnError::Cancelled) => debug!(conn_id = id, "connection task cancelled"),
        Err(ConnError::Aborted) => debug!(conn_id = id, "client went away"),
        Err(e) => warn!(conn_id = id, "connection failed: {e}"),
    }
    conn.abort().await;
    gauge!("patina.connections.active").decrement(1.0);
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(id: i32, stream: S, cfg: EdgeConfig) -> Self {
        Self {
            id,
            status: Status::New,
            stream: Some(stream),
            buffer: ReadBuffer::new(),
            out: WriteBuffer::new(),
            cfg,
        }
    }

    async fn main(
        &mut self,
        provider: &dyn BackendProvider,
        auth: &dyn Authenticator,
        cancel: &CancellationToken,
    ) -> Result<(), ConnError> {
        let mut session = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnError::Cancelled),
            res = self.handshake(provider, auth) => match res {
                Ok(session) => session,
                Err(ConnError::Server(e)) => {
                    // handshake failures are reported, then the
                    // connection is dropped
                    self.write_error_msg(&e);
                    self.flush().await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };
        // the backend is closed on every exit, cancellation included,
        // before the transport is torn down
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(ConnError::Cancelled),
            res = self.run_loop(&mut session) => res,
        };
        session.backend.close().await;
        res
    }

    async fn handshake(
        &mut self,
        provider: &dyn BackendProvider,
        auth: &dyn Authenticator,
    ) -> Result<Session, ConnError> {
        let ver = loop {
            if let Some(ver) = self.buffer.take_proto_version() {
                break ver;
            }
            self.wait_for_data().await?;
        };
        self.status = Status::Started;
        if ver != PROTO_VER {
            return Err(ServerError::unsupported_protocol_version(format!(
                "protocol version {}.{} is not supported",
                ver.0, ver.1
            ))
            .into());
        }

        self.wait_for_message().await?;
        if self.buffer.message_type()? != MSG_CLIENT_HANDSHAKE {
            return Err(ServerError::binary_protocol("expected ClientHandshake message").into());
        }
        let user = self.buffer.read_utf8()?;
        let password = self.buffer.read_utf8()?;
        let database = self.buffer.read_utf8()?;
        self.buffer.finish_message();
        debug!(conn_id = self.id, user, database, "client handshake");

        auth.authenticate(&user, &password, &database).await?;

        let (mut backend, dbver) = provider.open(&database, &user).await?;
        let dbview = DbView::new(
            &database,
            &user,
            dbver,
            self.cfg.query_cache,
            self.cfg.default_module.clone(),
        );
        self.status = Status::Authenticated;
        debug!(conn_id = self.id, dbver, "authenticated");

        init_state(&mut backend, &self.cfg.default_module).await?;

        self.out
            .new_message(MSG_AUTH)
            .write_i32(AUTH_OK)
            .end_message();
        self.out
            .new_message(MSG_BACKEND_KEY)
            .write_i32(self.id)
            .end_message();
        if self.cfg.dev_mode {
            let addr = backend.pgcon.pg_addr().to_owned();
            self.out
                .new_message(MSG_PARAM_STATUS)
                .write_utf8("pgaddr")
                .write_utf8(&addr)
                .end_message();
        }
        self.write_ready(TxStatus::Idle);
        self.flush().await?;

        Ok(Session {
            dbview,
            backend,
            last_anon_compiled: None,
        })
    }

    async fn run_loop(&mut self, s: &mut Session) -> Result<(), ConnError> {
        loop {
            self.wait_for_message().await?;
            let mtype = self.buffer.message_type()?;
            trace!(conn_id = self.id, "dispatching {:?}", mtype as char);

            // these message shapes imply their own sync
            let flush_sync_on_error = matches!(mtype, MSG_SIMPLE_QUERY | MSG_LEGACY);

            let res = match mtype {
                MSG_PARSE => self.parse(s).await,
                MSG_DESCRIBE => self.describe(s).await,
                MSG_EXECUTE => self.execute(s).await,
                MSG_OPPORTUNISTIC_EXECUTE => self.opportunistic_execute(s).await,
                MSG_SIMPLE_QUERY => self.simple_query(s).await,
                MSG_SYNC => self.sync(s).await,
                MSG_LEGACY => self.legacy_graphql(s).await,
                MSG_FLUSH => {
                    self.buffer.finish_message();
                    self.flush().await
                }
                other => Err(ServerError::binary_protocol(format!(
                    "unexpected message type {:?}",
                    other as char
                ))
                .into()),
            };

            match res {
                Ok(()) => self.maybe_flush().await?,
                Err(e @ (ConnError::Aborted | ConnError::Cancelled | ConnError::Io(_))) => {
                    return Err(e)
                }
                Err(e) => {
                    counter!("patina.errors.written").increment(1);
                    s.dbview.tx_error();
                    self.buffer.finish_message();
                    let err = self.interpret_error(s, e).await;
                    self.write_error_msg(&err);
                    if flush_sync_on_error {
                        let status = self.ready_status(s);
                        self.write_ready(status);
                        self.flush().await?;
                    } else {
                        self.recover_from_error(s).await?;
                    }
                }
            }
        }
    }

    /// Discards client messages until the Sync that ends the failed
    /// message group.
    async fn recover_from_error(&mut self, s: &mut Session) -> Result<(), ConnError> {
        loop {
            self.wait_for_message().await?;
            let mtype = self.buffer.message_type()?;
            if mtype == MSG_SYNC {
                return self.sync(s).await;
            }
            trace!(conn_id = self.id, "discarding {:?}", mtype as char);
            self.buffer.discard_message();
        }
    }

    async fn sync(&mut self, s: &mut Session) -> Result<(), ConnError> {
        self.buffer.finish_message();
        let status = s.backend.pgcon.sync().await?;
        let status = if s.dbview.in_tx_error() {
            TxStatus::InError
        } else {
            status
        };
        self.write_ready(status);
        self.flush().await?;
        Ok(())
    }

    async fn parse(&mut self, s: &mut Session) -> Result<(), ConnError> {
        s.last_anon_compiled = None;

        let json_mode = self.read_output_mode()?;
        let stmt_name = self.buffer.read_utf8()?;
        if !stmt_name.is_empty() {
            return Err(
                ServerError::unsupported_feature("prepared statements are not yet supported")
                    .into(),
            );
        }
        let eql = self.buffer.read_null_str()?;
        if eql.is_empty() {
            return Err(ServerError::binary_protocol("empty query").into());
        }
        self.buffer.finish_message();

        let unit = self.parse_eql(s, eql, json_mode).await?;

        self.out
            .new_message(MSG_PARSE_COMPLETE)
            .write_i32(result_flags(&unit))
            .write_bytes(unit.in_type_id.as_bytes())
            .write_bytes(unit.out_type_id.as_bytes())
            .end_message();
        Ok(())
    }

    /// Resolves query text to a prepared unit: cache lookup, compile on
    /// a miss, prepare on the backend, cache the result. Primes the
    /// anonymous statement slot.
    async fn parse_eql(
        &mut self,
        s: &mut Session,
        eql: Bytes,
        json_mode: bool,
    ) -> Result<QueryUnit, ConnError> {
        let cached = s.dbview.lookup_compiled(&eql, json_mode);
        let from_cache = cached.is_some();
        let unit = match cached {
            Some(unit) => {
                if s.dbview.in_tx_error() && !unit.rolls_back() {
                    return Err(DbView::tx_aborted_error().into());
                }
                unit
            }
            None if s.dbview.in_tx_error() => {
                let (unit, num_remain) = s
                    .backend
                    .compiler
                    .try_compile_rollback(s.dbview.dbver(), &eql)
                    .await?;
                if num_remain > 0 {
                    return Err(DbView::tx_aborted_error().into());
                }
                unit
            }
            None => {
                let units = match s.dbview.txid() {
                    Some(txid) => {
                        s.backend
                            .compiler
                            .compile_eql_in_tx(txid, &eql, json_mode, StmtMode::Single)
                            .await?
                    }
                    None => {
                        s.backend
                            .compiler
                            .compile_eql(
                                s.dbview.dbver(),
                                &eql,
                                s.dbview.modaliases(),
                                s.dbview.config(),
                                json_mode,
                                StmtMode::Single,
                            )
                            .await?
                    }
                };
                units
                    .into_iter()
                    .next()
                    .ok_or_else(|| ServerError::internal("compiler returned no units"))?
            }
        };

        s.backend
            .pgcon
            .parse_execute(true, false, &unit, None, false, false, &mut self.out)
            .await?;

        if !from_cache {
            s.dbview.cache_compiled(eql, json_mode, &unit);
        }
        s.last_anon_compiled = Some(unit.clone());
        Ok(unit)
    }

    async fn describe(&mut self, s: &mut Session) -> Result<(), ConnError> {
        let kind = self.buffer.read_byte()?;
        let stmt_name = self.buffer.read_utf8()?;
        self.buffer.finish_message();

        if kind != DESCRIBE_TYPE {
            return Err(ServerError::binary_protocol(format!(
                "unsupported describe message kind {kind:#04x}"
            ))
            .into());
        }
        if !stmt_name.is_empty() {
            return Err(ServerError::unsupported_feature(
                "describing statements by name is not supported",
            )
            .into());
        }
        match &s.last_anon_compiled {
            Some(unit) => {
                let unit = unit.clone();
                self.write_describe(&unit);
                Ok(())
            }
            None => {
                Err(ServerError::type_spec_not_found("no prepared anonymous statement found")
                    .into())
            }
        }
    }

    fn write_describe(&mut self, unit: &QueryUnit) {
        self.out
            .new_message(MSG_TYPE_DESC)
            .write_i32(result_flags(unit))
            .write_bytes(unit.in_type_id.as_bytes())
            .write_u16(unit.in_type_data.len() as u16)
            .write_bytes(&unit.in_type_data)
            .write_bytes(unit.out_type_id.as_bytes())
            .write_u16(unit.out_type_data.len() as u16)
            .write_bytes(&unit.out_type_data)
            .end_message();
    }

    async fn execute(&mut self, s: &mut Session) -> Result<(), ConnError> {
        let stmt_name = self.buffer.read_utf8()?;
        if !stmt_name.is_empty() {
            return Err(
                ServerError::unsupported_feature("prepared statements are not yet supported")
                    .into(),
            );
        }
        let bind_args = self.buffer.consume_message()?;
        self.buffer.finish_message();

        let unit = match &s.last_anon_compiled {
            Some(unit) => unit.clone(),
            None => {
                return Err(
                    ServerError::binary_protocol("no prepared anonymous statement found").into(),
                )
            }
        };
        self.execute_unit(s, &unit, &bind_args, false, false).await
    }

    async fn opportunistic_execute(&mut self, s: &mut Session) -> Result<(), ConnError> {
        let json_mode = self.read_output_mode()?;
        let eql = self.buffer.read_null_str()?;
        if eql.is_empty() {
            return Err(ServerError::binary_protocol("empty query").into());
        }
        let parse_flags = self.buffer.read_i32()?;
        let in_type_id = self.read_type_id()?;
        let out_type_id = self.read_type_id()?;
        let bind_args = self.buffer.consume_message()?;
        self.buffer.finish_message();

        let unit = match s.dbview.lookup_compiled(&eql, json_mode) {
            Some(unit) => unit,
            None => self.parse_eql(s, eql, json_mode).await?,
        };

        let singleton = parse_flags & FLAG_SINGLETON_RESULT != 0;
        if unit.in_type_id != in_type_id
            || unit.out_type_id != out_type_id
            || unit.singleton_result != singleton
        {
            // the client's type knowledge is stale; answer with the
            // real descriptors and let it retry
            debug!(conn_id = self.id, "type ids changed, downgrading to describe");
            self.write_describe(&unit);
            return Ok(());
        }

        let use_prep_stmt = unit.sql_hash.is_some();
        self.execute_unit(s, &unit, &bind_args, true, use_prep_stmt)
            .await
    }

    async fn execute_unit(
        &mut self,
        s: &mut Session,
        unit: &QueryUnit,
        bind_args: &[u8],
        parse: bool,
        use_prep_stmt: bool,
    ) -> Result<(), ConnError> {
        if s.dbview.in_tx_error() {
            if !unit.rolls_back() {
                return Err(DbView::tx_aborted_error().into());
            }
            s.backend
                .pgcon
                .simple_query(&unit.joined_sql(), true)
                .await?;
            if unit.tx_savepoint_rollback {
                self.recover_current_tx_info(s).await?;
            } else {
                s.dbview.abort_tx();
            }
            self.out.new_message(MSG_COMMAND_COMPLETE).end_message();
            return Ok(());
        }

        let bind_data = recode_bind_args(bind_args)?;
        // when the client already queued a Sync, have the backend emit
        // its own in the same round trip
        let process_sync = self.buffer.take_message_type(MSG_SYNC)?;

        s.dbview.start(unit)?;
        let res = s
            .backend
            .pgcon
            .parse_execute(
                parse,
                true,
                unit,
                Some(&bind_data),
                process_sync,
                use_prep_stmt,
                &mut self.out,
            )
            .await;
        match res {
            Ok(()) => {
                s.dbview.on_success(unit);
                self.out.new_message(MSG_COMMAND_COMPLETE).end_message();
                if process_sync {
                    let status = self.ready_status(s);
                    self.write_ready(status);
                    self.flush().await?;
                    self.buffer.finish_message();
                }
                Ok(())
            }
            Err(e) => {
                s.dbview.on_error(unit);
                if s.backend.pgcon.xact_status() == TxStatus::Idle && s.dbview.in_tx() {
                    // the backend ended the transaction on its own (a
                    // COMMIT that failed); resync from the state tables
                    s.dbview.abort_tx();
                    self.recover_current_tx_info(s).await?;
                }
                if process_sync {
                    // let the loop's error path handle the Sync
                    self.buffer.put_message();
                }
                Err(e.into())
            }
        }
    }

    async fn simple_query(&mut self, s: &mut Session) -> Result<(), ConnError> {
        let eql = self.buffer.read_null_str()?;
        self.buffer.finish_message();
        if eql.is_empty() {
            return Err(ServerError::binary_protocol("empty query").into());
        }

        let mut stmt_mode = StmtMode::All;
        if s.dbview.in_tx_error() {
            if self.recover_script_error(s, &eql).await? {
                // the script was exactly the rollback
                self.out.new_message(MSG_COMMAND_COMPLETE).end_message();
                let status = self.ready_status(s);
                self.write_ready(status);
                self.flush().await?;
                return Ok(());
            }
            stmt_mode = StmtMode::SkipFirst;
        }

        let units = match s.dbview.txid() {
            Some(txid) => {
                s.backend
                    .compiler
                    .compile_eql_in_tx(txid, &eql, false, stmt_mode)
                    .await?
            }
            None => {
                s.backend
                    .compiler
                    .compile_eql(
                        s.dbview.dbver(),
                        &eql,
                        s.dbview.modaliases(),
                        s.dbview.config(),
                        false,
                        stmt_mode,
                    )
                    .await?
            }
        };

        for unit in units {
            s.dbview.start(&unit)?;
            match s.backend.pgcon.simple_query(&unit.joined_sql(), true).await {
                Ok(_) => s.dbview.on_success(&unit),
                Err(e) => {
                    s.dbview.on_error(&unit);
                    if s.backend.pgcon.xact_status() == TxStatus::Idle && s.dbview.in_tx() {
                        s.dbview.abort_tx();
                        self.recover_current_tx_info(s).await?;
                    }
                    return Err(e.into());
                }
            }
        }

        self.out.new_message(MSG_COMMAND_COMPLETE).end_message();
        let status = self.ready_status(s);
        self.write_ready(status);
        self.flush().await?;
        Ok(())
    }

    /// Runs the leading rollback of a script issued against an aborted
    /// transaction. Returns true when the script contained nothing
    /// else.
    async fn recover_script_error(
        &mut self,
        s: &mut Session,
        eql: &[u8],
    ) -> Result<bool, ConnError> {
        let (unit, num_remain) = s
            .backend
            .compiler
            .try_compile_rollback(s.dbview.dbver(), eql)
            .await?;
        s.backend
            .pgcon
            .simple_query(&unit.joined_sql(), true)
            .await?;
        if unit.tx_savepoint_rollback {
            self.recover_current_tx_info(s).await?;
        } else {
            s.dbview.abort_tx();
        }
        Ok(num_remain == 0)
    }

    async fn legacy_graphql(&mut self, s: &mut Session) -> Result<(), ConnError> {
        let lang = self.buffer.read_byte()?;
        if lang != LEGACY_LANG_GRAPHQL {
            return Err(ServerError::binary_protocol(format!(
                "unsupported legacy language {lang:#04x}"
            ))
            .into());
        }
        let gql = self.buffer.read_null_str()?;
        self.buffer.finish_message();

        if s.dbview.in_tx() {
            return Err(ServerError::transaction(
                "GraphQL queries cannot be used in a transaction block",
            )
            .into());
        }

        let unit = s
            .backend
            .compiler
            .compile_graphql(
                s.dbview.dbver(),
                &gql,
                s.dbview.modaliases(),
                s.dbview.config(),
            )
            .await?;
        let rows = s
            .backend
            .pgcon
            .simple_query(&unit.joined_sql(), false)
            .await?;
        if rows.len() > 1 {
            return Err(ServerError::internal("graphql query returned more than one row").into());
        }
        let payload = rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next().flatten())
            .unwrap_or_else(|| Bytes::from_static(b"null"));

        self.out
            .new_message(MSG_LEGACY_RESULT)
            .write_bytes(&payload)
            .end_message();
        let status = self.ready_status(s);
        self.write_ready(status);
        self.flush().await?;
        Ok(())
    }

    /// Reassembles aliases, config, and the current savepoint from the
    /// connection's state tables after the backend rolled back
    /// underneath us.
    async fn recover_current_tx_info(&mut self, s: &mut Session) -> Result<(), ConnError> {
        let rows = s
            .backend
            .pgcon
            .simple_query(RECOVER_STATE_SQL, false)
            .await?;

        let mut aliases = ModAliases::new();
        let mut config = Settings::new();
        let mut sp_id = None;

        for row in rows {
            if row.len() != 3 {
                return Err(ServerError::internal("malformed state table row").into());
            }
            let mut cols = row.into_iter();
            let name = text_col(cols.next().flatten())?;
            let value = text_col(cols.next().flatten())?;
            let typ = text_col(cols.next().flatten())?;
            match typ.as_str() {
                "A" => {
                    aliases.insert(name.into(), value.into());
                }
                "C" => {
                    let decoded = s
                        .backend
                        .compiler
                        .setting_val_from_eql(s.dbview.dbver(), &name, value.as_bytes())
                        .await?;
                    config.insert(name.into(), decoded);
                }
                "S" => {
                    sp_id = Some(value.parse::<i64>().map_err(|_| {
                        ServerError::internal("invalid savepoint id in state table")
                    })?);
                }
                other => {
                    return Err(ServerError::internal(format!(
                        "unexpected state entry type {other:?}"
                    ))
                    .into())
                }
            }
        }

        if s.dbview.in_tx() {
            let sp_id =
                sp_id.ok_or_else(|| ServerError::internal("no current savepoint recorded"))?;
            s.dbview.rollback_tx_to_savepoint(sp_id, aliases, config);
        } else {
            s.dbview.recover_aliases_and_config(aliases, config);
        }
        Ok(())
    }

    async fn interpret_error(&mut self, s: &mut Session, err: ConnError) -> ServerError {
        match err {
            ConnError::Server(e) => e,
            ConnError::Backend(BackendError::Server(fields)) => {
                match s
                    .backend
                    .compiler
                    .interpret_backend_error(s.dbview.dbver(), &fields)
                    .await
                {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(conn_id = self.id, "could not interpret backend error: {e}");
                        ServerError::internal("could not interpret backend error")
                    }
                }
            }
            ConnError::Backend(BackendError::Io(e)) => {
                ServerError::internal(format!("backend connection failed: {e}"))
            }
            ConnError::Aborted | ConnError::Cancelled | ConnError::Io(_) => {
                ServerError::internal("connection failure")
            }
        }
    }

    fn write_error_msg(&mut self, err: &ServerError) {
        debug!(conn_id = self.id, code = err.code, "sending error: {}", err.message);
        let msg = self.out.new_message(MSG_ERROR);
        msg.write_u32(err.code).write_utf8(&err.message);
        for (key, value) in &err.attributes {
            msg.write_byte(*key).write_utf8(value);
        }
        msg.write_byte(0).end_message();
    }

    fn ready_status(&self, s: &Session) -> TxStatus {
        if s.dbview.in_tx_error() {
            TxStatus::InError
        } else {
            s.backend.pgcon.xact_status()
        }
    }

    fn write_ready(&mut self, status: TxStatus) {
        self.out
            .new_message(MSG_READY_FOR_QUERY)
            .write_byte(status_byte(status))
            .end_message();
    }

    fn read_output_mode(&mut self) -> Result<bool, ConnError> {
        match self.buffer.read_byte()? {
            OUTPUT_JSON => Ok(true),
            OUTPUT_BINARY => Ok(false),
            other => Err(
                ServerError::binary_protocol(format!("unknown output mode {other:#04x}")).into(),
            ),
        }
    }

    fn read_type_id(&mut self) -> Result<Uuid, ConnError> {
        let bytes = self.buffer.read_bytes(16)?;
        Uuid::from_slice(&bytes)
            .map_err(|_| ServerError::binary_protocol("invalid type id").into())
    }

    /// Reads socket data into the framing buffer, suspending until some
    /// arrives.
    async fn wait_for_data(&mut self) -> Result<(), ConnError> {
        let stream = self.stream.as_mut().ok_or(ConnError::Aborted)?;
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ConnError::Aborted);
        }
        self.buffer.feed_data(&chunk[..n]);
        Ok(())
    }

    /// Blocks until a whole message has been taken. Pending output is
    /// flushed before suspending, so the client always sees everything
    /// it is waiting on.
    async fn wait_for_message(&mut self) -> Result<(), ConnError> {
        while !self.buffer.take_message()? {
            self.flush().await?;
            self.wait_for_data().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), ConnError> {
        if self.out.is_empty() {
            return Ok(());
        }
        let data = self.out.take();
        let stream = self.stream.as_mut().ok_or(ConnError::Aborted)?;
        stream.write_all(&data).await?;
        Ok(())
    }

    async fn maybe_flush(&mut self) -> Result<(), ConnError> {
        if self.out.len() >= FLUSH_THRESHOLD {
            self.flush().await
        } else {
            Ok(())
        }
    }

    /// Tears the connection down: no further reads or writes happen
    /// after this.
    async fn abort(&mut self) {
        if self.status == Status::Bad {
            return;
        }
        self.status = Status::Bad;
        if let Some(mut stream) = self.stream.take() {
            _ = stream.shutdown().await;
        }
    }
}

/// Creates the per-connection state tables that back alias/config
/// recovery. Runs before any user message is dispatched.
async fn init_state(backend: &mut Backend, default_module: &str) -> Result<(), ConnError> {
    let script = format!(
        "CREATE TEMPORARY TABLE _edgecon_state (\
            name text NOT NULL, \
            value text NOT NULL, \
            type text NOT NULL CHECK(type = 'C' OR type = 'A'), \
            UNIQUE(name, type)\
        );\
        CREATE TEMPORARY TABLE _edgecon_current_savepoint (\
            sp_id bigint NOT NULL, \
            _sentinel bigint DEFAULT -1, \
            UNIQUE(_sentinel)\
        );\
        INSERT INTO _edgecon_state(name, value, type) \
            VALUES ('', '{default_module}', 'A');"
    );
    backend.pgcon.simple_query(script.as_bytes(), true).await?;
    Ok(())
}

const RECOVER_STATE_SQL: &[u8] = b"SELECT s.name, s.value, s.type FROM _edgecon_state s \
    UNION ALL \
    SELECT '' AS name, s.sp_id::text AS value, 'S' AS type \
    FROM _edgecon_current_savepoint s";

fn text_col(col: Option<Bytes>) -> Result<String, ServerError> {
    let bytes = col.ok_or_else(|| ServerError::internal("unexpected NULL in state table"))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ServerError::internal("invalid UTF-8 in state table"))
}

fn result_flags(unit: &QueryUnit) -> i32 {
    let mut flags = 0;
    if unit.has_result {
        flags |= FLAG_HAS_RESULT;
    }
    if unit.singleton_result {
        flags |= FLAG_SINGLETON_RESULT;
    }
    flags
}

/// Reframes the client's bind block into the backend's bind format:
/// one binary format code, the argument count as i16, the argument
/// tuple verbatim, one binary result column format.
fn recode_bind_args(bind_args: &[u8]) -> Result<Bytes, ServerError> {
    let mut input = bind_args;
    if input.len() < 8 {
        return Err(ServerError::binary_protocol("invalid bind arguments block"));
    }
    let mut out = BytesMut::with_capacity(bind_args.len() + 8);
    out.put_u32(0x0001_0001);
    input.advance(4); // client-side length, not forwarded
    let argsnum = input.get_u32();
    out.put_i16(argsnum as i16);
    out.put_slice(input);
    out.put_u32(0x0001_0001);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recode_bind_args_reframes() {
        let mut input = Vec::new();
        input.extend_from_slice(&20u32.to_be_bytes());
        input.extend_from_slice(&2u32.to_be_bytes());
        input.extend_from_slice(b"body-bytes");

        let out = recode_bind_args(&input).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&0x0001_0001u32.to_be_bytes());
        expected.extend_from_slice(&2u16.to_be_bytes());
        expected.extend_from_slice(b"body-bytes");
        expected.extend_from_slice(&0x0001_0001u32.to_be_bytes());
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn recode_bind_args_empty_body() {
        let mut input = Vec::new();
        input.extend_from_slice(&8u32.to_be_bytes());
        input.extend_from_slice(&0u32.to_be_bytes());

        let out = recode_bind_args(&input).unwrap();
        assert_eq!(
            &out[..],
            &[0, 1, 0, 1, 0, 0, 0, 1, 0, 1][..]
        );
    }

    #[test]
    fn recode_bind_args_rejects_short_input() {
        assert!(recode_bind_args(b"\x00\x00\x00\x04").is_err());
    }

    #[test]
    fn result_flags_bits() {
        let unit = QueryUnit {
            has_result: true,
            singleton_result: true,
            ..Default::default()
        };
        assert_eq!(result_flags(&unit), FLAG_HAS_RESULT | FLAG_SINGLETON_RESULT);
        assert_eq!(result_flags(&QueryUnit::default()), 0);
    }
}
