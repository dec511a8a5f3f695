//! Postgres connection.
//!
//! A [`Connection`] is shared by reference. Only one handshake or query runs at a
//! time, a concurrent attempt fails with [`ErrorKind::Busy`] instead of waiting. The
//! transport is never locked while it is read, thus [`Connection::cancel`] can run
//! while a query is blocked.
use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    ErrorKind, Result,
    cancel::CancelToken,
    common::report,
    ext::MutexExt,
    net::{Connector, TcpConnector},
    postgres::{
        BackendKeyData, Generation, ServerVersion,
        frontend::{FrontendProtocol, Query, Terminate},
    },
    query::{
        QueryOptions, ResultChain,
        engine::{self, Exec, Outcome},
    },
    statement::StatementHandle,
    transaction::{TransactionStatus, TransactionTracker},
};

mod config;
mod copy;
mod handshake;
mod session;
mod state;

pub use config::{Config, ParseError, StatementLimit};
pub use handshake::Handshake;
pub use state::{ConnStatus, LastError};

use handshake::AuthStep;
use state::{ExecGuard, PendingCopy, State};

/// A single connection to postgres.
pub struct Connection<C: Connector = TcpConnector> {
    config: Config,
    connector: Arc<C>,
    state: Mutex<State<C::Stream>>,
    tx: Mutex<TransactionTracker>,
}

impl Connection {
    /// Create a connection without connecting.
    pub fn new(config: Config) -> Connection {
        Self::with_connector(config, TcpConnector)
    }

    /// Connect with config parsed from url.
    pub async fn connect(url: &str) -> Result<Connection> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect with config from environment variable.
    ///
    /// See [`Config::from_env`] for more details on env.
    pub async fn connect_env() -> Result<Connection> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect with the given config.
    ///
    /// A server asking for a password while none is configured is an error here, use
    /// [`Connection::handshake`] to supply it later.
    pub async fn connect_with(config: Config) -> Result<Connection> {
        let conn = Self::new(config);
        match conn.handshake().await? {
            Handshake::Connected => Ok(conn),
            Handshake::NeedsPassword(challenge) => {
                Err(crate::AuthError::PasswordRequired(challenge.name()).into())
            }
        }
    }
}

impl<C: Connector> Connection<C> {
    /// Create a connection that opens its transports with `connector`.
    pub fn with_connector(config: Config, connector: C) -> Self {
        Self {
            state: Mutex::new(State::new(config.protocol)),
            tx: Mutex::default(),
            connector: Arc::new(connector),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> ConnStatus {
        self.state.lock_unpoisoned().status
    }

    /// Whether a handshake or a query is in progress.
    pub fn is_busy(&self) -> bool {
        self.status() == ConnStatus::Executing
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx.lock_unpoisoned().status()
    }

    /// Server version, the nominal version of the generation until connected.
    pub fn server_version(&self) -> ServerVersion {
        self.state.lock_unpoisoned().version
    }

    /// Protocol generation in use.
    pub fn generation(&self) -> Generation {
        self.state.lock_unpoisoned().generation
    }

    /// Client encoding of the session, empty until connected.
    pub fn encoding(&self) -> String {
        self.state.lock_unpoisoned().encoding.clone()
    }

    /// Setting statements that failed while connecting.
    pub fn startup_warnings(&self) -> Vec<String> {
        self.state.lock_unpoisoned().warnings.clone()
    }

    /// Cancellation key, only sent by protocol 2.0 servers.
    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.state.lock_unpoisoned().key
    }

    /// Returns and clears the last error.
    pub fn take_error(&self) -> Option<LastError> {
        self.state.lock_unpoisoned().error.take()
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.state.lock_unpoisoned().set_error(err);
        }
        result
    }
}

// Handshake
impl<C: Connector> Connection<C> {
    /// Open the transport and run the startup phase.
    ///
    /// Calling this on a connected connection does nothing. On failure the connection
    /// is left [`NotConnected`][ConnStatus::NotConnected].
    pub async fn handshake(&self) -> Result<Handshake> {
        let result = self.try_handshake().await;
        self.record(result)
    }

    /// Resume a handshake that returned [`Handshake::NeedsPassword`].
    pub async fn authenticate(&self, password: &str) -> Result<Handshake> {
        let result = self.try_authenticate(password).await;
        self.record(result)
    }

    async fn try_handshake(&self) -> Result<Handshake> {
        self.config.validate()?;

        {
            let mut state = self.state.lock_unpoisoned();
            match state.status {
                ConnStatus::Executing => return Err(ErrorKind::Busy.into()),
                ConnStatus::Connected => return Ok(Handshake::Connected),
                ConnStatus::NotConnected | ConnStatus::Down => {}
            }
            state.teardown(ConnStatus::Executing);
            state.error = None;
            state.warnings.clear();
        }
        self.tx.lock_unpoisoned().reset();

        let guard = ExecGuard::new(&self.state, &self.tx, ConnStatus::NotConnected);
        let step = handshake::open(&*self.connector, &self.config).await?;
        self.establish(step, guard).await
    }

    async fn try_authenticate(&self, password: &str) -> Result<Handshake> {
        let (opened, challenge) = {
            let mut state = self.state.lock_unpoisoned();
            match state.status {
                ConnStatus::Executing => return Err(ErrorKind::Busy.into()),
                ConnStatus::Connected => return Ok(Handshake::Connected),
                ConnStatus::NotConnected | ConnStatus::Down => {}
            }
            let Some(challenge) = state.pending_auth.take() else {
                return Err(ErrorKind::NotConnected.into());
            };
            let Some(io) = state.io.take() else {
                return Err(ErrorKind::NotConnected.into());
            };
            state.status = ConnStatus::Executing;
            (handshake::Opened { io, generation: state.generation, key: None }, challenge)
        };

        let guard = ExecGuard::new(&self.state, &self.tx, ConnStatus::NotConnected);
        let step = handshake::resume(opened, challenge, &self.config.user, password).await?;
        self.establish(step, guard).await
    }

    async fn establish(
        &self,
        step: AuthStep<C::Stream>,
        guard: ExecGuard<'_, C::Stream>,
    ) -> Result<Handshake> {
        let mut opened = match step {
            AuthStep::Ready(opened) => opened,
            AuthStep::NeedsPassword(opened, challenge) => {
                report!(warn, "server requested a password ({})", challenge.name());
                let mut state = self.state.lock_unpoisoned();
                state.io = Some(opened.io);
                state.generation = opened.generation;
                state.pending_auth = Some(challenge);
                state.status = ConnStatus::NotConnected;
                guard.disarm();
                return Ok(Handshake::NeedsPassword(challenge));
            }
        };

        let session = session::start(&mut opened.io, opened.generation, &self.config, &self.tx).await?;

        let mut state = self.state.lock_unpoisoned();
        state.io = Some(opened.io);
        state.status = ConnStatus::Connected;
        state.generation = opened.generation;
        state.version = session.version;
        state.key = opened.key;
        state.encoding = session.encoding;
        state.warnings = session.warnings;
        state.error = None;
        guard.disarm();
        Ok(Handshake::Connected)
    }
}

// Query
impl<C: Connector> Connection<C> {
    /// Run a query text, which may contain several statements.
    ///
    /// A statement rejected by the server does not fail the call, the returned chain
    /// ends with an aborted node instead. See [`QueryOptions`] to change that.
    pub async fn execute(&self, sql: &str) -> Result<ResultChain> {
        self.execute_with(sql, QueryOptions::new()).await
    }

    pub async fn execute_with(&self, sql: &str, options: QueryOptions) -> Result<ResultChain> {
        let (chain, flush) = self.run_query(sql, &options).await?;
        if flush {
            // failed plans stay marked for the next transaction end
            let _ = self.discard_marked_plans().await;
        }
        Ok(chain)
    }

    async fn run_query(&self, sql: &str, options: &QueryOptions) -> Result<(ResultChain, bool)> {
        let result = self.try_run_query(sql, options).await;
        self.record(result)
    }

    async fn try_run_query(&self, sql: &str, options: &QueryOptions) -> Result<(ResultChain, bool)> {
        let (mut io, exec) = {
            let mut state = self.state.lock_unpoisoned();
            state.check_ready()?;

            if sql.is_empty() {
                return Err(ErrorKind::EmptyQuery.into());
            }

            let begin = options.begin && !self.tx.lock_unpoisoned().status().in_transaction();
            let len = sql.len() + if begin { Query::IMPLICIT_BEGIN.len() } else { 0 };
            let max = self.config.max_query_len(state.version);
            if max > 0 && len + 1 > max {
                return Err(ErrorKind::QueryTooLong { len, max }.into());
            }

            let Some(io) = state.io.take() else {
                return Err(ErrorKind::NotConnected.into());
            };
            state.status = ConnStatus::Executing;

            let exec = Exec {
                generation: state.generation,
                version: state.version,
                sql,
                begin,
                cursor: options.cursor.as_deref(),
            };
            (io, exec)
        };

        let guard = ExecGuard::new(&self.state, &self.tx, ConnStatus::Down);
        let Outcome { mut chain, flush, copy, polls } = engine::run(&mut io, &exec, &self.tx).await?;

        {
            let mut state = self.state.lock_unpoisoned();
            state.io = Some(io);
            state.status = ConnStatus::Connected;
            state.copy = copy.map(|direction| PendingCopy { direction, sql: sql.to_owned(), polls });
            guard.disarm();

            if let Some(node) = chain.error() {
                if state.error.is_none() {
                    state.error = Some(LastError {
                        code: crate::ErrorCode::ServerError,
                        message: node.message().unwrap_or_default().to_owned(),
                    });
                }
            }
        }

        chain.apply(options.on_abort).map_err(crate::postgres::ServerError::new)?;
        Ok((chain, flush))
    }
}

// Transaction
impl<C: Connector> Connection<C> {
    /// Send `BEGIN` unless a transaction is open.
    pub async fn begin(&self) -> Result<()> {
        if self.transaction_status().in_transaction() {
            return Ok(());
        }
        self.execute_with("BEGIN", QueryOptions::internal()).await.map(drop)
    }

    /// Send `COMMIT` if a transaction is open.
    pub async fn commit(&self) -> Result<()> {
        if !self.transaction_status().in_transaction() {
            return Ok(());
        }
        self.execute_with("COMMIT", QueryOptions::internal()).await.map(drop)
    }

    /// Send `ROLLBACK` if a transaction is open.
    pub async fn rollback(&self) -> Result<()> {
        if !self.transaction_status().in_transaction() {
            return Ok(());
        }
        self.execute_with("ROLLBACK", QueryOptions::internal()).await.map(drop)
    }

    /// Mark a server side plan to be deallocated when the current transaction ends.
    pub fn mark_plan_to_discard(&self, name: &str) {
        self.tx.lock_unpoisoned().mark_plan(name);
    }

    /// Plans waiting to be deallocated, in marking order.
    pub fn pending_plans(&self) -> Vec<String> {
        self.tx.lock_unpoisoned().plans().to_vec()
    }

    /// Deallocate marked plans, most recently marked first.
    ///
    /// A failure stops the flush, the remaining plans stay marked.
    pub async fn discard_marked_plans(&self) -> Result<()> {
        loop {
            let Some(name) = self.tx.lock_unpoisoned().next_plan().map(str::to_owned) else {
                return Ok(());
            };

            let sql = format!("DEALLOCATE \"{name}\"");
            if let Err(err) = self.run_query(&sql, &QueryOptions::internal()).await {
                report!(warn, "failed to deallocate {name}: {err}");
                return Err(err);
            }
            self.tx.lock_unpoisoned().plan_discarded(&name);
        }
    }
}

// Cursor
impl<C: Connector> Connection<C> {
    /// Declare a cursor and fetch its first `fetch` rows, inside a transaction.
    pub async fn declare_cursor(&self, name: &str, select: &str, fetch: usize) -> Result<ResultChain> {
        let sql = format!("DECLARE \"{name}\" CURSOR FOR {select};FETCH {fetch} IN \"{name}\"");
        let options = QueryOptions::new().implicit_begin(true).cursor(name);
        self.execute_with(&sql, options).await
    }

    pub async fn close_cursor(&self, name: &str) -> Result<()> {
        self.execute_with(&format!("CLOSE \"{name}\""), QueryOptions::internal()).await?;
        self.tx.lock_unpoisoned().close_cursor(name);
        Ok(())
    }

    /// Number of cursors open in the current transaction.
    pub fn cursor_count(&self) -> usize {
        self.tx.lock_unpoisoned().cursors().len()
    }
}

// Session
impl<C: Connector> Connection<C> {
    /// Current schema, `None` for servers without schemas.
    pub async fn current_schema(&self) -> Result<Option<String>> {
        {
            let state = self.state.lock_unpoisoned();
            if !state.version.has_schemas() {
                return Ok(None);
            }
            if let Some(schema) = &state.schema {
                return Ok(Some(schema.clone()));
            }
        }

        let chain = self.execute_with("select current_schema()", QueryOptions::internal()).await?;
        let schema = chain
            .first()
            .and_then(|e| e.rows().first())
            .and_then(|row| row.get_str(0))
            .map(str::to_owned);
        self.state.lock_unpoisoned().schema.clone_from(&schema);
        Ok(schema)
    }

    /// Register a statement against this connection.
    pub fn statement(&self) -> StatementHandle {
        self.state.lock_unpoisoned().statements.register()
    }

    /// Number of registered statements still held by the caller.
    pub fn statement_count(&self) -> usize {
        self.state.lock_unpoisoned().statements.live()
    }

    /// Token that cancel the query in progress from another task.
    ///
    /// Returns `None` if the server did not send a cancellation key.
    pub fn cancel_token(&self) -> Option<CancelToken<C>> {
        let key = self.state.lock_unpoisoned().key?;
        Some(CancelToken::new(self.connector.clone(), &self.config.host, self.config.port, key))
    }

    /// Request the server to cancel the query in progress.
    ///
    /// Returns `false` if no cancellation key is known or the request cannot be sent.
    pub async fn cancel(&self) -> bool {
        match self.cancel_token() {
            Some(token) => token.cancel().await,
            None => false,
        }
    }

    /// Close the session.
    ///
    /// An open transaction is rolled back first. Registered statements become invalid.
    pub async fn disconnect(&self) -> Result<()> {
        if self.status() == ConnStatus::Connected && self.transaction_status().in_transaction() {
            if let Err(_err) = self.rollback().await {
                report!(warn, "rollback before disconnect failed: {_err}");
            }
        }

        let io = {
            let mut state = self.state.lock_unpoisoned();
            if state.status == ConnStatus::Executing {
                return Err(ErrorKind::Busy.into());
            }
            let io = state.io.take();
            state.teardown(ConnStatus::NotConnected);
            io
        };
        self.tx.lock_unpoisoned().reset();

        if let Some(mut io) = io {
            Terminate.write(&mut io);
            if let Err(_err) = io.shutdown().await {
                report!(warn, "failed to terminate the session: {_err}");
            }
        }
        Ok(())
    }
}

impl<C: Connector> Drop for Connection<C> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.statements.invalidate_all();
    }
}

impl<C: Connector> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock_unpoisoned();
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("database", &self.config.database)
            .field("status", &state.status)
            .field("generation", &state.generation)
            .field("version", &state.version)
            .finish()
    }
}
