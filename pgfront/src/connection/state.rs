//! Mutable connection state.
use std::sync::Mutex;

use crate::{
    Error, ErrorKind, Result,
    common::report,
    error::ErrorCode,
    ext::MutexExt,
    postgres::{BackendKeyData, Generation, PasswordChallenge, ServerVersion},
    query::CopyDirection,
    statement::StatementRegistry,
    stream::PgStream,
    transaction::TransactionTracker,
};

/// Lifecycle of a [`Connection`][crate::Connection].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnStatus {
    /// Not connected yet, or closed by the caller.
    #[default]
    NotConnected,
    /// Ready for a query.
    Connected,
    /// A handshake or a query is in progress.
    Executing,
    /// The transport died, a new handshake is required.
    Down,
}

/// The last error recorded on a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastError {
    pub code: ErrorCode,
    pub message: String,
}

/// Copy phase the server is waiting on.
#[derive(Debug)]
pub(crate) struct PendingCopy {
    pub direction: CopyDirection,
    /// Query that started the copy.
    pub sql: String,
    /// Empty query replies still owed by the server.
    pub polls: u32,
}

#[derive(Debug)]
pub(crate) struct State<S> {
    pub status: ConnStatus,
    /// Taken out while a handshake or a query is in progress.
    pub io: Option<PgStream<S>>,
    pub generation: Generation,
    pub version: ServerVersion,
    pub key: Option<BackendKeyData>,
    pub error: Option<LastError>,
    /// Challenge waiting for [`Connection::authenticate`][crate::Connection::authenticate].
    pub pending_auth: Option<PasswordChallenge>,
    pub encoding: String,
    pub schema: Option<String>,
    pub warnings: Vec<String>,
    pub copy: Option<PendingCopy>,
    pub statements: StatementRegistry,
}

impl<S> State<S> {
    pub fn new(generation: Generation) -> Self {
        Self {
            status: ConnStatus::NotConnected,
            io: None,
            generation,
            version: generation.nominal_version(),
            key: None,
            error: None,
            pending_auth: None,
            encoding: String::new(),
            schema: None,
            warnings: Vec::new(),
            copy: None,
            statements: StatementRegistry::default(),
        }
    }

    pub fn set_error(&mut self, err: &Error) {
        self.error = Some(LastError { code: err.code(), message: err.message() });
    }

    /// Whether a query can be started now.
    pub fn check_ready(&self) -> Result<()> {
        match self.status {
            ConnStatus::Executing => Err(ErrorKind::Busy.into()),
            ConnStatus::NotConnected | ConnStatus::Down => Err(ErrorKind::NotConnected.into()),
            ConnStatus::Connected if self.copy.is_some() => Err(ErrorKind::Busy.into()),
            ConnStatus::Connected => Ok(()),
        }
    }

    /// Forget everything bound to the server session.
    pub fn teardown(&mut self, status: ConnStatus) {
        self.status = status;
        self.io = None;
        self.key = None;
        self.pending_auth = None;
        self.copy = None;
        self.schema = None;
        self.statements.invalidate_all();
    }
}

/// Restore the connection status when an operation does not finish normally.
///
/// This covers early returns as well as a future dropped mid operation. Once the
/// operation puts the transport back it must call [`ExecGuard::disarm`].
pub(crate) struct ExecGuard<'a, S> {
    state: &'a Mutex<State<S>>,
    tx: &'a Mutex<TransactionTracker>,
    fallback: ConnStatus,
    armed: bool,
}

impl<'a, S> ExecGuard<'a, S> {
    pub fn new(
        state: &'a Mutex<State<S>>,
        tx: &'a Mutex<TransactionTracker>,
        fallback: ConnStatus,
    ) -> Self {
        Self { state, tx, fallback, armed: true }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S> Drop for ExecGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut state = self.state.lock_unpoisoned();
        state.teardown(self.fallback);
        if self.fallback == ConnStatus::Down {
            report!(error, "connection is down");
            self.tx.lock_unpoisoned().connection_dead();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transaction::CommandTag;

    #[test]
    fn guard_marks_down() {
        let state = Mutex::new(State::<()>::new(Generation::Modern));
        let tx = Mutex::new(TransactionTracker::default());
        let _ = tx.lock_unpoisoned().observe(CommandTag::Begin, "BEGIN", ServerVersion::new(7, 4));
        state.lock_unpoisoned().status = ConnStatus::Executing;

        drop(ExecGuard::new(&state, &tx, ConnStatus::Down));
        assert_eq!(state.lock_unpoisoned().status, ConnStatus::Down);
        assert!(!tx.lock_unpoisoned().status().in_transaction());

        state.lock_unpoisoned().status = ConnStatus::Executing;
        ExecGuard::new(&state, &tx, ConnStatus::Down).disarm();
        assert_eq!(state.lock_unpoisoned().status, ConnStatus::Executing);
    }

    #[test]
    fn ready() {
        let mut state = State::<()>::new(Generation::Legacy63);
        assert_eq!(state.version, ServerVersion::new(6, 3));
        assert!(matches!(state.check_ready().unwrap_err().kind(), ErrorKind::NotConnected));

        state.status = ConnStatus::Connected;
        state.check_ready().unwrap();

        state.copy = Some(PendingCopy { direction: CopyDirection::In, sql: "copy t from stdin".into(), polls: 0 });
        assert!(matches!(state.check_ready().unwrap_err().kind(), ErrorKind::Busy));
    }
}
