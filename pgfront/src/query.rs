//! Query API types.
//!
//! A query text is run with [`Connection::execute`][crate::Connection::execute], which
//! returns a [`ResultChain`] with one [`QueryResult`] per response unit.
pub(crate) mod engine;
mod fetch;
mod result;

pub use engine::CopyDirection;
pub use result::{OnAbort, QueryResult, ResultChain, ResultStatus};

/// Options of [`Connection::execute_with`][crate::Connection::execute_with].
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub(crate) begin: bool,
    pub(crate) cursor: Option<String>,
    pub(crate) on_abort: OnAbort,
}

impl QueryOptions {
    pub fn new() -> QueryOptions {
        Self::default()
    }

    /// Options for queries the driver issues itself, errors are returned as `Err`.
    pub(crate) fn internal() -> QueryOptions {
        Self { on_abort: OnAbort::Discard, ..Self::default() }
    }

    /// Prepend `BEGIN;` when no transaction is open.
    pub fn implicit_begin(mut self, begin: bool) -> Self {
        self.begin = begin;
        self
    }

    /// Name of the server side cursor the row set is read from.
    ///
    /// The cursor is recorded as open until the transaction ends.
    pub fn cursor(mut self, name: impl Into<String>) -> Self {
        self.cursor = Some(name.into());
        self
    }

    pub fn on_abort(mut self, on_abort: OnAbort) -> Self {
        self.on_abort = on_abort;
        self
    }
}
