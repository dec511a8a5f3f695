//! Results of a simple query.
use crate::{
    row::{Column, Row},
    transaction::CommandTag,
};

/// Status of one [`QueryResult`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultStatus {
    /// Command completed without rows.
    CommandOk,
    /// Command returned a row set.
    TuplesOk,
    /// The query text was empty.
    EmptyQuery,
    /// Server is waiting for copy data.
    CopyIn,
    /// Server is about to send copy data.
    CopyOut,
    /// Only notices were received.
    NonfatalError,
    /// The statement failed, the node is aborted.
    FatalError,
}

/// One logical server response unit.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub(crate) status: ResultStatus,
    pub(crate) command: Option<String>,
    pub(crate) rows_affected: Option<u64>,
    pub(crate) message: Option<String>,
    pub(crate) notices: Vec<String>,
    pub(crate) cursor: Option<String>,
    pub(crate) columns: Vec<Column>,
    pub(crate) rows: Vec<Row>,
    /// Whether an outcome is recorded, another outcome goes to a new node.
    pub(crate) complete: bool,
}

impl QueryResult {
    pub(crate) fn new() -> QueryResult {
        Self {
            status: ResultStatus::NonfatalError,
            command: None,
            rows_affected: None,
            message: None,
            notices: Vec::new(),
            cursor: None,
            columns: Vec::new(),
            rows: Vec::new(),
            complete: false,
        }
    }

    /// Record `CommandComplete`.
    ///
    /// A node that already carries a row set keeps [`ResultStatus::TuplesOk`].
    pub(crate) fn set_command(&mut self, command: String) {
        if let CommandTag::Other { rows } = CommandTag::parse(&command) {
            self.rows_affected = rows;
        }
        if !matches!(self.status, ResultStatus::TuplesOk | ResultStatus::FatalError) {
            self.status = ResultStatus::CommandOk;
        }
        self.command = Some(command);
        self.complete = true;
    }

    pub(crate) fn set_error(&mut self, message: String) {
        self.status = ResultStatus::FatalError;
        self.message = Some(message);
        self.complete = true;
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Command tag, e.g. `UPDATE 3`.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Row count at the end of the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Error message of an aborted node.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Notices received while this node was current.
    pub fn notices(&self) -> &[String] {
        &self.notices
    }

    /// The last notice.
    pub fn notice(&self) -> Option<&str> {
        self.notices.last().map(String::as_str)
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn is_aborted(&self) -> bool {
        self.status == ResultStatus::FatalError
    }

    /// Whether the statement succeeded, notices included.
    pub fn is_ok(&self) -> bool {
        !self.is_aborted()
    }
}

/// How an aborted chain is returned from [`execute`][crate::Connection::execute].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnAbort {
    /// Return the chain up to and including the first aborted node.
    #[default]
    Inspect,
    /// Return only the first aborted node.
    ErrorTail,
    /// Return the server error instead of a chain.
    Discard,
}

/// Ordered results of one query text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultChain {
    results: Vec<QueryResult>,
}

impl ResultChain {
    pub(crate) fn new() -> ResultChain {
        Self { results: vec![QueryResult::new()] }
    }

    /// The node receiving the next outcome, a new one is started if the current one is
    /// complete.
    pub(crate) fn next_node(&mut self) -> &mut QueryResult {
        if self.current().complete {
            self.results.push(QueryResult::new());
        }
        self.current()
    }

    /// The node receiving notices.
    pub(crate) fn current(&mut self) -> &mut QueryResult {
        if self.results.is_empty() {
            self.results.push(QueryResult::new());
        }
        let last = self.results.len() - 1;
        &mut self.results[last]
    }

    /// Drop a trailing node that never received anything.
    pub(crate) fn finish(&mut self) {
        if let Some(last) = self.results.last() {
            if !last.complete && last.notices.is_empty() && self.results.len() > 1 {
                self.results.pop();
            }
        }
    }

    /// Apply abort policy, `Err` contains the first error message for [`OnAbort::Discard`].
    pub(crate) fn apply(&mut self, policy: OnAbort) -> Result<(), String> {
        let Some(idx) = self.results.iter().position(QueryResult::is_aborted) else {
            return Ok(());
        };
        self.results.truncate(idx + 1);
        match policy {
            OnAbort::Inspect => {}
            OnAbort::ErrorTail => {
                self.results.drain(..idx);
            }
            OnAbort::Discard => {
                let message = self.results[idx].message.take().unwrap_or_default();
                self.results.clear();
                return Err(message);
            }
        }
        Ok(())
    }

    /// The first aborted node.
    pub fn error(&self) -> Option<&QueryResult> {
        self.results.iter().find(|e| e.is_aborted())
    }

    pub fn is_aborted(&self) -> bool {
        self.error().is_some()
    }

    pub fn first(&self) -> Option<&QueryResult> {
        self.results.first()
    }

    pub fn last(&self) -> Option<&QueryResult> {
        self.results.last()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueryResult> {
        self.results.iter()
    }

    pub fn as_slice(&self) -> &[QueryResult] {
        &self.results
    }

    pub fn into_vec(self) -> Vec<QueryResult> {
        self.results
    }
}

impl std::ops::Index<usize> for ResultChain {
    type Output = QueryResult;

    fn index(&self, index: usize) -> &Self::Output {
        &self.results[index]
    }
}

impl IntoIterator for ResultChain {
    type Item = QueryResult;
    type IntoIter = std::vec::IntoIter<QueryResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a> IntoIterator for &'a ResultChain {
    type Item = &'a QueryResult;
    type IntoIter = std::slice::Iter<'a, QueryResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}
