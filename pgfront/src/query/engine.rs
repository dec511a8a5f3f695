//! Simple query exchange.
//!
//! One query text is sent, then backend messages are read until the server is done with
//! it. Protocol 2.0 ends every response with `ReadyForQuery`. Older servers do not, thus
//! after the first command completes, an empty query is sent and the response is only
//! finished once its `EmptyQueryResponse` comes back.
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{
    fetch::{RowSetEnd, read_row_set},
    result::{QueryResult, ResultChain, ResultStatus},
};
use crate::{
    Result,
    common::verbose,
    ext::MutexExt,
    postgres::{
        Generation, ProtocolError, ServerError, ServerVersion,
        backend::{self, NotificationResponse},
        frontend::{FrontendProtocol, Query},
    },
    stream::PgStream,
    transaction::{CommandTag, TransactionTracker},
};

/// Query sent to poll the end of a response on servers without `ReadyForQuery`.
const POLL_QUERY: &str = " ";

/// Direction of a pending copy phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyDirection {
    In,
    Out,
}

/// Parameters of one exchange.
#[derive(Debug)]
pub(crate) struct Exec<'a> {
    pub generation: Generation,
    pub version: ServerVersion,
    pub sql: &'a str,
    /// `BEGIN;` is prepended.
    pub begin: bool,
    pub cursor: Option<&'a str>,
}

/// Successful exchange.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub chain: ResultChain,
    /// A transaction ended, marked plans can be discarded.
    pub flush: bool,
    /// The exchange stopped at a copy phase.
    pub copy: Option<CopyDirection>,
    /// Empty query polls still unanswered when the copy phase started.
    pub polls: u32,
}

/// Read loop state.
struct Exchange<'a> {
    exec: &'a Exec<'a>,
    tx: &'a Mutex<TransactionTracker>,
    chain: ResultChain,
    pending_begin: bool,
    completed: bool,
    flush: bool,
    /// Outstanding `EmptyQueryResponse` before the response is done.
    empty_reqs: u32,
    polling: bool,
}

impl<'a> Exchange<'a> {
    fn new(exec: &'a Exec<'a>, tx: &'a Mutex<TransactionTracker>) -> Self {
        Self {
            exec,
            tx,
            chain: ResultChain::new(),
            pending_begin: exec.begin,
            completed: false,
            flush: false,
            empty_reqs: u32::from(exec.sql.trim().is_empty()),
            polling: false,
        }
    }

    /// Returns `false` if the tag belongs to the implicit `BEGIN`.
    fn on_command(&mut self, command: String) -> bool {
        let tag = CommandTag::parse(&command);
        let effect = self.tx.lock_unpoisoned().observe(tag, self.exec.sql, self.exec.version);
        self.flush |= effect.flush;

        if self.pending_begin && tag == CommandTag::Begin {
            self.pending_begin = false;
            return false;
        }

        self.chain.next_node().set_command(command);
        self.completed = true;
        true
    }

    /// Non fatal server error.
    fn on_error(&mut self, err: ServerError) {
        verbose!(error = err.message(), "statement aborted");
        self.tx.lock_unpoisoned().observe_error();
        self.chain.next_node().set_error(err.message().to_owned());
        self.completed = true;
    }

    fn on_empty_query(&mut self) {
        if self.polling {
            self.empty_reqs = self.empty_reqs.saturating_sub(1);
            self.polling = self.empty_reqs > 0;
            return;
        }

        let node = self.chain.next_node();
        node.status = ResultStatus::EmptyQuery;
        node.complete = true;
        self.empty_reqs = self.empty_reqs.saturating_sub(1);
        self.completed = true;
    }

    fn is_done(&self) -> bool {
        self.empty_reqs == 0 && self.completed
    }
}

/// Send one query and read its response.
///
/// Any error returned means the connection is unusable, a non fatal server error is
/// recorded in the chain instead.
pub(crate) async fn run<S>(
    io: &mut PgStream<S>,
    exec: &Exec<'_>,
    tx: &Mutex<TransactionTracker>,
) -> Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    verbose!(sql = exec.sql, begin = exec.begin, "simple query");

    Query { sql: exec.sql, begin: exec.begin }.write(io);
    io.flush().await?;

    let modern = exec.generation.has_ready_for_query();
    let mut ex = Exchange::new(exec, tx);
    let mut copy = None;

    loop {
        let msgtype = io.get_u8().await?;
        verbose!(msgtype = backend::message_name(msgtype), "backend message");

        match msgtype {
            backend::COMMAND_COMPLETE => {
                let command = io.get_string().await?;
                if ex.on_command(command) && !modern && ex.empty_reqs == 0 {
                    send_poll(io, &mut ex).await?;
                }
            }
            backend::READY_FOR_QUERY => {
                if ex.is_done() {
                    break;
                }
                verbose!("stale ReadyForQuery");
            }
            backend::NOTICE_RESPONSE => {
                let notice = io.get_string().await?;
                ex.chain.current().notices.push(notice);
            }
            backend::EMPTY_QUERY_RESPONSE => {
                backend::read_empty_query(io).await?;
                ex.on_empty_query();
            }
            backend::ERROR_RESPONSE => {
                let err = backend::read_error(io).await?;
                if err.is_fatal() {
                    return Err(err.into());
                }
                ex.on_error(err);
            }
            backend::ROW_DESCRIPTION => {
                let node = ex.chain.next_node();
                if let Some(cursor) = exec.cursor {
                    node.cursor = Some(cursor.to_owned());
                    tx.lock_unpoisoned().open_cursor(cursor);
                }
                match read_row_set(io, exec.version, node).await? {
                    RowSetEnd::Complete(command) => {
                        if ex.on_command(command) && !modern && ex.empty_reqs == 0 {
                            send_poll(io, &mut ex).await?;
                        }
                    }
                    RowSetEnd::Error(err) if err.is_fatal() => return Err(err.into()),
                    RowSetEnd::Error(err) => ex.on_error(err),
                }
            }
            backend::ASCII_ROW | backend::COPY_IN_RESPONSE => {
                if ex.polling {
                    // the server would read the poll query as copy data
                    return Err(ProtocolError::CopyInAfterPoll.into());
                }
                start_copy(&mut ex.chain, ResultStatus::CopyIn);
                copy = Some(CopyDirection::In);
                break;
            }
            backend::BINARY_ROW | backend::COPY_OUT_RESPONSE => {
                start_copy(&mut ex.chain, ResultStatus::CopyOut);
                copy = Some(CopyDirection::Out);
                break;
            }
            NotificationResponse::MSGTYPE => {
                let _notify = NotificationResponse::read(io).await?;
                verbose!(?_notify, "notification ignored");
            }
            backend::CURSOR_RESPONSE => {
                let _portal = io.get_string().await?;
            }
            f => return Err(ProtocolError::unexpected(f, "simple query").into()),
        }

        if !modern && ex.is_done() {
            break;
        }
    }

    ex.chain.finish();
    let polls = if ex.polling { ex.empty_reqs } else { 0 };
    Ok(Outcome { chain: ex.chain, flush: ex.flush, copy, polls })
}

async fn send_poll<S>(io: &mut PgStream<S>, ex: &mut Exchange<'_>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Query { sql: POLL_QUERY, begin: false }.write(io);
    io.flush().await?;
    ex.empty_reqs += 1;
    ex.polling = true;
    Ok(())
}

fn start_copy(chain: &mut ResultChain, status: ResultStatus) {
    let node = chain.next_node();
    node.status = status;
    node.complete = true;
}

/// Read the end of a copy phase, up to the end of the response.
///
/// `polls` empty query replies requested before the copy started are drained too.
pub(crate) async fn finish_copy<S>(
    io: &mut PgStream<S>,
    exec: &Exec<'_>,
    polls: u32,
    tx: &Mutex<TransactionTracker>,
) -> Result<QueryResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let modern = exec.generation.has_ready_for_query();
    let mut ex = Exchange::new(exec, tx);
    ex.empty_reqs = polls;
    ex.polling = polls > 0;

    loop {
        let msgtype = io.get_u8().await?;
        verbose!(msgtype = backend::message_name(msgtype), "backend message");

        match msgtype {
            backend::COMMAND_COMPLETE => {
                let command = io.get_string().await?;
                ex.on_command(command);
            }
            backend::ERROR_RESPONSE => {
                let err = backend::read_error(io).await?;
                if err.is_fatal() {
                    return Err(err.into());
                }
                ex.on_error(err);
            }
            backend::NOTICE_RESPONSE => {
                let notice = io.get_string().await?;
                ex.chain.current().notices.push(notice);
            }
            backend::EMPTY_QUERY_RESPONSE => {
                backend::read_empty_query(io).await?;
                ex.on_empty_query();
            }
            backend::READY_FOR_QUERY if ex.is_done() => break,
            backend::READY_FOR_QUERY => {}
            NotificationResponse::MSGTYPE => {
                let _notify = NotificationResponse::read(io).await?;
            }
            f => return Err(ProtocolError::unexpected(f, "copy").into()),
        }

        if !modern && ex.is_done() {
            break;
        }
    }

    let mut results = ex.chain.into_vec();
    Ok(results.pop().unwrap_or_else(QueryResult::new))
}
