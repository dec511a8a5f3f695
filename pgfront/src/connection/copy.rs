//! Copy data phase.
//!
//! A query answered with a copy response leaves the connection waiting on copy data, any
//! other query fails with [`ErrorKind::Busy`] until the phase is finished here. Data is
//! exchanged as text lines, terminated by `\.`.
use super::{Connection, ConnStatus, state::{ExecGuard, PendingCopy}};
use crate::{
    ErrorKind, Result,
    common::verbose,
    ext::MutexExt,
    net::Connector,
    postgres::frontend::{CopyDone, CopyLine, FrontendProtocol},
    query::{
        CopyDirection, QueryResult,
        engine::{self, Exec},
    },
    stream::PgStream,
};

impl<C: Connector> Connection<C> {
    /// Read every line of a pending `COPY ... TO stdout`.
    ///
    /// Returns the lines without their newline, and the result of the copy command.
    pub async fn copy_out(&self) -> Result<(Vec<String>, QueryResult)> {
        let result = self.try_copy_out().await;
        self.record(result)
    }

    /// Send lines to a pending `COPY ... FROM stdin`, then terminate the data.
    pub async fn copy_in<I>(&self, lines: I) -> Result<QueryResult>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let result = self.try_copy_in(lines).await;
        self.record(result)
    }

    /// Whether a copy phase is waiting, and in which direction.
    pub fn pending_copy(&self) -> Option<CopyDirection> {
        self.state.lock_unpoisoned().copy.as_ref().map(|e| e.direction)
    }

    async fn try_copy_out(&self) -> Result<(Vec<String>, QueryResult)> {
        let (mut io, pending, guard) = self.start_copy(CopyDirection::Out)?;

        let mut lines = vec![];
        loop {
            let line = io.get_line().await?;
            if line == CopyDone::LINE {
                break;
            }
            lines.push(line);
        }
        verbose!(lines = lines.len(), "copy out");

        let result = self.finish_copy(io, &pending, guard).await?;
        Ok((lines, result))
    }

    async fn try_copy_in<I>(&self, lines: I) -> Result<QueryResult>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let (mut io, pending, guard) = self.start_copy(CopyDirection::In)?;

        for line in lines {
            CopyLine(line.as_ref()).write(&mut io);
        }
        CopyDone.write(&mut io);
        io.flush().await?;

        self.finish_copy(io, &pending, guard).await
    }

    fn start_copy(
        &self,
        direction: CopyDirection,
    ) -> Result<(PgStream<C::Stream>, PendingCopy, ExecGuard<'_, C::Stream>)> {
        let mut state = self.state.lock_unpoisoned();
        match state.status {
            ConnStatus::Executing => return Err(ErrorKind::Busy.into()),
            ConnStatus::NotConnected | ConnStatus::Down => return Err(ErrorKind::NotConnected.into()),
            ConnStatus::Connected => {}
        }

        if state.copy.as_ref().is_none_or(|e| e.direction != direction) {
            return Err(ErrorKind::NoCopy.into());
        }
        let Some(io) = state.io.take() else {
            return Err(ErrorKind::NotConnected.into());
        };
        let Some(pending) = state.copy.take() else {
            return Err(ErrorKind::NoCopy.into());
        };
        state.status = ConnStatus::Executing;

        Ok((io, pending, ExecGuard::new(&self.state, &self.tx, ConnStatus::Down)))
    }

    async fn finish_copy(
        &self,
        mut io: PgStream<C::Stream>,
        pending: &PendingCopy,
        guard: ExecGuard<'_, C::Stream>,
    ) -> Result<QueryResult> {
        let (generation, version) = {
            let state = self.state.lock_unpoisoned();
            (state.generation, state.version)
        };
        let exec = Exec { generation, version, sql: &pending.sql, begin: false, cursor: None };
        let result = engine::finish_copy(&mut io, &exec, pending.polls, &self.tx).await?;

        let mut state = self.state.lock_unpoisoned();
        state.io = Some(io);
        state.status = ConnStatus::Connected;
        guard.disarm();
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        Connection, ErrorKind, ResultStatus,
        connection::ConnStatus,
        mock::{MockServer, Reply},
        postgres::ProtocolError,
        query::CopyDirection,
    };

    #[tokio::test]
    async fn copy_out() {
        let mock = MockServer::new("7.4");
        let conn = Connection::with_connector(MockServer::config(), mock.clone());
        conn.handshake().await.unwrap();

        let chain = conn.execute("copy people to stdout").await.unwrap();
        assert_eq!(chain.last().map(|e| e.status()), Some(ResultStatus::CopyOut));
        assert_eq!(conn.pending_copy(), Some(CopyDirection::Out));

        assert!(matches!(conn.execute("select 1").await.unwrap_err().kind(), ErrorKind::Busy));
        assert!(matches!(conn.copy_in(["x"]).await.unwrap_err().kind(), ErrorKind::NoCopy));

        let (lines, result) = conn.copy_out().await.unwrap();
        assert_eq!(lines, ["1\tbob", "2\tcarol"]);
        assert_eq!(result.command(), Some("COPY"));
        assert_eq!(conn.pending_copy(), None);
        assert_eq!(conn.status(), ConnStatus::Connected);

        conn.execute("select 1").await.unwrap();
    }

    #[tokio::test]
    async fn copy_in() {
        let mock = MockServer::new("7.4");
        let conn = Connection::with_connector(MockServer::config(), mock.clone());
        conn.handshake().await.unwrap();

        assert!(matches!(conn.copy_in(["x"]).await.unwrap_err().kind(), ErrorKind::NoCopy));

        let chain = conn.execute("copy people from stdin").await.unwrap();
        assert_eq!(chain.last().map(|e| e.status()), Some(ResultStatus::CopyIn));
        assert_eq!(conn.pending_copy(), Some(CopyDirection::In));

        let result = conn.copy_in(["3\tdave", "4\terin"]).await.unwrap();
        assert_eq!(result.command(), Some("COPY"));
        assert_eq!(mock.copied(), ["3\tdave", "4\terin"]);
        assert_eq!(conn.status(), ConnStatus::Connected);
    }

    #[tokio::test]
    async fn legacy_copy() {
        let mock = MockServer::new("6.3").handler(|sql| {
            (sql == "copy people from stdin").then(|| vec![Reply::CopyIn, Reply::complete("COPY")])
        });
        let config = MockServer::config().protocol(crate::Generation::Legacy63);
        let conn = Connection::with_connector(config, mock.clone());
        conn.handshake().await.unwrap();

        conn.execute("copy people from stdin").await.unwrap();
        let result = conn.copy_in(["5\tfrank"]).await.unwrap();
        assert_eq!(result.command(), Some("COPY"));
        assert_eq!(mock.copied(), ["5\tfrank"]);

        let chain = conn.execute("select 1").await.unwrap();
        assert_eq!(chain[0].rows()[0].get_str(0), Some("1"));
    }

    #[tokio::test]
    async fn legacy_copy_out_after_statement() {
        let mock = MockServer::new("6.3");
        let config = MockServer::config().protocol(crate::Generation::Legacy63);
        let conn = Connection::with_connector(config, mock.clone());
        conn.handshake().await.unwrap();

        let chain = conn.execute("insert into t values (1); copy people to stdout").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].command(), Some("INSERT 0 1"));
        assert_eq!(chain[1].status(), ResultStatus::CopyOut);

        let (lines, result) = conn.copy_out().await.unwrap();
        assert_eq!(lines, ["1\tbob", "2\tcarol"]);
        assert_eq!(result.command(), Some("COPY"));

        let chain = conn.execute("select 1").await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].status(), ResultStatus::TuplesOk);
        assert_eq!(chain[0].rows()[0].get_str(0), Some("1"));

        let chain = conn.execute("update t set a = 1").await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].command(), Some("UPDATE 1"));
        assert_eq!(conn.status(), ConnStatus::Connected);
    }

    #[tokio::test]
    async fn legacy_copy_in_after_statement() {
        let mock = MockServer::new("6.3");
        let config = MockServer::config().protocol(crate::Generation::Legacy63);
        let conn = Connection::with_connector(config, mock.clone());
        conn.handshake().await.unwrap();

        let err = conn.execute("insert into t values (1); copy people from stdin").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(ProtocolError::CopyInAfterPoll)));
        assert_eq!(conn.status(), ConnStatus::Down);
        assert_eq!(conn.pending_copy(), None);
        assert!(mock.copied().is_empty());
    }
}
