//! Cancellation of an in flight query.
use std::sync::Arc;

use crate::{
    common::{report, verbose},
    net::{Connector, TcpConnector},
    postgres::{
        BackendKeyData,
        frontend::{CancelRequest, FrontendProtocol},
    },
    stream::PgStream,
};

/// Detached handle that request cancellation of the query running on a connection.
///
/// The request goes through its own transport, the connection itself is never touched.
/// Cancellation is advisory, the query may complete before the server sees it.
pub struct CancelToken<C: Connector = TcpConnector> {
    connector: Arc<C>,
    host: String,
    port: u16,
    key: BackendKeyData,
}

impl<C: Connector> CancelToken<C> {
    pub(crate) fn new(connector: Arc<C>, host: &str, port: u16, key: BackendKeyData) -> Self {
        Self { connector, host: host.to_owned(), port, key }
    }

    /// Key of the backend this token cancels.
    pub fn backend_key(&self) -> BackendKeyData {
        self.key
    }

    /// Send the cancel request.
    ///
    /// Returns `false` if the request could not be delivered. No acknowledgement is
    /// waited for.
    pub async fn cancel(&self) -> bool {
        match self.try_cancel().await {
            Ok(()) => true,
            Err(_err) => {
                report!(warn, "failed to send cancel request: {_err}");
                false
            }
        }
    }

    async fn try_cancel(&self) -> std::io::Result<()> {
        verbose!(process_id = self.key.process_id, "cancel request");

        let socket = self.connector.connect(&self.host, self.port).await?;
        let mut io = PgStream::new(socket);
        CancelRequest {
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
        }
        .write(&mut io);
        io.shutdown().await
    }
}

impl<C: Connector> Clone for CancelToken<C> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            host: self.host.clone(),
            port: self.port,
            key: self.key,
        }
    }
}

impl<C: Connector> std::fmt::Debug for CancelToken<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("process_id", &self.key.process_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;
    use crate::mock::MockServer;

    /// Connector whose transport cannot be opened.
    struct Unreachable(AtomicUsize);

    impl Connector for Unreachable {
        type Stream = DuplexStream;

        fn connect(&self, _: &str, _: u16) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            self.0.fetch_add(1, Ordering::SeqCst);
            async { Err(io::ErrorKind::ConnectionRefused.into()) }
        }
    }

    /// Connector handing the server side of each pipe to the test.
    struct Capture(std::sync::Mutex<Vec<DuplexStream>>);

    impl Connector for Capture {
        type Stream = DuplexStream;

        fn connect(&self, _: &str, _: u16) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            let (client, server) = duplex(64);
            self.0.lock().unwrap().push(server);
            async move { Ok(client) }
        }
    }

    #[tokio::test]
    async fn cancel_packet() {
        let connector = Arc::new(Capture(Default::default()));
        let token = CancelToken::new(connector.clone(), "localhost", 5432, MockServer::KEY);
        assert!(token.clone().cancel().await);

        let mut server = connector.0.lock().unwrap().remove(0);
        let mut packet = vec![];
        server.read_to_end(&mut packet).await.unwrap();
        assert_eq!(
            packet,
            [0, 0, 0, 16, 4, 210, 22, 46, 0, 0, 16, 146, 0, 0, 94, 237]
        );
    }

    #[tokio::test]
    async fn unreachable() {
        let connector = Arc::new(Unreachable(AtomicUsize::new(0)));
        let token = CancelToken::new(connector.clone(), "localhost", 5432, MockServer::KEY);
        assert!(!token.cancel().await);
        assert_eq!(connector.0.load(Ordering::SeqCst), 1);
    }
}
