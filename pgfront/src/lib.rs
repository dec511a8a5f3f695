//! Postgres Frontend for Protocol 1.0 and 2.0
//!
//! Client side of the wire protocol spoken by postgres 6.2 up to 7.4 servers. The
//! protocol generation is negotiated at startup, falling back to older ones when the
//! server rejects the newer.
//!
//! # Examples
//!
//! ```no_run
//! use pgfront::Connection;
//!
//! # async fn app() -> pgfront::Result<()> {
//! let conn = Connection::connect_env().await?;
//!
//! let chain = conn.execute("SELECT 420; UPDATE foo SET bar = 1").await?;
//! assert_eq!(chain[0].rows()[0].get_str(0), Some("420"));
//! assert_eq!(chain[1].rows_affected(), Some(1));
//! # Ok(())
//! # }
//! ```
//!
//! Cancel from another task:
//!
//! ```no_run
//! use pgfront::Connection;
//!
//! # async fn app() -> pgfront::Result<()> {
//! let conn = Connection::connect_env().await?;
//! let token = conn.cancel_token().expect("protocol 2.0 server");
//!
//! tokio::spawn(async move {
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     token.cancel().await;
//! });
//!
//! let chain = conn.execute("select pg_sleep(10)").await?;
//! assert!(chain.is_aborted());
//! # Ok(())
//! # }
//! ```

mod common;
mod ext;
mod net;
mod stream;

// Protocol
pub mod postgres;

// Component
mod statement;
pub mod row;

// Operation
pub mod query;
pub mod transaction;

// Connection
pub mod connection;
mod cancel;

mod error;

#[cfg(test)]
mod mock;


pub use net::{Connector, Socket, TcpConnector};
pub use postgres::{Generation, ServerVersion};
pub use row::{Column, Row};
pub use statement::StatementHandle;

pub use query::{CopyDirection, OnAbort, QueryOptions, QueryResult, ResultChain, ResultStatus};
pub use transaction::TransactionStatus;

pub use connection::{Config, ConnStatus, Connection, Handshake, LastError, StatementLimit};
pub use cancel::CancelToken;
pub use error::{AuthError, Error, ErrorCode, ErrorKind, Result};
