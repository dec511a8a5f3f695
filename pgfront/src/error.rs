//! `pgfront` error types.
use std::{backtrace::Backtrace, fmt, io};

use crate::{
    connection::ParseError,
    postgres::{ProtocolError, ServerError},
};

/// A specialized [`Result`] type for `pgfront` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `pgfront` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Add context to the error message.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Code of the error kind, see [`ErrorCode`].
    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    /// Whether the connection cannot be used after this error.
    ///
    /// Io and protocol errors lose the framing state, while a fatal server error means the
    /// backend is about to exit.
    pub fn is_connection_dead(&self) -> bool {
        match &self.kind {
            ErrorKind::Io(_) | ErrorKind::Protocol(_) => true,
            ErrorKind::Database(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Error message without context and backtrace.
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

/// All possible error kind from `pgfront` library.
pub enum ErrorKind {
    /// Invalid or incomplete configuration.
    Config(ParseError),
    /// Failed to open, read or write the transport.
    Io(io::Error),
    /// Backend sent something unexpected.
    Protocol(ProtocolError),
    /// Authentication could not be completed.
    Auth(AuthError),
    /// Server reported an error.
    Database(ServerError),
    /// Query text is longer than the server accepts.
    QueryTooLong { len: usize, max: usize },
    /// Query text is empty.
    EmptyQuery,
    /// Another operation is in progress on the connection.
    Busy,
    /// Connection is not established or already dead.
    NotConnected,
    /// The empty query probe failed after authentication.
    NoSuchDatabase,
    /// Requested client encoding is not available.
    Encoding(&'static str),
    /// Copy data is exchanged while no copy phase is pending.
    NoCopy,
}

impl ErrorKind {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::Config,
            Self::Io(_) => ErrorCode::Io,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Auth(AuthError::PasswordRequired(_)) => ErrorCode::NeedPassword,
            Self::Auth(_) => ErrorCode::Auth,
            Self::Database(err) if err.is_fatal() => ErrorCode::ServerFatal,
            Self::Database(_) => ErrorCode::ServerError,
            Self::QueryTooLong { .. } => ErrorCode::QueryTooLong,
            Self::EmptyQuery => ErrorCode::EmptyQuery,
            Self::Busy => ErrorCode::Busy,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::NoSuchDatabase => ErrorCode::NoSuchDatabase,
            Self::Encoding(_) => ErrorCode::Encoding,
            Self::NoCopy => ErrorCode::NoCopy,
        }
    }
}

/// Copyable discriminant of [`ErrorKind`], kept in the connection last error slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Config,
    Io,
    Protocol,
    Auth,
    NeedPassword,
    ServerError,
    ServerFatal,
    QueryTooLong,
    EmptyQuery,
    Busy,
    NotConnected,
    NoSuchDatabase,
    Encoding,
    NoCopy,
}

/// Authentication failure.
pub enum AuthError {
    /// The server requested an authentication method that is not supported.
    Unsupported(&'static str),
    /// The server requested a password, but none is configured.
    ///
    /// This is recoverable, see [`Connection::authenticate`][crate::Connection::authenticate].
    PasswordRequired(&'static str),
}

impl std::error::Error for AuthError { }

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(method) => write!(f, "{method} authentication not supported"),
            Self::PasswordRequired(method) => {
                write!(f, "A password is required for this connection ({method})")
            }
        }
    }
}

impl fmt::Debug for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ServerError>e => ErrorKind::Database(e));
from!(<AuthError>e => ErrorKind::Auth(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Auth(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::QueryTooLong { len, max } => {
                write!(f, "Query is too long ({len} bytes), the server accepts at most {max}")
            }
            Self::EmptyQuery => f.write_str("Query text is empty"),
            Self::Busy => f.write_str("Connection is busy with another operation"),
            Self::NotConnected => f.write_str("Connection is not established"),
            Self::NoSuchDatabase => f.write_str(
                "The database does not exist on the server or user authentication failed",
            ),
            Self::Encoding(e) => f.write_str(e),
            Self::NoCopy => f.write_str("No copy phase is pending in this direction"),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_dead() {
        let err = Error::from(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(err.is_connection_dead());
        assert_eq!(err.code(), ErrorCode::Io);

        let err = Error::from(ServerError::new("ERROR:  syntax error".into()));
        assert!(!err.is_connection_dead());
        assert_eq!(err.code(), ErrorCode::ServerError);

        let err = Error::from(ServerError::new("FATAL:  terminating connection".into()));
        assert!(err.is_connection_dead());

        let err = Error::from(AuthError::PasswordRequired("MD5Password"));
        assert_eq!(err.code(), ErrorCode::NeedPassword);
        assert!(!err.is_connection_dead());
    }

    #[test]
    fn context() {
        let err = Error::from(ErrorKind::Busy).with_context("execute");
        assert!(err.to_string().starts_with("execute: Connection is busy"));
        assert_eq!(err.message(), "Connection is busy with another operation");
    }
}
