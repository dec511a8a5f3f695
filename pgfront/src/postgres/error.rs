//! Protocol and server reported errors.
use std::fmt;

use super::backend;
use crate::ext::FmtExt;

/// Backend sent something the frontend cannot make sense of.
///
/// Framing state is lost after this error, the connection is unusable.
pub enum ProtocolError {
    /// Message type is not expected in the current phase.
    Unexpected {
        found: u8,
        phase: &'static str,
    },
    /// Authentication request code is unknown.
    UnknownAuth {
        code: i32,
    },
    /// `EmptyQueryResponse` is not followed by nul.
    EmptyQueryTerminator {
        found: u8,
    },
    /// The server rejected every protocol generation.
    Unsupported {
        message: String,
    },
    /// Copy in started on a server without `ReadyForQuery` while an empty query poll
    /// was outstanding, the poll would be read as copy data.
    CopyInAfterPoll,
}

impl ProtocolError {
    pub(crate) fn unexpected(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { found, phase }
    }
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected { found, phase } => write!(
                f,
                "Unexpected protocol character `{}` ({}) from backend in `{phase}`",
                [*found].lossy(),
                backend::message_name(*found),
            ),
            Self::UnknownAuth { code } => write!(f, "Unknown authentication type ({code})"),
            Self::EmptyQueryTerminator { found } => write!(
                f,
                "Expected nul after empty query response, found `{}`",
                [*found].lossy(),
            ),
            Self::Unsupported { message } => write!(f, "No protocol generation accepted: {message}"),
            Self::CopyInAfterPoll => f.write_str("Copy in cannot follow another statement in the same query on this server"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Error message reported by the server.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerError {
    message: String,
}

impl ServerError {
    /// Marker of an error that also terminates the backend.
    pub const FATAL: &'static str = "FATAL";

    pub(crate) fn new(mut message: String) -> ServerError {
        if message.ends_with('\n') {
            message.pop();
        }
        Self { message }
    }

    /// The message as sent by the server, without the trailing newline.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the server is about to close the connection.
    pub fn is_fatal(&self) -> bool {
        self.message.starts_with(Self::FATAL)
    }
}

impl std::error::Error for ServerError { }

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
