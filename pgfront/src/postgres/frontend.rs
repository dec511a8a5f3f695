//! Postgres Frontend Messages
use crate::{
    ext::{BufMutExt, UsizeExt},
    stream::PgStream,
};

use super::version::StartupLayout;

/// Auth type in the 6.2 startup packet, authentication is negotiated elsewhere.
pub const NO_AUTHENTICATION: u32 = 7;

/// The protocol version sent in a cancel request, `1234.5678`.
pub const CANCEL_REQUEST_CODE: u32 = (1234 << 16) | 5678;

const SM_DATABASE: usize = 64;
const SM_USER: usize = 32;
const SM_OPTIONS: usize = 64;
const SM_UNUSED: usize = 64;
const SM_TTY: usize = 64;

const PATH_SIZE: usize = 64;
const USRNAMEDATALEN: usize = 16;
const ARGV_SIZE: usize = 64;

/// A type that can be written as postgres frontend message.
///
/// Writing only buffer the message, the stream must be flushed afterwards.
pub trait FrontendProtocol {
    fn write<S>(self, stream: &mut PgStream<S>);
}

/// The very first message sent by the frontend.
///
/// It is a fixed size struct prefixed with its length. For historical reasons both are
/// always in network byte order, even for the generation that reverse other integers.
pub struct Startup<'a> {
    pub layout: StartupLayout,
    pub database: &'a str,
    pub user: &'a str,
}

impl Startup<'_> {
    /// Total packet size, including the length itself.
    pub fn size(&self) -> usize {
        4 + match self.layout {
            StartupLayout::Legacy => 4 + PATH_SIZE + USRNAMEDATALEN + ARGV_SIZE * 2 + PATH_SIZE,
            StartupLayout::Versioned { .. } => 4 + SM_DATABASE + SM_USER + SM_OPTIONS + SM_UNUSED + SM_TTY,
        }
    }
}

impl FrontendProtocol for Startup<'_> {
    fn write<S>(self, stream: &mut PgStream<S>) {
        let mut buf = Vec::with_capacity(self.size());
        buf.extend_from_slice(&self.size().to_u32().to_be_bytes());

        match self.layout {
            StartupLayout::Legacy => {
                buf.extend_from_slice(&NO_AUTHENTICATION.to_be_bytes());
                buf.put_padded_str(self.database, PATH_SIZE);
                buf.put_padded_str(self.user, USRNAMEDATALEN);
                buf.put_padded_str("", ARGV_SIZE); // options
                buf.put_padded_str("", ARGV_SIZE); // execfile
                buf.put_padded_str("", PATH_SIZE); // tty
            }
            StartupLayout::Versioned { protocol } => {
                buf.extend_from_slice(&protocol.to_be_bytes());
                buf.put_padded_str(self.database, SM_DATABASE);
                buf.put_padded_str(self.user, SM_USER);
                buf.put_padded_str("", SM_OPTIONS);
                buf.put_padded_str("", SM_UNUSED);
                buf.put_padded_str("", SM_TTY);
            }
        }

        stream.put_slice(&buf);
    }
}

/// Simple query, optionally opening a transaction first.
pub struct Query<'a> {
    pub sql: &'a str,
    pub begin: bool,
}

impl Query<'_> {
    pub const MSGTYPE: u8 = b'Q';

    /// Prepended to the text when `begin` is set.
    pub const IMPLICIT_BEGIN: &'static str = "BEGIN;";
}

impl FrontendProtocol for Query<'_> {
    fn write<S>(self, stream: &mut PgStream<S>) {
        stream.put_u8(Self::MSGTYPE);
        if self.begin {
            stream.put_slice(Self::IMPLICIT_BEGIN.as_bytes());
        }
        stream.put_nul_string(self.sql);
    }
}

/// Password response, the payload is either clear text or a hashed response.
pub struct PasswordMessage<'a> {
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    fn write<S>(self, stream: &mut PgStream<S>) {
        stream.put_i32((4 + self.password.len() + 1).to_u32() as i32);
        stream.put_nul_string(self.password);
    }
}

/// Request to cancel the query in progress on another connection.
///
/// Sent on its own connection, instead of a startup packet.
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub const SIZE: u32 = 16;

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..4].copy_from_slice(&Self::SIZE.to_be_bytes());
        buf[4..8].copy_from_slice(&CANCEL_REQUEST_CODE.to_be_bytes());
        buf[8..12].copy_from_slice(&self.process_id.to_be_bytes());
        buf[12..].copy_from_slice(&self.secret_key.to_be_bytes());
        buf
    }
}

impl FrontendProtocol for CancelRequest {
    fn write<S>(self, stream: &mut PgStream<S>) {
        stream.put_slice(&self.to_bytes());
    }
}

/// Graceful close of the session.
pub struct Terminate;

impl Terminate {
    pub const MSGTYPE: u8 = b'X';
}

impl FrontendProtocol for Terminate {
    fn write<S>(self, stream: &mut PgStream<S>) {
        stream.put_u8(Self::MSGTYPE);
    }
}

/// One row of copy-in data, in text format.
pub struct CopyLine<'a>(pub &'a str);

impl FrontendProtocol for CopyLine<'_> {
    fn write<S>(self, stream: &mut PgStream<S>) {
        stream.put_slice(self.0.as_bytes());
        stream.put_u8(b'\n');
    }
}

/// Terminator of copy data, in both direction.
pub struct CopyDone;

impl CopyDone {
    pub const LINE: &'static str = "\\.";
}

impl FrontendProtocol for CopyDone {
    fn write<S>(self, stream: &mut PgStream<S>) {
        stream.put_slice(Self::LINE.as_bytes());
        stream.put_u8(b'\n');
    }
}
