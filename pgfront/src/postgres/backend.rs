//! Postgres Backend Messages
//!
//! Messages before protocol 3.0 are not length prefixed, each type is read field by
//! field right after its message type byte is consumed.
use tokio::io::{AsyncRead, AsyncWrite};

use super::{ProtocolError, ServerError};
use crate::{Result, stream::PgStream};

macro_rules! msgtype {
    ($($name:ident = $ty:literal,)*) => {
        $(
            #[doc = concat!("`", stringify!($ty), "` message type.")]
            pub const $name: u8 = $ty;
        )*

        /// Get message name from message type.
        ///
        /// Returns `"Unknown"` for unknown message type. Note that `D` and `B` are named by
        /// their meaning inside a row set.
        pub fn message_name(msgtype: u8) -> &'static str {
            match msgtype {
                $($ty => stringify!($name),)*
                _ => "Unknown",
            }
        }
    };
}

msgtype! {
    NOTIFICATION_RESPONSE = b'A',
    BINARY_ROW = b'B',
    COMMAND_COMPLETE = b'C',
    ASCII_ROW = b'D',
    ERROR_RESPONSE = b'E',
    COPY_IN_RESPONSE = b'G',
    COPY_OUT_RESPONSE = b'H',
    EMPTY_QUERY_RESPONSE = b'I',
    BACKEND_KEY_DATA = b'K',
    NOTICE_RESPONSE = b'N',
    CURSOR_RESPONSE = b'P',
    AUTHENTICATION = b'R',
    ROW_DESCRIPTION = b'T',
    READY_FOR_QUERY = b'Z',
}

/// Identifies the message as an authentication request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V4 authentication is required.
    KerberosV4,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that a `crypt()`-encrypted password is required.
    Crypt {
        salt: [u8; 2],
    },
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that an SCM credentials message is required.
    ScmCredential,
}

impl Authentication {
    pub const MSGTYPE: u8 = AUTHENTICATION;

    /// Read the request after its message type.
    pub async fn read<S>(stream: &mut PgStream<S>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let auth = match stream.get_i32().await? {
            0 => Self::Ok,
            1 => Self::KerberosV4,
            2 => Self::KerberosV5,
            3 => Self::CleartextPassword,
            4 => {
                let salt = stream.get_bytes(2).await?;
                Self::Crypt { salt: [salt[0], salt[1]] }
            }
            5 => {
                let salt = stream.get_bytes(4).await?;
                Self::MD5Password { salt: [salt[0], salt[1], salt[2], salt[3]] }
            }
            6 => Self::ScmCredential,
            code => return Err(ProtocolError::UnknownAuth { code }.into()),
        };
        Ok(auth)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::KerberosV4 => "KerberosV4",
            Self::KerberosV5 => "KerberosV5",
            Self::CleartextPassword => "CleartextPassword",
            Self::Crypt { .. } => "Crypt",
            Self::MD5Password { .. } => "MD5Password",
            Self::ScmCredential => "ScmCredential",
        }
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue CancelRequest messages later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = BACKEND_KEY_DATA;

    pub async fn read<S>(stream: &mut PgStream<S>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Ok(Self {
            process_id: stream.get_i32().await?,
            secret_key: stream.get_i32().await?,
        })
    }
}

/// Asynchronous notification from `NOTIFY`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationResponse {
    pub process_id: i32,
    pub channel: String,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = NOTIFICATION_RESPONSE;

    pub async fn read<S>(stream: &mut PgStream<S>) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        Ok(Self {
            process_id: stream.get_i32().await?,
            channel: stream.get_string().await?,
        })
    }
}

/// Read the message of `ErrorResponse`.
pub async fn read_error<S>(stream: &mut PgStream<S>) -> Result<ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Ok(ServerError::new(stream.get_string().await?))
}

/// Consume the nul that follows `EmptyQueryResponse`.
pub async fn read_empty_query<S>(stream: &mut PgStream<S>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.get_u8().await? {
        0 => Ok(()),
        found => Err(ProtocolError::EmptyQueryTerminator { found }.into()),
    }
}
