//! Startup and authentication phase.
//!
//! The newest configured generation is tried first. When the server reject it as an
//! unsupported frontend protocol, the whole exchange is retried on a new transport with
//! the next older generation, until none is left.
use tokio::io::{AsyncRead, AsyncWrite};

use super::Config;
use crate::{
    Error, ErrorKind, Result,
    common::{report, verbose},
    error::AuthError,
    net::Connector,
    postgres::{
        Authentication, BackendKeyData, Generation, PasswordChallenge, ProtocolError, ServerError,
        backend,
        frontend::{FrontendProtocol, PasswordMessage, Query, Startup},
    },
    stream::PgStream,
};

/// Text of the error sent by servers that do not speak the requested generation.
const UNSUPPORTED_PROTOCOL: &str = "unsupported frontend protocol";

/// Outcome of [`Connection::handshake`][crate::Connection::handshake].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handshake {
    /// The connection is ready for queries.
    Connected,
    /// The server asked for a password but none is configured.
    ///
    /// The transport is kept open, resume with
    /// [`Connection::authenticate`][crate::Connection::authenticate].
    NeedsPassword(PasswordChallenge),
}

/// Transport past the startup packet.
#[derive(Debug)]
pub(crate) struct Opened<S> {
    pub io: PgStream<S>,
    pub generation: Generation,
    pub key: Option<BackendKeyData>,
}

#[derive(Debug)]
pub(crate) enum AuthStep<S> {
    /// Authenticated, and the database answered the probe.
    Ready(Opened<S>),
    NeedsPassword(Opened<S>, PasswordChallenge),
}

/// Server reply to the startup of one generation.
enum Reply<S> {
    Accepted(AuthStep<S>),
    Rejected(ServerError),
}

fn is_unsupported_protocol(err: &ServerError) -> bool {
    err.message().to_ascii_lowercase().contains(UNSUPPORTED_PROTOCOL)
}

/// Open a transport and run the startup phase, downgrading the generation as needed.
pub(crate) async fn open<C: Connector>(connector: &C, config: &Config) -> Result<AuthStep<C::Stream>> {
    let mut generation = config.protocol;

    loop {
        verbose!(%generation, host = %config.host, port = config.port, "startup");

        let socket = connector.connect(&config.host, config.port).await?;
        let mut io = PgStream::new(socket);

        Startup {
            layout: generation.startup_layout(),
            database: &config.database,
            user: &config.user,
        }
        .write(&mut io);
        io.flush().await?;
        io.set_byte_order(generation.byte_order());

        let opened = Opened { io, generation, key: None };
        let reply = if generation.authenticates() {
            authenticate(opened, &config.user, config.password.as_deref()).await?
        } else {
            ready(opened).await?
        };

        match reply {
            Reply::Accepted(step) => return Ok(step),
            Reply::Rejected(err) => match generation.downgrade() {
                Some(older) => {
                    report!(warn, "protocol {generation} rejected, retrying with {older}");
                    generation = older;
                }
                None => {
                    report!(error, "every protocol generation rejected: {err}");
                    return Err(ProtocolError::Unsupported { message: err.message().to_owned() }.into());
                }
            },
        }
    }
}

/// Answer a pending password challenge and finish the startup phase.
pub(crate) async fn resume<S>(
    mut opened: Opened<S>,
    challenge: PasswordChallenge,
    user: &str,
    password: &str,
) -> Result<AuthStep<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_password(&mut opened.io, challenge, user, password).await?;
    match authenticate(opened, user, Some(password)).await? {
        Reply::Accepted(step) => Ok(step),
        Reply::Rejected(err) => Err(Error::from(ErrorKind::NoSuchDatabase).with_context(err.message())),
    }
}

async fn send_password<S>(
    io: &mut PgStream<S>,
    challenge: PasswordChallenge,
    user: &str,
    password: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    verbose!(method = challenge.name(), "password response");
    let response = challenge.response(user, password);
    PasswordMessage { password: &response }.write(io);
    io.flush().await?;
    Ok(())
}

/// Authentication loop.
///
/// Protocol 2.0 ends it with `ReadyForQuery`, protocol 1.0 with `AuthenticationOk`.
async fn authenticate<S>(
    mut opened: Opened<S>,
    user: &str,
    password: Option<&str>,
) -> Result<Reply<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let modern = opened.generation.has_ready_for_query();

    loop {
        let msgtype = opened.io.get_u8().await?;
        verbose!(msgtype = backend::message_name(msgtype), "backend message");

        match msgtype {
            backend::ERROR_RESPONSE => {
                let err = backend::read_error(&mut opened.io).await?;
                if is_unsupported_protocol(&err) {
                    return Ok(Reply::Rejected(err));
                }
                report!(error, "authentication failed: {err}");
                return Err(err.into());
            }
            Authentication::MSGTYPE => {
                let auth = Authentication::read(&mut opened.io).await?;
                verbose!(method = auth.name(), "authentication request");

                if auth == Authentication::Ok {
                    if modern {
                        continue;
                    }
                    break;
                }

                let Some(challenge) = PasswordChallenge::from_request(auth) else {
                    report!(error, "unsupported authentication method: {}", auth.name());
                    return Err(AuthError::Unsupported(auth.name()).into());
                };

                match password {
                    Some(password) => send_password(&mut opened.io, challenge, user, password).await?,
                    None => return Ok(Reply::Accepted(AuthStep::NeedsPassword(opened, challenge))),
                }
            }
            BackendKeyData::MSGTYPE => {
                opened.key = Some(BackendKeyData::read(&mut opened.io).await?);
            }
            backend::READY_FOR_QUERY if modern => break,
            backend::NOTICE_RESPONSE => {
                let _notice = opened.io.get_string().await?;
                verbose!(notice = %_notice, "notice ignored");
            }
            f => return Err(ProtocolError::unexpected(f, "authentication").into()),
        }
    }

    ready(opened).await
}

/// Send an empty query, anything but an empty query response means the database
/// is not there.
async fn ready<S>(mut opened: Opened<S>) -> Result<Reply<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io = &mut opened.io;
    Query { sql: " ", begin: false }.write(io);
    io.flush().await?;

    let modern = opened.generation.has_ready_for_query();
    let mut empty = false;

    loop {
        match io.get_u8().await? {
            backend::EMPTY_QUERY_RESPONSE => {
                backend::read_empty_query(io).await?;
                if !modern {
                    break;
                }
                empty = true;
            }
            backend::READY_FOR_QUERY if empty => break,
            backend::NOTICE_RESPONSE => {
                let _notice = io.get_string().await?;
            }
            backend::ERROR_RESPONSE => {
                let err = backend::read_error(io).await?;
                if is_unsupported_protocol(&err) {
                    return Ok(Reply::Rejected(err));
                }
                report!(error, "empty query failed: {err}");
                return Err(Error::from(ErrorKind::NoSuchDatabase).with_context(err.message()));
            }
            _f => {
                report!(error, "unexpected reply to the empty query: {}", backend::message_name(_f));
                return Err(ErrorKind::NoSuchDatabase.into());
            }
        }
    }

    Ok(Reply::Accepted(AuthStep::Ready(opened)))
}
