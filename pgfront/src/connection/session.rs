//! Session setup after authentication.
//!
//! These queries run on the transport held by the handshake, before the connection is
//! advertised as ready. A failed setting is kept as a warning, only a dead transport
//! or a refused encoding fails the connect.
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use super::Config;
use crate::{
    ErrorKind, Result,
    common::report,
    postgres::{Generation, ServerError, ServerVersion},
    query::{
        OnAbort, QueryResult, ResultChain,
        engine::{self, Exec, Outcome},
    },
    stream::PgStream,
    transaction::TransactionTracker,
};

/// Encoding of a server that never reported one.
pub(crate) const SQL_ASCII: &str = "SQL_ASCII";

/// Encoding name after switching to utf8.
pub(crate) const UNICODE: &str = "UNICODE";

/// What the setup learned about the session.
#[derive(Debug)]
pub(crate) struct Session {
    pub version: ServerVersion,
    pub encoding: String,
    pub warnings: Vec<String>,
}

struct Setup<'a, S> {
    io: &'a mut PgStream<S>,
    tx: &'a Mutex<TransactionTracker>,
    generation: Generation,
    version: ServerVersion,
    warnings: Vec<String>,
}

impl<S> Setup<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn query(&mut self, sql: &str) -> Result<ResultChain> {
        let exec = Exec {
            generation: self.generation,
            version: self.version,
            sql,
            begin: false,
            cursor: None,
        };
        let Outcome { mut chain, .. } = engine::run(&mut *self.io, &exec, self.tx).await?;
        chain.apply(OnAbort::Discard).map_err(ServerError::new)?;
        Ok(chain)
    }

    /// Run `sql`, a failure that keeps the connection alive becomes a warning.
    async fn try_query(&mut self, sql: &str) -> Result<Option<ResultChain>> {
        match self.query(sql).await {
            Ok(chain) => Ok(Some(chain)),
            Err(err) if err.is_connection_dead() => Err(err),
            Err(err) => {
                report!(warn, "startup statement `{sql}` failed: {err}");
                self.warnings.push(format!("{sql}: {}", err.message()));
                Ok(None)
            }
        }
    }

    async fn lookup_version(&mut self) -> Result<()> {
        if let Some(chain) = self.try_query("select version()").await? {
            let text = first_value(&chain).unwrap_or_default();
            self.version = ServerVersion::parse(&text);
        }
        Ok(())
    }

    async fn send_settings(&mut self, config: &Config) -> Result<()> {
        let mut statements = vec!["set DateStyle to 'ISO'"];
        if config.disable_optimizer {
            statements.push("set geqo to 'OFF'");
        }
        if config.ksqo && !self.version.at_least(7, 1) {
            statements.push("set ksqo to 'ON'");
        }
        if self.version.at_least(7, 4) {
            statements.push("set extra_float_digits to 2");
        }
        statements.extend(config.setting_statements());

        for sql in statements {
            self.try_query(sql).await?;
        }
        Ok(())
    }

    /// Client encoding as the server reports it.
    async fn server_encoding(&mut self) -> Result<Option<String>> {
        if self.version.at_least(7, 2) {
            let chain = self.try_query("select pg_client_encoding()").await?;
            return Ok(chain.as_ref().and_then(first_value));
        }

        // older servers answer with a notice, e.g. `Current client encoding is SQL_ASCII`
        let chain = self.try_query("show client_encoding").await?;
        let encoding = chain
            .iter()
            .flat_map(ResultChain::iter)
            .find_map(QueryResult::notice)
            .and_then(|notice| notice.split_whitespace().last())
            .map(|e| e.trim_matches(|c| c == '\'' || c == '"').to_owned());
        Ok(encoding)
    }

    async fn lookup_encoding(&mut self, config: &Config) -> Result<String> {
        let requested = config.requested_encoding();
        let current = self.server_encoding().await?;

        if let Some(requested) = requested {
            if current.as_deref().is_none_or(|e| !e.eq_ignore_ascii_case(requested)) {
                let sql = format!("set client_encoding to '{requested}'");
                if self.try_query(&sql).await?.is_some() {
                    return Ok(requested.to_owned());
                }
            }
        }

        Ok(current.unwrap_or_else(|| SQL_ASCII.to_owned()))
    }

    async fn switch_unicode(&mut self, config: &Config, encoding: &mut String) -> Result<()> {
        if !self.version.at_least(6, 4) {
            return Err(ErrorKind::Encoding("Unicode isn't supported before 6.4").into());
        }

        let wants_utf8 = config
            .requested_encoding()
            .is_none_or(|e| e.eq_ignore_ascii_case(UNICODE) || e.eq_ignore_ascii_case("UTF8"));
        if !wants_utf8 {
            return Ok(());
        }

        if !self.version.at_least(7, 1) {
            return Err(ErrorKind::Encoding("UTF-8 conversion isn't implemented before 7.1").into());
        }

        if self.try_query("set client_encoding to 'UTF8'").await?.is_some() {
            *encoding = UNICODE.to_owned();
        }
        Ok(())
    }
}

fn first_value(chain: &ResultChain) -> Option<String> {
    chain
        .iter()
        .flat_map(QueryResult::rows)
        .next()
        .and_then(|row| row.get_str(0))
        .map(str::to_owned)
}

/// Version lookup, settings, then character set.
///
/// Settings depend on the version, the version query therefore runs first.
pub(crate) async fn start<S>(
    io: &mut PgStream<S>,
    generation: Generation,
    config: &Config,
    tx: &Mutex<TransactionTracker>,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut setup = Setup {
        io,
        tx,
        generation,
        version: generation.nominal_version(),
        warnings: Vec::new(),
    };

    setup.lookup_version().await?;
    setup.send_settings(config).await?;

    let mut encoding = if setup.version.at_least(6, 4) {
        setup.lookup_encoding(config).await?
    } else {
        SQL_ASCII.to_owned()
    };

    if config.unicode {
        setup.switch_unicode(config, &mut encoding).await?;
    }

    Ok(Session { version: setup.version, encoding, warnings: setup.warnings })
}
