use tracing::{Instrument, trace_span};
use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use pgfront::{Config, Connection, Handshake, Result};

mod print;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::Registry::default()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::from_env();
    let conn = Connection::new(config.clone());

    if let Handshake::NeedsPassword(challenge) = conn.handshake().instrument(trace_span!("handshake")).await? {
        eprintln!("server requires a password ({}), set PGPASSWORD", challenge.name());
        return Ok(());
    }

    println!(
        "connected to {}:{} ({}, server {}, encoding {})",
        config.get_host(),
        config.get_port(),
        conn.generation(),
        conn.server_version(),
        conn.encoding(),
    );
    for warning in conn.startup_warnings() {
        println!("warning: {warning}");
    }

    let queries: Vec<String> = std::env::args().skip(1).collect();
    let queries = if queries.is_empty() { vec!["select version()".to_owned()] } else { queries };

    for sql in &queries {
        let cancel = conn.cancel_token();
        let query = conn.execute(sql).instrument(trace_span!("execute"));
        tokio::pin!(query);

        let chain = tokio::select! {
            chain = &mut query => chain?,
            _ = tokio::signal::ctrl_c() => {
                let Some(token) = &cancel else {
                    eprintln!("cancel is not available");
                    break;
                };
                if !token.cancel().await {
                    eprintln!("cancel request failed");
                    break;
                }
                eprintln!("cancel requested");
                // the server answers the running query with an error
                query.await?
            }
        };

        println!("=> {sql}");
        print::chain(&chain);

        if conn.pending_copy().is_some() {
            match conn.copy_out().await {
                Ok((lines, _)) => lines.iter().for_each(|line| println!("{line}")),
                Err(err) => eprintln!("copy: {err}"),
            }
        }
    }

    if let Some(err) = conn.take_error() {
        eprintln!("last error ({:?}): {}", err.code, err.message);
    }

    conn.disconnect().await
}
