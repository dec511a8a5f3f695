//! In memory postgres backend for tests.
//!
//! Each connect spawns a task serving the server side of a [`duplex`] pipe. It speaks all
//! three startup layouts, answers every statement of a query from a test handler or a
//! small default table, and recognizes cancel requests.
use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tokio::{
    io::{DuplexStream, duplex},
    sync::Notify,
};

use crate::{
    Config,
    ext::MutexExt,
    net::Connector,
    postgres::{
        BackendKeyData, ByteOrder, Generation,
        auth::md5_response,
        frontend::{CANCEL_REQUEST_CODE, CancelRequest, CopyDone},
    },
    stream::PgStream,
};

type Handler = Arc<dyn Fn(&str) -> Option<Vec<Reply>> + Send + Sync>;

/// How the mock authenticates a startup.
#[derive(Clone, Debug)]
pub enum AuthMode {
    Trust,
    Cleartext(String),
    Md5(String),
    Kerberos,
}

/// One backend response to a statement.
#[derive(Clone, Debug)]
pub enum Reply {
    Complete(String),
    Error(String),
    Notice(String),
    Empty,
    Rows(Vec<Option<String>>),
    CopyIn,
    CopyOut(Vec<String>),
    /// Wait until released or cancelled, a cancel emits an error.
    Hold,
    /// Send the error then close the connection.
    Fatal(String),
    Raw(u8),
}

impl Reply {
    pub fn complete(tag: &str) -> Reply {
        Self::Complete(tag.into())
    }

    pub fn error(message: &str) -> Reply {
        Self::Error(message.into())
    }

    pub fn row(value: &str) -> Reply {
        Self::Rows(vec![Some(value.into())])
    }
}

struct Inner {
    version: String,
    reject: AtomicUsize,
    auth: AuthMode,
    handler: Option<Handler>,
    encoding: Mutex<String>,
    gate: Notify,
    cancelled: AtomicBool,
    connects: AtomicUsize,
    cancels: AtomicUsize,
    startups: Mutex<Vec<Generation>>,
    statements: Mutex<Vec<String>>,
    queries: Mutex<Vec<String>>,
    copied: Mutex<Vec<String>>,
}

/// Handle to a mock server, also the [`Connector`] reaching it.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

impl MockServer {
    pub const KEY: BackendKeyData = BackendKeyData { process_id: 4242, secret_key: 0x5eed };
    pub const SALT: [u8; 4] = [0, 1, 2, 3];

    /// Server reporting `PostgreSQL {version}`.
    pub fn new(version: &str) -> MockServer {
        Self {
            inner: Arc::new(Inner {
                version: version.into(),
                reject: AtomicUsize::new(0),
                auth: AuthMode::Trust,
                handler: None,
                encoding: Mutex::new("SQL_ASCII".into()),
                gate: Notify::new(),
                cancelled: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
                startups: Mutex::new(vec![]),
                statements: Mutex::new(vec![]),
                queries: Mutex::new(vec![]),
                copied: Mutex::new(vec![]),
            }),
        }
    }

    /// Config reaching this mock.
    pub fn config() -> Config {
        Config::new().host("mock").database("shop").user("alice")
    }

    fn configure(&mut self) -> &mut Inner {
        Arc::get_mut(&mut self.inner).expect("mock configured after connect")
    }

    /// Reject the next `count` startups as an unsupported protocol.
    pub fn reject(mut self, count: usize) -> Self {
        self.configure().reject = AtomicUsize::new(count);
        self
    }

    pub fn auth(mut self, auth: AuthMode) -> Self {
        self.configure().auth = auth;
        self
    }

    /// Answer statements, `None` falls back to the default answers.
    ///
    /// An empty query is passed as `""`.
    pub fn handler(mut self, f: impl Fn(&str) -> Option<Vec<Reply>> + Send + Sync + 'static) -> Self {
        self.configure().handler = Some(Arc::new(f));
        self
    }

    /// Let a held statement continue.
    pub fn release(&self) {
        self.inner.gate.notify_one();
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.inner.cancels.load(Ordering::SeqCst)
    }

    pub fn startups(&self) -> Vec<Generation> {
        self.inner.startups.lock_unpoisoned().clone()
    }

    /// Every non empty statement received, in order.
    pub fn statements(&self) -> Vec<String> {
        self.inner.statements.lock_unpoisoned().clone()
    }

    /// Every query message received, including empty ones.
    pub fn queries(&self) -> Vec<String> {
        self.inner.queries.lock_unpoisoned().clone()
    }

    /// Lines received in copy-in phases.
    pub fn copied(&self) -> Vec<String> {
        self.inner.copied.lock_unpoisoned().clone()
    }
}

impl Connector for MockServer {
    type Stream = DuplexStream;

    fn connect(&self, _: &str, _: u16) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        let inner = self.inner.clone();
        async move {
            inner.connects.fetch_add(1, Ordering::SeqCst);
            let (client, server) = duplex(64 * 1024);
            tokio::spawn(async move {
                // errors mean the client went away
                let _ = serve(&inner, &mut PgStream::new(server)).await;
            });
            Ok(client)
        }
    }
}

/// Fixed width string field of the startup packet.
fn field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn put_i16(io: &mut PgStream<DuplexStream>, value: i16) {
    match io.byte_order() {
        ByteOrder::Network => io.put_slice(&value.to_be_bytes()),
        ByteOrder::Reversed => io.put_slice(&value.to_le_bytes()),
    }
}

async fn serve(inner: &Inner, io: &mut PgStream<DuplexStream>) -> io::Result<()> {
    let len = io.get_i32().await? as usize;
    let body = io.get_bytes(len - 4).await?;
    let code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);

    if len == CancelRequest::SIZE as usize && code == CANCEL_REQUEST_CODE {
        inner.cancels.fetch_add(1, Ordering::SeqCst);
        inner.cancelled.store(true, Ordering::SeqCst);
        inner.gate.notify_one();
        return Ok(());
    }

    let (generation, user) = if len == 280 {
        (Generation::Legacy62, field(&body[68..84]))
    } else if code == 2 << 16 {
        (Generation::Modern, field(&body[68..100]))
    } else {
        (Generation::Legacy63, field(&body[68..100]))
    };
    inner.startups.lock_unpoisoned().push(generation);
    io.set_byte_order(generation.byte_order());

    let rejected = inner
        .reject
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if rejected {
        if generation == Generation::Legacy62 {
            // nothing to answer until the first query
            io.get_u8().await?;
            io.get_string().await?;
        }
        io.put_u8(b'E');
        io.put_nul_string("Unsupported frontend protocol.\n");
        return io.shutdown().await;
    }

    if generation.authenticates() && !authenticate(inner, io, &user).await? {
        return io.shutdown().await;
    }

    if generation.has_ready_for_query() {
        io.put_u8(b'K');
        io.put_i32(MockServer::KEY.process_id);
        io.put_i32(MockServer::KEY.secret_key);
        io.put_u8(b'Z');
    }
    io.flush().await?;

    loop {
        match io.get_u8().await? {
            b'Q' => {
                let sql = io.get_string().await?;
                if !query(inner, io, generation, &sql).await? {
                    return io.shutdown().await;
                }
            }
            _ => return Ok(()),
        }
    }
}

/// Returns `false` if the connection is closed.
async fn authenticate(inner: &Inner, io: &mut PgStream<DuplexStream>, user: &str) -> io::Result<bool> {
    let expected = match &inner.auth {
        AuthMode::Trust => None,
        AuthMode::Cleartext(password) => {
            io.put_u8(b'R');
            io.put_i32(3);
            Some(password.clone())
        }
        AuthMode::Md5(password) => {
            io.put_u8(b'R');
            io.put_i32(5);
            io.put_slice(&MockServer::SALT);
            Some(md5_response(user, password, &MockServer::SALT))
        }
        AuthMode::Kerberos => {
            io.put_u8(b'R');
            io.put_i32(2);
            io.flush().await?;
            return Ok(false);
        }
    };

    if let Some(expected) = expected {
        io.flush().await?;
        let _len = io.get_i32().await?;
        if io.get_string().await? != expected {
            io.put_u8(b'E');
            io.put_nul_string(&format!("FATAL:  password authentication failed for user \"{user}\"\n"));
            io.flush().await?;
            return Ok(false);
        }
    }

    io.put_u8(b'R');
    io.put_i32(0);
    Ok(true)
}

/// Answer each statement of a query message, returns `false` if the connection is closed.
async fn query(
    inner: &Inner,
    io: &mut PgStream<DuplexStream>,
    generation: Generation,
    sql: &str,
) -> io::Result<bool> {
    inner.queries.lock_unpoisoned().push(sql.to_owned());

    let mut statements: Vec<&str> = sql.split(';').map(str::trim).filter(|e| !e.is_empty()).collect();
    if statements.is_empty() {
        statements.push("");
    }

    'statements: for statement in statements {
        if !statement.is_empty() {
            inner.statements.lock_unpoisoned().push(statement.to_owned());
        }

        let replies = inner
            .handler
            .as_ref()
            .and_then(|handler| handler(statement))
            .unwrap_or_else(|| default_replies(inner, statement));

        for reply in replies {
            match reply {
                Reply::Complete(tag) => {
                    io.put_u8(b'C');
                    io.put_nul_string(&tag);
                }
                Reply::Error(message) => {
                    io.put_u8(b'E');
                    io.put_nul_string(&message);
                    break 'statements;
                }
                Reply::Notice(message) => {
                    io.put_u8(b'N');
                    io.put_nul_string(&message);
                }
                Reply::Empty => {
                    io.put_u8(b'I');
                    io.put_u8(0);
                }
                Reply::Rows(values) => rows(io, generation, &values),
                Reply::CopyIn => {
                    io.put_u8(b'G');
                    io.flush().await?;
                    loop {
                        let line = io.get_line().await?;
                        if line == CopyDone::LINE {
                            break;
                        }
                        inner.copied.lock_unpoisoned().push(line);
                    }
                }
                Reply::CopyOut(lines) => {
                    io.put_u8(b'H');
                    for line in lines {
                        io.put_slice(line.as_bytes());
                        io.put_u8(b'\n');
                    }
                    io.put_slice(CopyDone::LINE.as_bytes());
                    io.put_u8(b'\n');
                }
                Reply::Hold => {
                    io.flush().await?;
                    inner.gate.notified().await;
                    if inner.cancelled.swap(false, Ordering::SeqCst) {
                        io.put_u8(b'E');
                        io.put_nul_string("ERROR:  canceling query due to user request\n");
                        break 'statements;
                    }
                }
                Reply::Fatal(message) => {
                    io.put_u8(b'E');
                    io.put_nul_string(&message);
                    io.flush().await?;
                    return Ok(false);
                }
                Reply::Raw(byte) => io.put_u8(byte),
            }
        }
    }

    if generation.has_ready_for_query() {
        io.put_u8(b'Z');
    }
    io.flush().await?;
    Ok(true)
}

/// One text column per value, in a single row.
fn rows(io: &mut PgStream<DuplexStream>, generation: Generation, values: &[Option<String>]) {
    io.put_u8(b'T');
    put_i16(io, values.len() as i16);
    for i in 0..values.len() {
        io.put_nul_string(&format!("col{i}"));
        io.put_i32(25);
        put_i16(io, -1);
        if generation == Generation::Modern {
            io.put_i32(-1);
        }
    }

    io.put_u8(b'D');
    let mut bitmap = vec![0u8; values.len().div_ceil(8)];
    for (i, value) in values.iter().enumerate() {
        if value.is_some() {
            bitmap[i / 8] |= 0x80 >> (i % 8);
        }
    }
    io.put_slice(&bitmap);
    for value in values.iter().flatten() {
        io.put_i32(value.len() as i32 + 4);
        io.put_slice(value.as_bytes());
    }
}

fn default_replies(inner: &Inner, statement: &str) -> Vec<Reply> {
    let lower = statement.to_ascii_lowercase();
    let select = |value: String| vec![Reply::Rows(vec![Some(value)]), Reply::complete("SELECT")];

    if statement.is_empty() {
        vec![Reply::Empty]
    } else if lower == "select version()" {
        select(format!("PostgreSQL {} on x86_64-pc-linux-gnu", inner.version))
    } else if lower == "select pg_client_encoding()" {
        select(inner.encoding.lock_unpoisoned().clone())
    } else if lower == "select current_schema()" {
        select("public".into())
    } else if lower == "show client_encoding" {
        let encoding = inner.encoding.lock_unpoisoned().clone();
        vec![
            Reply::Notice(format!("NOTICE:  Current client encoding is {encoding}\n")),
            Reply::complete("SHOW VARIABLE"),
        ]
    } else if let Some(value) = lower.strip_prefix("set client_encoding to") {
        *inner.encoding.lock_unpoisoned() = value.trim().trim_matches('\'').to_ascii_uppercase();
        vec![Reply::complete("SET VARIABLE")]
    } else if lower.starts_with("select") {
        select("1".into())
    } else if lower.starts_with("fetch") {
        vec![Reply::row("1"), Reply::complete("FETCH")]
    } else if lower.starts_with("copy") && lower.ends_with("stdout") {
        vec![Reply::CopyOut(vec!["1\tbob".into(), "2\tcarol".into()]), Reply::complete("COPY")]
    } else if lower.starts_with("copy") {
        vec![Reply::CopyIn, Reply::complete("COPY")]
    } else {
        let word = lower.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
        let tag = match word.as_str() {
            "UPDATE" | "DELETE" => format!("{word} 1"),
            "INSERT" => "INSERT 0 1".into(),
            _ => word,
        };
        vec![Reply::Complete(tag)]
    }
}
