//! In-memory RESP server for tests
//!
//! Speaks the subset of commands the `bitriver-redis` client sends: `PING`,
//! `AUTH`, `SELECT`, the stream consumer-group commands, `INCR`/`EXPIRE`/`TTL`
//! and `SENTINEL get-master-addr-by-name`. It listens on a real loopback
//! socket, optionally behind a self-signed TLS certificate, so clients reach
//! it through their normal dial path.
//!
//! ```no_run
//! use bitriver_redis_stub::{Options, Server};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let server = Server::start(Options::default().with_password("secret")).await?;
//! println!("listening on {}", server.url());
//! server.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod keyspace;

use bitriver_redis_core::{
    protocol::{FrameReader, RespEncoder},
    types::ServerAddr,
    value::RespValue,
};
use bytes::{Bytes, BytesMut};
use keyspace::{Keyspace, ReadRequest, StreamId};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

/// Startup options
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Require `AUTH` with this password before any other command
    pub password: Option<String>,
    /// Username accepted by `AUTH`; `default` when unset
    pub username: Option<String>,
    /// Serve TLS with a freshly generated self-signed certificate
    pub tls: bool,
    /// Primaries reported by `SENTINEL get-master-addr-by-name`
    pub masters: HashMap<String, ServerAddr>,
}

impl Options {
    /// Require a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Require a username and password
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Serve TLS
    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Answer discovery queries for `name` with `addr`
    pub fn with_master(mut self, name: impl Into<String>, addr: ServerAddr) -> Self {
        self.masters.insert(name.into(), addr);
        self
    }
}

/// Misbehaviour applied to the next data command
///
/// Handshake commands (`AUTH`, `SELECT`) are never affected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Close the connection without replying
    CloseConnection,
    /// Reply with bytes that are not valid RESP
    MalformedReply,
    /// Wait before handling the command
    Delay(Duration),
}

struct Shared {
    username: Option<String>,
    password: Option<String>,
    keyspace: Mutex<Keyspace>,
    /// Woken whenever an entry is appended to any stream
    appended: Notify,
    masters: Mutex<HashMap<String, ServerAddr>>,
    faults: Mutex<VecDeque<Fault>>,
    commands: Mutex<HashMap<String, usize>>,
    accepted: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(options: Options) -> Self {
        Self {
            username: options.username,
            password: options.password,
            keyspace: Mutex::new(Keyspace::default()),
            appended: Notify::new(),
            masters: Mutex::new(options.masters),
            faults: Mutex::new(VecDeque::new()),
            commands: Mutex::new(HashMap::new()),
            accepted: AtomicUsize::new(0),
        }
    }

    fn record(&self, name: &str) {
        *lock(&self.commands).entry(name.to_string()).or_insert(0) += 1;
    }
}

/// Running stub server
///
/// Dropping the handle stops accepting and closes every open connection.
pub struct Server {
    addr: SocketAddr,
    tls: bool,
    cert_pem: Option<String>,
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind to an ephemeral loopback port and start serving
    pub async fn start(options: Options) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let tls = options.tls;
        let (acceptor, cert_pem) = if tls {
            let (acceptor, pem) = self_signed_acceptor()?;
            (Some(acceptor), Some(pem))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared::new(options));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::clone(&shared),
            shutdown_rx,
        ));
        debug!("Stub server listening on {} (tls: {})", addr, tls);

        Ok(Self {
            addr,
            tls,
            cert_pem,
            shared,
            shutdown,
            accept_task,
        })
    }

    /// Bound socket address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound address as a client-side [`ServerAddr`]
    pub fn server_addr(&self) -> ServerAddr {
        ServerAddr::new(self.addr.ip().to_string(), self.addr.port())
    }

    /// Connection string, `rediss://` when serving TLS
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        format!("{}://{}", scheme, self.addr)
    }

    /// PEM of the self-signed certificate, when serving TLS
    ///
    /// The certificate covers `localhost` and `127.0.0.1`.
    pub fn cert_pem(&self) -> Option<&str> {
        self.cert_pem.as_deref()
    }

    /// Point discovery for `name` at `addr`
    pub fn set_master(&self, name: impl Into<String>, addr: ServerAddr) {
        lock(&self.shared.masters).insert(name.into(), addr);
    }

    /// Stop answering discovery queries for `name`
    pub fn remove_master(&self, name: &str) {
        lock(&self.shared.masters).remove(name);
    }

    /// Queue a fault for an upcoming data command
    ///
    /// Faults apply in order, one per command, across all connections.
    pub fn inject(&self, fault: Fault) {
        lock(&self.shared.faults).push_back(fault);
    }

    /// Connections accepted so far
    pub fn connections_accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// How many times a command was received, by upper-case name
    pub fn command_count(&self, name: &str) -> usize {
        lock(&self.shared.commands)
            .get(&name.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    /// Stop the server and wait for the listener to close
    pub async fn close(mut self) {
        self.shutdown.send_replace(true);
        if let Err(e) = (&mut self.accept_task).await {
            warn!("Stub accept loop ended abnormally: {}", e);
        }
        debug!("Stub server on {} closed", self.addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.accept_task.abort();
    }
}

fn self_signed_acceptor() -> io::Result<(TlsAcceptor, String)> {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .map_err(io::Error::other)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(io::Error::other)?
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .map_err(io::Error::other)?;

    Ok((TlsAcceptor::from(Arc::new(config)), certified.cert.pem()))
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (socket, peer) = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Stub accept failed: {}", e);
                    continue;
                }
            },
        };
        shared.accepted.fetch_add(1, Ordering::SeqCst);
        trace!("Stub accepted {}", peer);

        let shared = Arc::clone(&shared);
        let acceptor = acceptor.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                result = serve(socket, acceptor, shared) => {
                    if let Err(e) = result {
                        debug!("Stub connection from {} ended: {}", peer, e);
                    }
                }
            }
        });
    }
}

async fn serve(
    socket: TcpStream,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<Shared>,
) -> io::Result<()> {
    socket.set_nodelay(true)?;
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor.accept(socket).await?;
            Session::new(stream, shared).run().await
        }
        None => Session::new(socket, shared).run().await,
    }
}

/// Outcome of one command
enum Step {
    Continue,
    Close,
}

struct Session<S> {
    stream: S,
    buf: BytesMut,
    frames: FrameReader,
    out: BytesMut,
    shared: Arc<Shared>,
    authenticated: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, shared: Arc<Shared>) -> Self {
        let authenticated = shared.password.is_none();
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
            frames: FrameReader::new(),
            out: BytesMut::with_capacity(4096),
            shared,
            authenticated,
        }
    }

    async fn run(mut self) -> io::Result<()> {
        while let Some(frame) = self.read_frame().await? {
            let args = match request_args(frame) {
                Ok(args) => args,
                Err(message) => {
                    self.reply(RespValue::Error(message)).await?;
                    return Ok(());
                }
            };
            if let Step::Close = self.dispatch(args).await? {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn read_frame(&mut self) -> io::Result<Option<RespValue>> {
        loop {
            if let Some(frame) = self
                .frames
                .next_value(&mut self.buf)
                .map_err(io::Error::other)?
            {
                return Ok(Some(frame));
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn reply(&mut self, value: RespValue) -> io::Result<()> {
        self.out.clear();
        RespEncoder::encode(&value, &mut self.out).map_err(io::Error::other)?;
        self.stream.write_all(&self.out).await?;
        self.stream.flush().await
    }

    async fn dispatch(&mut self, args: Vec<Bytes>) -> io::Result<Step> {
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let args = &args[1..];
        self.shared.record(&name);
        trace!("Stub received {} with {} args", name, args.len());

        let handshake = matches!(name.as_str(), "AUTH" | "SELECT");
        if !handshake {
            let fault = lock(&self.shared.faults).pop_front();
            match fault {
                Some(Fault::CloseConnection) => {
                    debug!("Stub closing connection on {}", name);
                    return Ok(Step::Close);
                }
                Some(Fault::MalformedReply) => {
                    self.stream.write_all(b"?malformed\r\n").await?;
                    self.stream.flush().await?;
                    return Ok(Step::Continue);
                }
                Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
                None => {}
            }
        }

        if name != "AUTH" && !self.authenticated {
            self.reply(RespValue::Error("NOAUTH Authentication required.".to_string()))
                .await?;
            return Ok(Step::Continue);
        }

        let reply = match name.as_str() {
            "PING" => Ok(match args.first() {
                Some(message) => RespValue::BulkString(message.clone()),
                None => RespValue::SimpleString("PONG".to_string()),
            }),
            "AUTH" => self.auth(args),
            "SELECT" => select(args),
            "XADD" => self.xadd(args),
            "XGROUP" => self.xgroup(args),
            "XREADGROUP" => return self.xreadgroup(args).await,
            "XACK" => self.xack(args),
            "INCR" => self.incr(args),
            "INCRBY" => self.incr_by(args),
            "EXPIRE" => self.expire(args),
            "TTL" => self.ttl(args),
            "SENTINEL" => self.sentinel(args),
            _ => Err(format!("ERR unknown command '{}'", name)),
        };

        self.reply(reply.unwrap_or_else(RespValue::Error)).await?;
        Ok(Step::Continue)
    }

    fn auth(&mut self, args: &[Bytes]) -> Result<RespValue, String> {
        let (username, password) = match args {
            [password] => (None, text(password)),
            [username, password] => (Some(text(username)), text(password)),
            _ => return Err(wrong_arity("auth")),
        };
        let Some(expected) = self.shared.password.as_deref() else {
            return Err(
                "ERR AUTH <password> called without any password configured for the default user"
                    .to_string(),
            );
        };
        let expected_user = self.shared.username.as_deref().unwrap_or("default");
        if password != expected || username.as_deref().is_some_and(|u| u != expected_user) {
            return Err(
                "WRONGPASS invalid username-password pair or user is disabled.".to_string(),
            );
        }
        self.authenticated = true;
        Ok(ok())
    }

    fn xadd(&self, args: &[Bytes]) -> Result<RespValue, String> {
        let [key, id, pairs @ ..] = args else {
            return Err(wrong_arity("xadd"));
        };
        if pairs.is_empty() || pairs.len() % 2 != 0 {
            return Err(wrong_arity("xadd"));
        }
        let fields = pairs
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        let id = lock(&self.shared.keyspace).xadd(&text(key), &text(id), fields)?;
        self.shared.appended.notify_waiters();
        Ok(RespValue::BulkString(Bytes::from(id.to_string())))
    }

    fn xgroup(&self, args: &[Bytes]) -> Result<RespValue, String> {
        let Some(subcommand) = args.first() else {
            return Err(wrong_arity("xgroup"));
        };
        if !text(subcommand).eq_ignore_ascii_case("CREATE") {
            return Err(format!(
                "ERR unknown subcommand '{}'. Try XGROUP HELP.",
                text(subcommand)
            ));
        }
        let (key, group, start, mkstream) = match &args[1..] {
            [key, group, start] => (key, group, start, false),
            [key, group, start, flag] if text(flag).eq_ignore_ascii_case("MKSTREAM") => {
                (key, group, start, true)
            }
            _ => return Err("ERR syntax error".to_string()),
        };
        lock(&self.shared.keyspace).group_create(
            &text(key),
            &text(group),
            &text(start),
            mkstream,
        )?;
        Ok(ok())
    }

    /// Serve `XREADGROUP`, waiting for appends while `BLOCK` allows
    ///
    /// While waiting the socket is still read, so a client that hangs up
    /// stops the wait instead of having entries delivered to nobody.
    async fn xreadgroup(&mut self, args: &[Bytes]) -> io::Result<Step> {
        let (request, block) = match parse_read(args) {
            Ok(parsed) => parsed,
            Err(message) => {
                self.reply(RespValue::Error(message)).await?;
                return Ok(Step::Continue);
            }
        };
        let deadline = block
            .filter(|ms| *ms > 0)
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let shared = Arc::clone(&self.shared);

        loop {
            let appended = shared.appended.notified();
            tokio::pin!(appended);

            let outcome = lock(&shared.keyspace).read_group(&request);
            let reply = match outcome {
                Ok(Some(reply)) => reply,
                Ok(None) if block.is_none() => RespValue::NullArray,
                Ok(None) => {
                    let expired = tokio::select! {
                        _ = &mut appended => false,
                        _ = sleep_until(deadline) => true,
                        read = self.stream.read_buf(&mut self.buf) => {
                            if read? == 0 {
                                return Ok(Step::Close);
                            }
                            false
                        }
                    };
                    if !expired {
                        continue;
                    }
                    RespValue::NullArray
                }
                Err(message) => RespValue::Error(message),
            };

            self.reply(reply).await?;
            return Ok(Step::Continue);
        }
    }

    fn xack(&self, args: &[Bytes]) -> Result<RespValue, String> {
        let [key, group, ids @ ..] = args else {
            return Err(wrong_arity("xack"));
        };
        if ids.is_empty() {
            return Err(wrong_arity("xack"));
        }
        let ids = ids
            .iter()
            .map(|id| StreamId::parse(&text(id)))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| "ERR Invalid stream ID specified as stream command argument".to_string())?;
        let removed = lock(&self.shared.keyspace).ack(&text(key), &text(group), &ids)?;
        Ok(RespValue::Integer(removed))
    }

    fn incr(&self, args: &[Bytes]) -> Result<RespValue, String> {
        let [key] = args else {
            return Err(wrong_arity("incr"));
        };
        lock(&self.shared.keyspace)
            .incr_by(&text(key), 1)
            .map(RespValue::Integer)
    }

    fn incr_by(&self, args: &[Bytes]) -> Result<RespValue, String> {
        let [key, delta] = args else {
            return Err(wrong_arity("incrby"));
        };
        let delta = integer(delta)?;
        lock(&self.shared.keyspace)
            .incr_by(&text(key), delta)
            .map(RespValue::Integer)
    }

    fn expire(&self, args: &[Bytes]) -> Result<RespValue, String> {
        let [key, seconds] = args else {
            return Err(wrong_arity("expire"));
        };
        let seconds = integer(seconds)?;
        Ok(RespValue::Integer(
            lock(&self.shared.keyspace).expire(&text(key), seconds),
        ))
    }

    fn ttl(&self, args: &[Bytes]) -> Result<RespValue, String> {
        let [key] = args else {
            return Err(wrong_arity("ttl"));
        };
        Ok(RespValue::Integer(lock(&self.shared.keyspace).ttl(&text(key))))
    }

    fn sentinel(&self, args: &[Bytes]) -> Result<RespValue, String> {
        match args {
            [subcommand, name] if text(subcommand).eq_ignore_ascii_case("get-master-addr-by-name") => {
                Ok(match lock(&self.shared.masters).get(&text(name)) {
                    Some(addr) => RespValue::Array(vec![
                        RespValue::BulkString(Bytes::from(addr.host.clone())),
                        RespValue::BulkString(Bytes::from(addr.port.to_string())),
                    ]),
                    None => RespValue::NullArray,
                })
            }
            _ => Err("ERR Unknown sentinel subcommand".to_string()),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn select(args: &[Bytes]) -> Result<RespValue, String> {
    let [index] = args else {
        return Err(wrong_arity("select"));
    };
    match integer(index)? {
        0..=15 => Ok(ok()),
        _ => Err("ERR DB index is out of range".to_string()),
    }
}

/// `XREADGROUP GROUP g c [COUNT n] [BLOCK ms] [NOACK] STREAMS k... id...`
fn parse_read(args: &[Bytes]) -> Result<(ReadRequest, Option<u64>), String> {
    let [keyword, group, consumer, rest @ ..] = args else {
        return Err(wrong_arity("xreadgroup"));
    };
    if !text(keyword).eq_ignore_ascii_case("GROUP") {
        return Err("ERR syntax error".to_string());
    }

    let mut count = None;
    let mut block = None;
    let mut no_ack = false;
    let mut rest = rest;
    loop {
        match rest {
            [option, value, tail @ ..] if text(option).eq_ignore_ascii_case("COUNT") => {
                let n = integer(value)?;
                count = Some(usize::try_from(n).unwrap_or(0)).filter(|n| *n > 0);
                rest = tail;
            }
            [option, value, tail @ ..] if text(option).eq_ignore_ascii_case("BLOCK") => {
                let ms = u64::try_from(integer(value)?)
                    .map_err(|_| "ERR timeout is negative".to_string())?;
                block = Some(ms);
                rest = tail;
            }
            [option, tail @ ..] if text(option).eq_ignore_ascii_case("NOACK") => {
                no_ack = true;
                rest = tail;
            }
            [option, tail @ ..] if text(option).eq_ignore_ascii_case("STREAMS") => {
                rest = tail;
                break;
            }
            _ => return Err("ERR syntax error".to_string()),
        }
    }

    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(
            "ERR Unbalanced 'xreadgroup' list of streams: for each stream key an ID or '>' must be specified."
                .to_string(),
        );
    }
    let (keys, ids) = rest.split_at(rest.len() / 2);
    let streams = keys.iter().zip(ids).map(|(k, id)| (text(k), text(id))).collect();

    Ok((
        ReadRequest {
            group: text(group),
            consumer: text(consumer),
            count,
            no_ack,
            streams,
        },
        block,
    ))
}

fn request_args(frame: RespValue) -> Result<Vec<Bytes>, String> {
    let RespValue::Array(items) = frame else {
        return Err("ERR Protocol error: expected an array of bulk strings".to_string());
    };
    let args = items
        .into_iter()
        .map(|item| match item {
            RespValue::BulkString(bytes) => Ok(bytes),
            _ => Err("ERR Protocol error: expected bulk string arguments".to_string()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    if args.is_empty() {
        return Err("ERR Protocol error: empty command".to_string());
    }
    Ok(args)
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn integer(bytes: &Bytes) -> Result<i64, String> {
    text(bytes)
        .parse()
        .map_err(|_| "ERR value is not an integer or out of range".to_string())
}

fn wrong_arity(command: &str) -> String {
    format!("ERR wrong number of arguments for '{}' command", command)
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}
