//! Connection management
//!
//! This module handles one transport socket (plain TCP or TLS) to a Redis
//! server, the authentication handshake run when it is dialed, and reading
//! whole replies from it.

use crate::tls::TlsConnector;
use bitriver_redis_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    protocol::{FrameReader, RespEncoder},
    types::ServerAddr,
    value::RespValue,
};
use bytes::{Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Byte stream a connection runs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A connection to a Redis server
pub struct RedisConnection {
    stream: Box<dyn AsyncStream>,
    read_buffer: BytesMut,
    frames: FrameReader,
    addr: ServerAddr,
    read_timeout: Duration,
    write_timeout: Duration,
    created_at: Instant,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("addr", &self.addr)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    /// Dial a Redis server and run the handshake configured in `config`
    ///
    /// The handshake sends `AUTH` when a password is configured and `SELECT`
    /// when the database is not 0.
    pub async fn connect(
        addr: &ServerAddr,
        config: &ConnectionConfig,
        tls: Option<&TlsConnector>,
    ) -> RedisResult<Self> {
        debug!("Connecting to Redis at {}", addr);

        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        .map_err(|_| RedisError::Dial(format!("Timed out connecting to {addr}")))?
        .map_err(|e| RedisError::Dial(format!("Failed to connect to {addr}: {e}")))?;

        stream.set_nodelay(true)?;
        if let Some(keepalive_duration) = config.tcp_keepalive {
            let keepalive = TcpKeepalive::new().with_time(keepalive_duration);
            SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }

        let stream: Box<dyn AsyncStream> = match tls {
            Some(connector) => {
                let tls_stream = timeout(config.connect_timeout, connector.connect(addr, stream))
                    .await
                    .map_err(|_| RedisError::Dial(format!("TLS handshake with {addr} timed out")))??;
                Box::new(tls_stream)
            }
            None => Box::new(stream),
        };

        let mut conn = Self::from_stream(stream, addr.clone(), config);

        if let Some(ref password) = config.password {
            conn.authenticate(config.username.as_deref(), password)
                .await?;
        }
        if config.database != 0 {
            conn.select_database(config.database).await?;
        }

        Ok(conn)
    }

    /// Wrap an already established stream without running a handshake
    pub fn from_stream(
        stream: Box<dyn AsyncStream>,
        addr: ServerAddr,
        config: &ConnectionConfig,
    ) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(8192),
            frames: FrameReader::new(),
            addr,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            created_at: Instant::now(),
        }
    }

    /// Authenticate with the Redis server
    async fn authenticate(&mut self, username: Option<&str>, password: &str) -> RedisResult<()> {
        debug!("Authenticating with Redis server at {}", self.addr);
        let mut args = Vec::with_capacity(2);
        if let Some(username) = username {
            args.push(Bytes::copy_from_slice(username.as_bytes()));
        }
        args.push(Bytes::copy_from_slice(password.as_bytes()));

        match self.execute_command("AUTH", &args).await {
            Ok(RespValue::SimpleString(ref s)) if s == "OK" => Ok(()),
            Ok(other) => Err(RedisError::Auth(format!(
                "Unexpected authentication response: {other:?}"
            ))),
            Err(RedisError::Server(msg)) => Err(RedisError::Auth(msg)),
            Err(e) => Err(e),
        }
    }

    /// Select a database
    pub async fn select_database(&mut self, db: u8) -> RedisResult<()> {
        let response = self
            .execute_command("SELECT", &[Bytes::from(db.to_string())])
            .await?;

        match response {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            _ => Err(RedisError::UnexpectedResponse(format!("{:?}", response))),
        }
    }

    /// Execute a command and return the response
    ///
    /// An error reply is returned as [`RedisError::Server`]; the connection
    /// stays usable in that case.
    pub async fn execute_command(&mut self, command: &str, args: &[Bytes]) -> RedisResult<RespValue> {
        self.execute_command_blocking(command, args, Duration::ZERO)
            .await
    }

    /// Execute a command whose reply may legitimately take `block` to arrive
    ///
    /// The read timeout is extended by `block` so a long poll does not trip it.
    pub async fn execute_command_blocking(
        &mut self,
        command: &str,
        args: &[Bytes],
        block: Duration,
    ) -> RedisResult<RespValue> {
        let encoded = RespEncoder::encode_command(command, args);
        trace!("Sending {} ({} bytes) to {}", command, encoded.len(), self.addr);

        let stream = &mut self.stream;
        timeout(self.write_timeout, async move {
            stream.write_all(&encoded).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| RedisError::Timeout)??;

        let response = timeout(self.read_timeout + block, self.read_response())
            .await
            .map_err(|_| RedisError::Timeout)??;

        match response {
            RespValue::Error(msg) => Err(RedisError::Server(msg)),
            other => Ok(other),
        }
    }

    /// Send `PING` and expect `PONG`
    pub async fn ping(&mut self) -> RedisResult<()> {
        match self.execute_command("PING", &[]).await? {
            RespValue::SimpleString(ref s) if s == "PONG" => Ok(()),
            other => Err(RedisError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Read a complete RESP response from the connection
    async fn read_response(&mut self) -> RedisResult<RespValue> {
        loop {
            if let Some(value) = self.frames.next_value(&mut self.read_buffer)? {
                return Ok(value);
            }

            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                if self.read_buffer.is_empty() {
                    return Err(RedisError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Connection closed by server",
                    )));
                }
                return Err(RedisError::Protocol(
                    "Connection closed in the middle of a reply".to_string(),
                ));
            }
        }
    }

    /// Address this connection was dialed to
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// When the connection was established
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}
