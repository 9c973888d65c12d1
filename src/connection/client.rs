//! Single-server RESP client.
//!
//! One `Connection` owns one TCP stream and speaks strictly half-duplex:
//! a command is written, then exactly one reply is read before anything
//! else may be sent. `execute` takes `&mut self`, so two commands can never
//! be in flight on the same connection.
//!
//! ## Round Trip
//!
//! ```text
//!   execute(cmd)
//!        │
//!        ▼
//!   ┌──────────────────────┐
//!   │ encode into write buf │
//!   └──────────┬───────────┘
//!              ▼
//!   ┌──────────────────────┐      ┌──────────────────────┐
//!   │ write_all + flush     │─────>│ decode from read buf │◄──┐
//!   └──────────────────────┘      └──────────┬───────────┘   │
//!                                            │ incomplete    │
//!                                            ▼               │
//!                                  ┌──────────────────────┐  │
//!                                  │ read more from socket │──┘
//!                                  └──────────────────────┘
//! ```
//!
//! The whole round trip runs under the descriptor's execute timeout. A
//! timeout, an IO failure, or an undecodable reply leaves the stream in an
//! unknown position, so the connection is marked broken and refuses every
//! later command; the caller has to open a new one.

use crate::connection::descriptor::{ConnectionDescriptor, Credentials, NodeAddr};
use crate::protocol::{Command, ParseError, RespParser, RespValue};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Initial read/write buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Per-connection traffic counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Commands written to the socket
    pub commands_sent: AtomicU64,
    /// Error replies received
    pub error_replies: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command_sent(&self, bytes: usize) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn error_reply(&self) {
        self.error_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commands(&self) -> u64 {
        self.commands_sent.load(Ordering::Relaxed)
    }
}

/// Errors raised by the wire client. All of them abort the job that owns
/// the connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Could not open the TCP connection
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: NodeAddr,
        #[source]
        source: std::io::Error,
    },

    /// The connect handshake (AUTH, PING, SELECT) did not finish in time
    #[error("connecting to {addr} timed out after {after:?}")]
    ConnectTimeout { addr: NodeAddr, after: Duration },

    /// AUTH was rejected
    #[error("authentication failed on {addr}: {message}")]
    AuthFailed { addr: NodeAddr, message: String },

    /// The server answered the handshake `PING` with an error
    /// (`LOADING`, `MASTERDOWN`, ...)
    #[error("server {addr} cannot serve requests: {message}")]
    NotReady { addr: NodeAddr, message: String },

    /// SELECT was rejected (usually an out-of-range index)
    #[error("cannot select database {db} on {addr}: {message}")]
    SelectFailed {
        addr: NodeAddr,
        db: u32,
        message: String,
    },

    /// I/O error mid-conversation
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Undecodable reply
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The command did not complete within the execute timeout
    #[error("{command} timed out after {after:?} on {addr}")]
    Timeout {
        addr: NodeAddr,
        command: String,
        after: Duration,
    },

    /// Server closed the connection
    #[error("server {0} closed the connection")]
    Disconnected(NodeAddr),

    /// A previous failure left the stream unusable
    #[error("connection to {0} is broken and must be reopened")]
    Broken(NodeAddr),
}

/// A live connection to one server.
pub struct Connection {
    stream: BufWriter<TcpStream>,
    addr: NodeAddr,
    read_buf: BytesMut,
    write_buf: BytesMut,
    parser: RespParser,
    execute_timeout: Duration,
    db: u32,
    broken: bool,
    stats: Arc<ConnectionStats>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("db", &self.db)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Connection {
    /// Connects to the descriptor's primary address and selects its
    /// database.
    pub async fn connect(descriptor: &ConnectionDescriptor) -> Result<Self, ConnectionError> {
        Self::connect_to(&descriptor.address(), descriptor, descriptor.db).await
    }

    /// Connects to `addr` with the descriptor's credentials and timeouts,
    /// selecting `db` when it is non-zero.
    pub async fn connect_to(
        addr: &NodeAddr,
        descriptor: &ConnectionDescriptor,
        db: u32,
    ) -> Result<Self, ConnectionError> {
        let handshake = async {
            let stream = TcpStream::connect((addr.host.as_str(), addr.port))
                .await
                .map_err(|source| ConnectionError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            stream.set_nodelay(true)?;

            let mut conn = Connection {
                stream: BufWriter::new(stream),
                addr: addr.clone(),
                read_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
                write_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
                parser: RespParser::new(),
                execute_timeout: descriptor.execute_timeout,
                db: 0,
                broken: false,
                stats: Arc::new(ConnectionStats::new()),
            };

            if let Some(credentials) = &descriptor.credentials {
                conn.authenticate(credentials).await?;
            }
            conn.verify_session().await?;
            if db != 0 {
                conn.select(db).await?;
            }
            Ok::<_, ConnectionError>(conn)
        };

        let conn = tokio::time::timeout(descriptor.connect_timeout, handshake)
            .await
            .map_err(|_| ConnectionError::ConnectTimeout {
                addr: addr.clone(),
                after: descriptor.connect_timeout,
            })??;

        info!(server = %addr, db, "Connected");
        Ok(conn)
    }

    /// Sends one command and waits for its reply.
    ///
    /// Error replies (`-ERR ...`) are returned as `Ok(RespValue::Error)`;
    /// only transport-level failures are `Err`.
    pub async fn execute(&mut self, command: &Command) -> Result<RespValue, ConnectionError> {
        if self.broken {
            return Err(ConnectionError::Broken(self.addr.clone()));
        }

        match tokio::time::timeout(self.execute_timeout, self.round_trip(command)).await {
            Ok(Ok(reply)) => {
                if reply.is_error() {
                    self.stats.error_reply();
                }
                Ok(reply)
            }
            Ok(Err(e)) => {
                self.broken = true;
                warn!(server = %self.addr, error = %e, "Connection failed");
                Err(e)
            }
            Err(_) => {
                self.broken = true;
                warn!(server = %self.addr, command = ?command, "Command timed out");
                Err(ConnectionError::Timeout {
                    addr: self.addr.clone(),
                    command: String::from_utf8_lossy(command.name()).into_owned(),
                    after: self.execute_timeout,
                })
            }
        }
    }

    /// Issues `SELECT db`.
    pub async fn select(&mut self, db: u32) -> Result<(), ConnectionError> {
        let reply = self
            .execute(&Command::new("SELECT").arg_int(i64::from(db)))
            .await?;
        match reply {
            RespValue::Error(message) => Err(ConnectionError::SelectFailed {
                addr: self.addr.clone(),
                db,
                message,
            }),
            _ => {
                debug!(server = %self.addr, db, "Selected database");
                self.db = db;
                Ok(())
            }
        }
    }

    /// Issues `PING`, returning true on `PONG`.
    pub async fn ping(&mut self) -> Result<bool, ConnectionError> {
        let reply = self.execute(&Command::new("PING")).await?;
        Ok(matches!(reply, RespValue::SimpleString(ref s) if s == "PONG"))
    }

    /// Sends `PING` so a server that still wants `AUTH`, or cannot serve
    /// yet, fails the handshake instead of every later command.
    async fn verify_session(&mut self) -> Result<(), ConnectionError> {
        match self.execute(&Command::new("PING")).await? {
            RespValue::Error(message) => match message.split_whitespace().next() {
                Some("NOAUTH") | Some("WRONGPASS") => Err(ConnectionError::AuthFailed {
                    addr: self.addr.clone(),
                    message,
                }),
                _ => Err(ConnectionError::NotReady {
                    addr: self.addr.clone(),
                    message,
                }),
            },
            _ => Ok(()),
        }
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), ConnectionError> {
        let mut command = Command::new("AUTH");
        if let Some(user) = &credentials.username {
            command = command.arg(user.clone());
        }
        command = command.arg(credentials.password.clone());

        match self.execute(&command).await? {
            reply if reply.is_ok() => Ok(()),
            RespValue::Error(message) => Err(ConnectionError::AuthFailed {
                addr: self.addr.clone(),
                message,
            }),
            other => Err(ConnectionError::AuthFailed {
                addr: self.addr.clone(),
                message: format!("unexpected reply {}", other),
            }),
        }
    }

    async fn round_trip(&mut self, command: &Command) -> Result<RespValue, ConnectionError> {
        self.write_buf.clear();
        command.encode_into(&mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.stats.command_sent(self.write_buf.len());
        trace!(server = %self.addr, command = ?command, bytes = self.write_buf.len(), "Sent command");

        loop {
            if let Some(reply) = self.parser.decode(&mut self.read_buf)? {
                trace!(server = %self.addr, remaining = self.read_buf.len(), "Read reply");
                return Ok(reply);
            }

            if self.read_buf.capacity() - self.read_buf.len() < 1024 {
                self.read_buf.reserve(INITIAL_BUFFER_SIZE);
            }
            let n = self.stream.get_mut().read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Disconnected(self.addr.clone()));
            }
            self.stats.bytes_read(n);
        }
    }

    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// The currently selected database.
    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }
}
