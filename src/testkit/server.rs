//! A RESP server on a real socket, backed by [`Store`].
//!
//! Speaks the subset of commands the engine sends, plus switches to play
//! a cluster node, require a password, drop `CONFIG` or `MEMORY`, redirect
//! chosen keys, and refuse chosen keys.

use crate::cluster::{key_slot, SLOT_COUNT};
use crate::connection::{ConnectionDescriptor, NodeAddr};
use crate::protocol::{RespParser, RespValue};
use crate::testkit::store::{Store, Value};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct Settings {
    password: Option<String>,
    cluster: bool,
    databases: u32,
    config_command: bool,
    memory_command: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            password: None,
            cluster: false,
            databases: 16,
            config_command: true,
            memory_command: true,
        }
    }
}

/// Configures a [`TestServer`].
#[derive(Debug, Default)]
pub struct TestServerBuilder {
    settings: Settings,
}

impl TestServerBuilder {
    /// Requires `AUTH password` before anything else.
    pub fn password(mut self, password: &str) -> Self {
        self.settings.password = Some(password.to_string());
        self
    }

    /// Answers `CLUSTER SLOTS` with every slot assigned to itself.
    pub fn cluster(mut self) -> Self {
        self.settings.cluster = true;
        self
    }

    pub fn databases(mut self, databases: u32) -> Self {
        self.settings.databases = databases;
        self
    }

    /// Rejects `CONFIG` as an unknown command.
    pub fn without_config(mut self) -> Self {
        self.settings.config_command = false;
        self
    }

    /// Rejects `MEMORY` as an unknown command.
    pub fn without_memory_usage(mut self) -> Self {
        self.settings.memory_command = false;
        self
    }

    pub async fn start(self) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let port = listener.local_addr().expect("test server address").port();
        let addr = NodeAddr::new("127.0.0.1", port);

        let shared = Arc::new(Shared {
            store: Store::new(self.settings.databases),
            settings: self.settings,
            addr: addr.clone(),
            redirects: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
        });

        let accept = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let shared = Arc::clone(&accept);
                tokio::spawn(async move {
                    let session = Session::new(stream, shared);
                    if let Err(e) = session.run().await {
                        trace!(error = %e, "Test session ended");
                    }
                });
            }
        });

        TestServer { shared, task }
    }
}

#[derive(Debug)]
struct Shared {
    store: Store,
    settings: Settings,
    addr: NodeAddr,
    /// key -> (MOVED | ASK, target)
    redirects: Mutex<HashMap<Bytes, (String, NodeAddr)>>,
    /// key -> error reply
    failures: Mutex<HashMap<Bytes, String>>,
    /// upper-cased command name -> times received
    counts: Mutex<HashMap<String, u64>>,
}

/// A running test server. Stops when dropped.
#[derive(Debug)]
pub struct TestServer {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    pub async fn start() -> TestServer {
        Self::builder().start().await
    }

    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::default()
    }

    pub fn addr(&self) -> NodeAddr {
        self.shared.addr.clone()
    }

    /// A standalone descriptor for this server, with short timeouts.
    pub fn descriptor(&self) -> ConnectionDescriptor {
        let mut descriptor = ConnectionDescriptor::new(self.shared.addr.host.clone(), self.shared.addr.port)
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(5));
        descriptor.max_databases = self.shared.settings.databases;
        descriptor
    }

    /// A cluster descriptor seeded with this server.
    pub fn cluster_descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::cluster(self.shared.addr.host.clone(), self.shared.addr.port)
            .with_timeouts(Duration::from_secs(2), Duration::from_secs(5))
    }

    pub fn store(&self) -> &Store {
        &self.shared.store
    }

    /// Answers every command on `key` with a `MOVED` or `ASK` redirect
    /// to `target`, unless the connection sent `ASKING` first.
    pub fn redirect_key(&self, key: &str, kind: &str, target: &NodeAddr) {
        self.shared.redirects.lock().insert(
            Bytes::copy_from_slice(key.as_bytes()),
            (kind.to_string(), target.clone()),
        );
    }

    /// Answers every command on `key` with the error `message`.
    pub fn fail_key(&self, key: &str, message: &str) {
        self.shared
            .failures
            .lock()
            .insert(Bytes::copy_from_slice(key.as_bytes()), message.to_string());
    }

    /// How many times a command (by name, any case) was received.
    pub fn command_count(&self, name: &str) -> u64 {
        self.shared
            .counts
            .lock()
            .get(&name.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }
}

/// One client connection.
struct Session {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
    parser: RespParser,
    shared: Arc<Shared>,
    db: u32,
    authenticated: bool,
    asking: bool,
}

impl Session {
    fn new(stream: TcpStream, shared: Arc<Shared>) -> Self {
        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(4096),
            parser: RespParser::new(),
            authenticated: shared.settings.password.is_none(),
            shared,
            db: 0,
            asking: false,
        }
    }

    async fn run(mut self) -> std::io::Result<()> {
        loop {
            while let Some(request) = self
                .parser
                .decode(&mut self.buffer)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            {
                let reply = self.execute(request);
                self.stream.write_all(&reply.serialize()).await?;
            }
            self.stream.flush().await?;

            if self.stream.get_mut().read_buf(&mut self.buffer).await? == 0 {
                debug!("Test client disconnected");
                return Ok(());
            }
        }
    }

    fn execute(&mut self, request: RespValue) -> RespValue {
        let Some(parts) = request.into_array() else {
            return RespValue::error("ERR invalid command format");
        };
        let args: Vec<Bytes> = parts
            .into_iter()
            .filter_map(|part| match part {
                RespValue::BulkString(b) => Some(b),
                RespValue::SimpleString(s) => Some(Bytes::from(s)),
                _ => None,
            })
            .collect();
        let Some(first) = args.first() else {
            return RespValue::error("ERR empty command");
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        *self.shared.counts.lock().entry(name.clone()).or_insert(0) += 1;

        if !self.authenticated && name != "AUTH" {
            return RespValue::error("NOAUTH Authentication required.");
        }

        if let Some(key) = command_key(&name, &args) {
            if let Some(message) = self.shared.failures.lock().get(key) {
                return RespValue::error(message.clone());
            }
            let asking = std::mem::take(&mut self.asking);
            if !asking {
                if let Some((kind, target)) = self.shared.redirects.lock().get(key) {
                    return RespValue::error(format!("{} {} {}", kind, key_slot(key), target));
                }
            }
        }

        self.dispatch(&name, &args[1..])
    }

    fn dispatch(&mut self, name: &str, args: &[Bytes]) -> RespValue {
        let shared = Arc::clone(&self.shared);
        let store = &shared.store;
        let db = self.db;
        match (name, args) {
            ("PING", []) => RespValue::simple_string("PONG"),
            ("PING", [message]) => RespValue::bulk_string(message.clone()),
            ("AUTH", [password]) | ("AUTH", [_, password]) => self.auth(password),
            ("SELECT", [index]) => self.select(index),
            ("ASKING", []) if self.shared.settings.cluster => {
                self.asking = true;
                RespValue::ok()
            }
            ("CLUSTER", [sub]) if sub.eq_ignore_ascii_case(b"SLOTS") => self.cluster_slots(),
            ("CONFIG", [get, param])
                if self.shared.settings.config_command && get.eq_ignore_ascii_case(b"GET") =>
            {
                if param.eq_ignore_ascii_case(b"databases") {
                    RespValue::array(vec![
                        RespValue::bulk_string(Bytes::from_static(b"databases")),
                        RespValue::bulk_string(Bytes::from(store.database_count().to_string())),
                    ])
                } else {
                    RespValue::array(vec![])
                }
            }
            ("MEMORY", [sub, key])
                if self.shared.settings.memory_command && sub.eq_ignore_ascii_case(b"USAGE") =>
            {
                match store.value(db, key) {
                    Some(value) => RespValue::integer(value.approx_size() as i64 + 48),
                    None => RespValue::null(),
                }
            }
            ("SCAN", [cursor, options @ ..]) => scan(store, db, cursor, options),
            ("TYPE", [key]) => RespValue::simple_string(
                store.value(db, key).map_or("none", |v| v.type_name()),
            ),
            ("GET", [key]) => match store.value(db, key) {
                Some(Value::String(s)) => RespValue::bulk_string(s),
                Some(_) => wrong_type(),
                None => RespValue::null(),
            },
            ("GETRANGE", [key, start, end]) => match (int(start), int(end)) {
                (Some(start), Some(end)) => match store.value(db, key) {
                    Some(Value::String(s)) => RespValue::bulk_string(range(&s, start, end)),
                    Some(_) => wrong_type(),
                    None => RespValue::bulk_string(Bytes::new()),
                },
                _ => not_an_integer(),
            },
            ("SET", [key, value]) => {
                store.set(db, key, value);
                RespValue::ok()
            }
            ("RPUSH", [key, items @ ..]) if !items.is_empty() => {
                match store.push_bytes(db, key, items.to_vec()) {
                    Some(len) => RespValue::integer(len as i64),
                    None => wrong_type(),
                }
            }
            ("DEL", keys) | ("UNLINK", keys) if !keys.is_empty() => {
                let removed = keys.iter().filter(|k| store.delete(db, k)).count();
                RespValue::integer(removed as i64)
            }
            ("EXPIRE", [key, secs]) => match int(secs) {
                Some(secs) => expire(store, db, key, secs.saturating_mul(1000)),
                None => not_an_integer(),
            },
            ("PEXPIRE", [key, ms]) => match int(ms) {
                Some(ms) => expire(store, db, key, ms),
                None => not_an_integer(),
            },
            ("PTTL", [key]) => RespValue::integer(store.pttl(db, key)),
            ("TTL", [key]) => match store.pttl(db, key) {
                ms if ms < 0 => RespValue::integer(ms),
                ms => RespValue::integer((ms + 500) / 1000),
            },
            ("DUMP", [key]) => match store.dump(db, key) {
                Some(payload) => RespValue::bulk_string(payload),
                None => RespValue::null(),
            },
            ("RESTORE", [key, ttl, payload, options @ ..]) => {
                restore(store, db, key, ttl, payload, options)
            }
            _ => RespValue::error(format!(
                "ERR unknown command '{}', with args beginning with: ",
                name
            )),
        }
    }

    fn auth(&mut self, password: &Bytes) -> RespValue {
        match &self.shared.settings.password {
            None => RespValue::error(
                "ERR AUTH <password> called without any password configured for the default user",
            ),
            Some(expected) if expected.as_bytes() == &password[..] => {
                self.authenticated = true;
                RespValue::ok()
            }
            Some(_) => {
                RespValue::error("WRONGPASS invalid username-password pair or user is disabled.")
            }
        }
    }

    fn select(&mut self, index: &Bytes) -> RespValue {
        let Some(db) = int(index).and_then(|n| u32::try_from(n).ok()) else {
            return RespValue::error("ERR value is not an integer or out of range");
        };
        if self.shared.settings.cluster && db != 0 {
            return RespValue::error("ERR SELECT is not allowed in cluster mode");
        }
        if db >= self.shared.store.database_count() {
            return RespValue::error("ERR DB index is out of range");
        }
        self.db = db;
        RespValue::ok()
    }

    fn cluster_slots(&self) -> RespValue {
        if !self.shared.settings.cluster {
            return RespValue::error("ERR This instance has cluster support disabled");
        }
        let addr = &self.shared.addr;
        RespValue::array(vec![RespValue::array(vec![
            RespValue::integer(0),
            RespValue::integer(i64::from(SLOT_COUNT) - 1),
            RespValue::array(vec![
                RespValue::bulk_string(Bytes::from(addr.host.clone())),
                RespValue::integer(i64::from(addr.port)),
                RespValue::bulk_string(Bytes::from(format!("node-{}", addr.port))),
            ]),
        ])])
    }
}

/// The key a command operates on, for redirects and injected failures.
fn command_key<'a>(name: &str, args: &'a [Bytes]) -> Option<&'a Bytes> {
    match name {
        "GET" | "SET" | "GETRANGE" | "RPUSH" | "TYPE" | "DEL" | "UNLINK" | "EXPIRE"
        | "PEXPIRE" | "PTTL" | "TTL" | "DUMP" | "RESTORE" => args.get(1),
        "MEMORY" => args.get(2),
        _ => None,
    }
}

fn int(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn wrong_type() -> RespValue {
    RespValue::error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn not_an_integer() -> RespValue {
    RespValue::error("ERR value is not an integer or out of range")
}

/// `GETRANGE` indexing: inclusive, negative counts from the end.
fn range(s: &Bytes, start: i64, end: i64) -> Bytes {
    let len = s.len() as i64;
    let clamp = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    let (start, end) = (clamp(start), clamp(end).min(len - 1));
    if len == 0 || start > end {
        return Bytes::new();
    }
    s.slice(start as usize..=end as usize)
}

fn expire(store: &Store, db: u32, key: &[u8], ms: i64) -> RespValue {
    if !store.exists(db, key) {
        return RespValue::integer(0);
    }
    match u64::try_from(ms) {
        Ok(ms) if ms > 0 => {
            store.expire_in(db, key, ms);
        }
        _ => {
            store.delete(db, key);
        }
    }
    RespValue::integer(1)
}

fn scan(store: &Store, db: u32, cursor: &[u8], options: &[Bytes]) -> RespValue {
    let Some(cursor) = std::str::from_utf8(cursor).ok().and_then(|c| c.parse::<u64>().ok()) else {
        return RespValue::error("ERR invalid cursor");
    };
    let mut pattern: &[u8] = b"*";
    let mut count = 10;
    for option in options.chunks(2) {
        match option {
            [flag, value] if flag.eq_ignore_ascii_case(b"MATCH") => pattern = &value[..],
            [flag, value] if flag.eq_ignore_ascii_case(b"COUNT") => {
                match int(value).and_then(|n| usize::try_from(n).ok()).filter(|n| *n > 0) {
                    Some(n) => count = n,
                    None => return not_an_integer(),
                }
            }
            _ => return RespValue::error("ERR syntax error"),
        }
    }

    let step = store.scan(db, cursor, pattern, count);
    RespValue::array(vec![
        RespValue::bulk_string(Bytes::from(step.cursor.to_string())),
        RespValue::array(step.keys.into_iter().map(RespValue::bulk_string).collect()),
    ])
}

fn restore(
    store: &Store,
    db: u32,
    key: &[u8],
    ttl: &[u8],
    payload: &[u8],
    options: &[Bytes],
) -> RespValue {
    let mut replace = false;
    let mut absolute = false;
    let mut i = 0;
    while i < options.len() {
        let option = &options[i];
        if option.eq_ignore_ascii_case(b"REPLACE") {
            replace = true;
        } else if option.eq_ignore_ascii_case(b"ABSTTL") {
            absolute = true;
        } else if option.eq_ignore_ascii_case(b"IDLETIME") || option.eq_ignore_ascii_case(b"FREQ") {
            i += 1;
        } else {
            return RespValue::error("ERR syntax error");
        }
        i += 1;
    }

    let Some(ttl) = int(ttl).filter(|t| *t >= 0) else {
        return RespValue::error("ERR Invalid TTL value, must be >= 0");
    };
    if !replace && store.exists(db, key) {
        return RespValue::error("BUSYKEY Target key name already exists.");
    }
    let value = match Value::restore(payload) {
        Ok(value) => value,
        Err(message) => return RespValue::error(message),
    };

    let ttl = match (ttl, absolute) {
        (0, _) => None,
        (at, true) => {
            let now = crate::now_ms() as i64;
            if at <= now {
                store.delete(db, key);
                return RespValue::ok();
            }
            Some(Duration::from_millis((at - now) as u64))
        }
        (ms, false) => Some(Duration::from_millis(ms as u64)),
    };
    store.put(db, key, value, ttl);
    RespValue::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::protocol::Command;

    #[tokio::test]
    async fn test_scan_and_type() {
        let server = TestServer::start().await;
        server.store().set(0, "a:1", "x");
        server.store().rpush(0, "a:2", &["x"]);
        server.store().set(0, "b:1", "x");
        let mut conn = Connection::connect(&server.descriptor()).await.unwrap();

        let reply = conn
            .execute(&Command::new("SCAN").arg("0").arg("MATCH").arg("a:*").arg("COUNT").arg("100"))
            .await
            .unwrap();
        let parts = reply.as_array().unwrap();
        assert_eq!(parts[0].as_str(), Some("0"));
        assert_eq!(parts[1].as_array().unwrap().len(), 2);

        let reply = conn.execute(&Command::new("TYPE").arg("a:2")).await.unwrap();
        assert_eq!(reply.as_str(), Some("list"));
        assert_eq!(server.command_count("scan"), 1);
    }

    #[tokio::test]
    async fn test_restore_abs_ttl_in_the_past() {
        let server = TestServer::start().await;
        server.store().set(0, "k", "v");
        let payload = server.store().dump(0, "k").unwrap();
        let mut conn = Connection::connect(&server.descriptor()).await.unwrap();

        let reply = conn
            .execute(
                &Command::new("RESTORE")
                    .arg("old")
                    .arg_int(1_000)
                    .arg(payload)
                    .arg("ABSTTL"),
            )
            .await
            .unwrap();
        assert!(reply.is_ok());
        assert!(!server.store().exists(0, "old"));
    }

    #[test]
    fn test_getrange_indexes() {
        let s = Bytes::from("HYLL\x01");
        assert_eq!(range(&s, 0, 3), Bytes::from("HYLL"));
        assert_eq!(range(&s, -2, -1), Bytes::from("L\x01"));
        assert_eq!(range(&s, 3, 1), Bytes::new());
        assert_eq!(range(&Bytes::new(), 0, 3), Bytes::new());
    }
}
