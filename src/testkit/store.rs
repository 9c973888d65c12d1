//! Keyspace of the test server.
//!
//! Numbered databases of typed values with lazy expiry. Every key carries
//! an insertion sequence number; `SCAN` cursors are sequence positions, so
//! deleting keys mid-scan never hides the keys that remain.

use crate::rdb::crc64::crc64;
use crate::testkit::rdb::{encode_length, encode_string};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// RDB version written into `DUMP` payloads.
const DUMP_RDB_VERSION: u16 = 11;

/// Newest payload version `RESTORE` accepts.
const MAX_RESTORE_VERSION: u16 = 12;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_SET: u8 = 2;
const TYPE_HASH: u8 = 4;

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Set(BTreeSet<Bytes>),
    Hash(BTreeMap<Bytes, Bytes>),
    /// A restored value of a type the server keeps opaque
    Raw { type_byte: u8, body: Bytes },
}

impl Value {
    /// Name reported by `TYPE`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
            Value::Raw { type_byte, .. } => crate::rdb::RdbValueType::from_byte(*type_byte)
                .map(|t| t.key_type().as_str())
                .unwrap_or("none"),
        }
    }

    /// Rough size in bytes, for `MEMORY USAGE`.
    pub fn approx_size(&self) -> usize {
        match self {
            Value::String(s) => s.len(),
            Value::List(items) => items.iter().map(|i| i.len() + 8).sum(),
            Value::Set(members) => members.iter().map(|m| m.len() + 8).sum(),
            Value::Hash(fields) => fields.iter().map(|(f, v)| f.len() + v.len() + 16).sum(),
            Value::Raw { body, .. } => body.len(),
        }
    }

    /// Serializes in the `DUMP` format: type byte, value, RDB version,
    /// CRC64 of everything before it.
    pub fn dump(&self) -> Bytes {
        let mut buf = Vec::new();
        match self {
            Value::String(s) => {
                buf.push(TYPE_STRING);
                encode_string(&mut buf, s);
            }
            Value::List(items) => {
                buf.push(TYPE_LIST);
                encode_length(&mut buf, items.len() as u64);
                for item in items {
                    encode_string(&mut buf, item);
                }
            }
            Value::Set(members) => {
                buf.push(TYPE_SET);
                encode_length(&mut buf, members.len() as u64);
                for member in members {
                    encode_string(&mut buf, member);
                }
            }
            Value::Hash(fields) => {
                buf.push(TYPE_HASH);
                encode_length(&mut buf, fields.len() as u64);
                for (field, value) in fields {
                    encode_string(&mut buf, field);
                    encode_string(&mut buf, value);
                }
            }
            Value::Raw { type_byte, body } => {
                buf.push(*type_byte);
                buf.extend_from_slice(body);
            }
        }
        buf.extend_from_slice(&DUMP_RDB_VERSION.to_le_bytes());
        let crc = crc64(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Bytes::from(buf)
    }

    /// Parses a `DUMP` payload, checking its version and checksum.
    pub fn restore(payload: &[u8]) -> Result<Value, &'static str> {
        const BAD_PAYLOAD: &str = "ERR DUMP payload version or checksum are wrong";
        if payload.len() < 11 {
            return Err(BAD_PAYLOAD);
        }
        let (data, trailer) = payload.split_at(payload.len() - 8);
        let (body, version) = data.split_at(data.len() - 2);
        let version = u16::from_le_bytes([version[0], version[1]]);
        let crc = u64::from_le_bytes(trailer.try_into().map_err(|_| BAD_PAYLOAD)?);
        if version > MAX_RESTORE_VERSION || (crc != 0 && crc != crc64(data)) {
            return Err(BAD_PAYLOAD);
        }

        let type_byte = body[0];
        let mut reader = Reader {
            buf: &body[1..],
            pos: 0,
        };
        let value = match type_byte {
            TYPE_STRING => Value::String(reader.string()?),
            TYPE_LIST => {
                let n = reader.length()?;
                let mut items = VecDeque::new();
                for _ in 0..n {
                    items.push_back(reader.string()?);
                }
                Value::List(items)
            }
            TYPE_SET => {
                let n = reader.length()?;
                let mut members = BTreeSet::new();
                for _ in 0..n {
                    members.insert(reader.string()?);
                }
                Value::Set(members)
            }
            TYPE_HASH => {
                let n = reader.length()?;
                let mut fields = BTreeMap::new();
                for _ in 0..n {
                    let field = reader.string()?;
                    fields.insert(field, reader.string()?);
                }
                Value::Hash(fields)
            }
            other => {
                return Ok(Value::Raw {
                    type_byte: other,
                    body: Bytes::copy_from_slice(&body[1..]),
                })
            }
        };
        if reader.pos != reader.buf.len() {
            return Err("ERR Bad data format");
        }
        Ok(value)
    }
}

/// Cursor over an RDB-encoded value.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    const BAD_FORMAT: &'static str = "ERR Bad data format";

    fn byte(&mut self) -> Result<u8, &'static str> {
        let b = *self.buf.get(self.pos).ok_or(Self::BAD_FORMAT)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&[u8], &'static str> {
        let end = self.pos.checked_add(n).ok_or(Self::BAD_FORMAT)?;
        let slice = self.buf.get(self.pos..end).ok_or(Self::BAD_FORMAT)?;
        self.pos = end;
        Ok(slice)
    }

    fn length(&mut self) -> Result<u64, &'static str> {
        let first = self.byte()?;
        match first >> 6 {
            0 => Ok(u64::from(first & 0x3f)),
            1 => Ok((u64::from(first & 0x3f) << 8) | u64::from(self.byte()?)),
            2 if first == 0x80 => {
                let b = self.take(4)?;
                Ok(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            2 if first == 0x81 => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_be_bytes(raw))
            }
            _ => Err(Self::BAD_FORMAT),
        }
    }

    fn string(&mut self) -> Result<Bytes, &'static str> {
        let len = usize::try_from(self.length()?).map_err(|_| Self::BAD_FORMAT)?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    seq: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    fn pttl(&self) -> i64 {
        match self.expires_at {
            None => -1,
            Some(at) => at
                .saturating_duration_since(Instant::now())
                .as_millis()
                .try_into()
                .unwrap_or(i64::MAX),
        }
    }
}

#[derive(Debug, Default)]
struct Database {
    entries: HashMap<Bytes, Entry>,
    order: BTreeMap<u64, Bytes>,
    next_seq: u64,
}

impl Database {
    /// The live entry for `key`, dropping it if it has expired.
    fn live(&mut self, key: &[u8]) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(Entry::is_expired) {
            self.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn insert(&mut self, key: Bytes, value: Value, expires_at: Option<Instant>) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.insert(seq, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.seq);
                true
            }
            None => false,
        }
    }
}

/// Result of one `SCAN` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanStep {
    pub cursor: u64,
    pub keys: Vec<Bytes>,
}

/// All databases of one server.
#[derive(Debug)]
pub struct Store {
    databases: Mutex<Vec<Database>>,
}

impl Store {
    pub fn new(databases: u32) -> Self {
        Self {
            databases: Mutex::new((0..databases).map(|_| Database::default()).collect()),
        }
    }

    pub fn database_count(&self) -> u32 {
        self.databases.lock().len() as u32
    }

    fn with_db<T>(&self, db: u32, f: impl FnOnce(&mut Database) -> T) -> T {
        let mut databases = self.databases.lock();
        let index = db as usize;
        assert!(index < databases.len(), "database {} does not exist", db);
        f(&mut databases[index])
    }

    pub fn set(&self, db: u32, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        let key = Bytes::copy_from_slice(key.as_ref());
        let value = Value::String(Bytes::copy_from_slice(value.as_ref()));
        self.with_db(db, |d| d.insert(key, value, None));
    }

    /// Appends to a list, creating it if needed. Returns the new length or
    /// `None` if the key holds another type.
    pub fn rpush(&self, db: u32, key: impl AsRef<[u8]>, items: &[&str]) -> Option<usize> {
        let items: Vec<Bytes> = items.iter().map(|i| Bytes::copy_from_slice(i.as_bytes())).collect();
        self.push_bytes(db, key.as_ref(), items)
    }

    pub fn push_bytes(&self, db: u32, key: &[u8], items: Vec<Bytes>) -> Option<usize> {
        self.with_db(db, |d| match d.live(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                list.extend(items);
                Some(list.len())
            }
            Some(_) => None,
            None => {
                let len = items.len();
                d.insert(Bytes::copy_from_slice(key), Value::List(items.into()), None);
                Some(len)
            }
        })
    }

    /// Sets a relative expiry. Returns false if the key does not exist.
    pub fn expire_in(&self, db: u32, key: impl AsRef<[u8]>, ms: u64) -> bool {
        let key = key.as_ref();
        self.with_db(db, |d| match d.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_millis(ms));
                true
            }
            None => false,
        })
    }

    pub fn exists(&self, db: u32, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        self.with_db(db, |d| d.live(key).is_some())
    }

    pub fn value(&self, db: u32, key: impl AsRef<[u8]>) -> Option<Value> {
        let key = key.as_ref();
        self.with_db(db, |d| d.live(key).map(|e| e.value.clone()))
    }

    /// The string stored at `key`.
    pub fn get(&self, db: u32, key: impl AsRef<[u8]>) -> Option<Bytes> {
        match self.value(db, key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Remaining TTL in milliseconds, -1 without expiry, -2 if missing.
    pub fn pttl(&self, db: u32, key: impl AsRef<[u8]>) -> i64 {
        let key = key.as_ref();
        self.with_db(db, |d| d.live(key).map_or(-2, |e| e.pttl()))
    }

    pub fn dump(&self, db: u32, key: impl AsRef<[u8]>) -> Option<Bytes> {
        self.value(db, key).map(|v| v.dump())
    }

    pub fn delete(&self, db: u32, key: &[u8]) -> bool {
        self.with_db(db, |d| d.live(key).is_some() && d.remove(key))
    }

    pub fn put(&self, db: u32, key: &[u8], value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.with_db(db, |d| d.insert(Bytes::copy_from_slice(key), value, expires_at));
    }

    pub fn len(&self, db: u32) -> usize {
        self.with_db(db, |d| {
            let expired: Vec<Bytes> = d
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired())
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                d.remove(&key);
            }
            d.entries.len()
        })
    }

    /// Looks at up to `count` keys starting at `cursor` and returns the
    /// ones matching `pattern`. The returned cursor is 0 at the end.
    pub fn scan(&self, db: u32, cursor: u64, pattern: &[u8], count: usize) -> ScanStep {
        let glob = GlobPattern::new(pattern);
        self.with_db(db, |d| {
            let mut keys = Vec::new();
            let mut next = 0;
            let mut examined = 0;
            for (seq, key) in d.order.range(cursor.max(1)..) {
                if examined == count.max(1) {
                    next = *seq;
                    break;
                }
                examined += 1;
                let live = d.entries.get(key).is_some_and(|e| !e.is_expired());
                if live && glob.matches(key) {
                    keys.push(key.clone());
                }
            }
            ScanStep { cursor: next, keys }
        })
    }
}

/// Glob matcher for `SCAN ... MATCH`.
struct GlobPattern<'a> {
    pattern: &'a [u8],
}

impl<'a> GlobPattern<'a> {
    fn new(pattern: &'a [u8]) -> Self {
        Self { pattern }
    }

    fn matches(&self, text: &[u8]) -> bool {
        Self::matches_at(self.pattern, text)
    }

    fn matches_at(pattern: &[u8], text: &[u8]) -> bool {
        let Some((&first, rest)) = pattern.split_first() else {
            return text.is_empty();
        };

        match first {
            b'*' => (0..=text.len()).any(|i| Self::matches_at(rest, &text[i..])),
            b'?' => !text.is_empty() && Self::matches_at(rest, &text[1..]),
            b'[' => {
                let Some(&c) = text.first() else {
                    return false;
                };
                let mut i = 1;
                let negate = pattern.get(1) == Some(&b'^');
                if negate {
                    i += 1;
                }
                let mut matched = false;
                while i < pattern.len() && pattern[i] != b']' {
                    if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
                        matched |= (pattern[i]..=pattern[i + 2]).contains(&c);
                        i += 3;
                    } else {
                        matched |= pattern[i] == c;
                        i += 1;
                    }
                }
                i < pattern.len() && matched != negate && Self::matches_at(&pattern[i + 1..], &text[1..])
            }
            b'\\' if !rest.is_empty() => {
                text.first() == Some(&rest[0]) && Self::matches_at(&rest[1..], &text[1..])
            }
            c => text.first() == Some(&c) && Self::matches_at(rest, &text[1..]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_pattern() {
        let glob = GlobPattern::new(b"user:*");
        assert!(glob.matches(b"user:1"));
        assert!(glob.matches(b"user:"));
        assert!(!glob.matches(b"users:1"));

        let glob = GlobPattern::new(b"h?llo");
        assert!(glob.matches(b"hello"));
        assert!(!glob.matches(b"hllo"));

        let glob = GlobPattern::new(b"h[a-e]llo");
        assert!(glob.matches(b"hello"));
        assert!(!glob.matches(b"hillo"));

        let glob = GlobPattern::new(b"h[^e]llo");
        assert!(glob.matches(b"hallo"));
        assert!(!glob.matches(b"hello"));

        assert!(GlobPattern::new(b"a\\*").matches(b"a*"));
        assert!(!GlobPattern::new(b"a\\*").matches(b"ab"));
    }

    #[test]
    fn test_scan_survives_deletes() {
        let store = Store::new(1);
        for i in 0..10 {
            store.set(0, format!("k{}", i), "v");
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let step = store.scan(0, cursor, b"*", 3);
            for key in &step.keys {
                store.delete(0, key);
            }
            seen.extend(step.keys);
            cursor = step.cursor;
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(store.len(0), 0);
    }

    #[test]
    fn test_dump_restore() {
        let store = Store::new(1);
        store.rpush(0, "l", &["a", "b"]);
        let payload = store.dump(0, "l").unwrap();
        assert_eq!(
            Value::restore(&payload),
            Ok(Value::List(VecDeque::from(vec![Bytes::from("a"), Bytes::from("b")])))
        );

        let mut corrupt = payload.to_vec();
        corrupt[2] ^= 0xff;
        assert!(Value::restore(&corrupt).is_err());
    }

    #[test]
    fn test_lazy_expiry() {
        let store = Store::new(1);
        store.set(0, "k", "v");
        assert_eq!(store.pttl(0, "k"), -1);
        store.expire_in(0, "k", 0);
        assert!(!store.exists(0, "k"));
        assert_eq!(store.pttl(0, "k"), -2);
    }
}
