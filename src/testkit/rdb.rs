//! RDB fixture builder.

use crate::rdb::crc64::crc64;

const RDB_TYPE_STRING: u8 = 0;
const RDB_TYPE_LIST: u8 = 1;
const RDB_TYPE_HASH: u8 = 4;
const RDB_TYPE_ZSET_2: u8 = 5;

/// Appends an RDB length prefix.
pub fn encode_length(buf: &mut Vec<u8>, len: u64) {
    if len < 1 << 6 {
        buf.push(len as u8);
    } else if len < 1 << 14 {
        buf.push(0x40 | (len >> 8) as u8);
        buf.push(len as u8);
    } else if let Ok(len) = u32::try_from(len) {
        buf.push(0x80);
        buf.extend_from_slice(&len.to_be_bytes());
    } else {
        buf.push(0x81);
        buf.extend_from_slice(&len.to_be_bytes());
    }
}

/// Appends a plain (unencoded) RDB string.
pub fn encode_string(buf: &mut Vec<u8>, s: &[u8]) {
    encode_length(buf, s.len() as u64);
    buf.extend_from_slice(s);
}

/// Builds RDB files byte by byte.
///
/// ```ignore
/// let file = RdbBuilder::new(11)
///     .select_db(0)
///     .expire_ms(now_ms() + 60_000)
///     .string("session:1", "alive")
///     .finish();
/// ```
#[derive(Debug, Clone)]
pub struct RdbBuilder {
    version: u32,
    buf: Vec<u8>,
}

impl RdbBuilder {
    pub fn new(version: u32) -> Self {
        let mut buf = b"REDIS".to_vec();
        buf.extend_from_slice(format!("{:04}", version).as_bytes());
        Self { version, buf }
    }

    pub fn aux(mut self, key: &str, value: &str) -> Self {
        self.buf.push(0xfa);
        encode_string(&mut self.buf, key.as_bytes());
        encode_string(&mut self.buf, value.as_bytes());
        self
    }

    pub fn select_db(mut self, db: u32) -> Self {
        self.buf.push(0xfe);
        encode_length(&mut self.buf, u64::from(db));
        self
    }

    pub fn resize_db(mut self, keys: u64, expires: u64) -> Self {
        self.buf.push(0xfb);
        encode_length(&mut self.buf, keys);
        encode_length(&mut self.buf, expires);
        self
    }

    /// Expiry for the next record, in unix milliseconds.
    pub fn expire_ms(mut self, at: u64) -> Self {
        self.buf.push(0xfc);
        self.buf.extend_from_slice(&at.to_le_bytes());
        self
    }

    /// Expiry for the next record, in unix seconds.
    pub fn expire_secs(mut self, at: u32) -> Self {
        self.buf.push(0xfd);
        self.buf.extend_from_slice(&at.to_le_bytes());
        self
    }

    pub fn string(mut self, key: &str, value: &str) -> Self {
        self.buf.push(RDB_TYPE_STRING);
        encode_string(&mut self.buf, key.as_bytes());
        encode_string(&mut self.buf, value.as_bytes());
        self
    }

    pub fn list(mut self, key: &str, items: &[&str]) -> Self {
        self.buf.push(RDB_TYPE_LIST);
        encode_string(&mut self.buf, key.as_bytes());
        encode_length(&mut self.buf, items.len() as u64);
        for item in items {
            encode_string(&mut self.buf, item.as_bytes());
        }
        self
    }

    pub fn hash(mut self, key: &str, fields: &[(&str, &str)]) -> Self {
        self.buf.push(RDB_TYPE_HASH);
        encode_string(&mut self.buf, key.as_bytes());
        encode_length(&mut self.buf, fields.len() as u64);
        for (field, value) in fields {
            encode_string(&mut self.buf, field.as_bytes());
            encode_string(&mut self.buf, value.as_bytes());
        }
        self
    }

    pub fn zset2(mut self, key: &str, members: &[(&str, f64)]) -> Self {
        self.buf.push(RDB_TYPE_ZSET_2);
        encode_string(&mut self.buf, key.as_bytes());
        encode_length(&mut self.buf, members.len() as u64);
        for (member, score) in members {
            encode_string(&mut self.buf, member.as_bytes());
            self.buf.extend_from_slice(&score.to_le_bytes());
        }
        self
    }

    /// Appends bytes as they are.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_string(mut self, s: &[u8]) -> Self {
        encode_string(&mut self.buf, s);
        self
    }

    pub fn put_length(mut self, len: u64) -> Self {
        encode_length(&mut self.buf, len);
        self
    }

    /// EOF plus the correct checksum (none before version 5).
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(0xff);
        if self.version >= 5 {
            let crc = crc64(&self.buf);
            self.buf.extend_from_slice(&crc.to_le_bytes());
        }
        self.buf
    }

    pub fn finish_with_checksum(mut self, checksum: u64) -> Vec<u8> {
        self.buf.push(0xff);
        self.buf.extend_from_slice(&checksum.to_le_bytes());
        self.buf
    }

    /// EOF with the trailing checksum left off.
    pub fn finish_without_checksum(mut self) -> Vec<u8> {
        self.buf.push(0xff);
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_encodings() {
        let mut buf = Vec::new();
        encode_length(&mut buf, 10);
        encode_length(&mut buf, 700);
        encode_length(&mut buf, 70_000);
        assert_eq!(buf, vec![0x0a, 0x42, 0xbc, 0x80, 0x00, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn test_header_and_trailer() {
        let file = RdbBuilder::new(9).finish();
        assert_eq!(&file[..9], b"REDIS0009");
        assert_eq!(file[9], 0xff);
        assert_eq!(file.len(), 18);

        let old = RdbBuilder::new(4).finish();
        assert_eq!(old, b"REDIS0004\xff".to_vec());
    }
}
