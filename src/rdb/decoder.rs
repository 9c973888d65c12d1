//! Streaming RDB reader.
//!
//! The decoder pulls one record at a time from an async byte source. Keys
//! are fully decoded (plain, integer-encoded, or LZF-compressed); values
//! are only walked far enough to find where they end, and the bytes walked
//! over become the entry's `RESTORE` payload. Memory use is bounded by the
//! largest single entry.
//!
//! Every byte up to and including the EOF opcode feeds a running CRC64,
//! which is compared with the trailing checksum once the EOF opcode is
//! reached.

use crate::rdb::crc64::{crc64, Crc64};
use crate::rdb::{
    lzf, FormatError, RdbEntry, RdbOptions, RdbValueType, MAX_RDB_VERSION, MIN_RDB_VERSION,
};
use bytes::Bytes;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, trace, warn};

const MAGIC: &[u8; 5] = b"REDIS";

/// Read buffer for files
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Largest single string accepted
const MAX_STRING_LEN: u64 = 512 * 1024 * 1024;

/// Bytes moved per read when copying or skipping strings
const READ_CHUNK: usize = 8192;

/// Oldest version whose files end with a checksum
const CHECKSUM_SINCE_VERSION: u32 = 5;

mod opcode {
    pub const SLOT_INFO: u8 = 0xF4;
    pub const FUNCTION2: u8 = 0xF5;
    pub const FUNCTION_PRE_GA: u8 = 0xF6;
    pub const MODULE_AUX: u8 = 0xF7;
    pub const IDLE: u8 = 0xF8;
    pub const FREQ: u8 = 0xF9;
    pub const AUX: u8 = 0xFA;
    pub const RESIZEDB: u8 = 0xFB;
    pub const EXPIRETIME_MS: u8 = 0xFC;
    pub const EXPIRETIME: u8 = 0xFD;
    pub const SELECTDB: u8 = 0xFE;
    pub const EOF: u8 = 0xFF;
}

mod encoding {
    pub const INT8: u8 = 0;
    pub const INT16: u8 = 1;
    pub const INT32: u8 = 2;
    pub const LZF: u8 = 3;
}

/// Module value opcodes
mod module_op {
    pub const EOF: u64 = 0;
    pub const SINT: u64 = 1;
    pub const UINT: u64 = 2;
    pub const FLOAT: u64 = 3;
    pub const DOUBLE: u64 = 4;
    pub const STRING: u64 = 5;
}

/// A length prefix: either a plain length or a special string encoding.
enum Length {
    Plain(u64),
    Encoded(u8),
}

/// Pull-based RDB decoder.
pub struct RdbDecoder<R> {
    reader: R,
    options: RdbOptions,
    version: u32,
    crc: Crc64,
    offset: u64,
    db: u32,
    /// Value bytes of the entry being read
    capture: Vec<u8>,
    capturing: bool,
    finished: bool,
    failed: bool,
    entries: u64,
}

impl RdbDecoder<BufReader<File>> {
    /// Opens an RDB file and validates its header.
    pub async fn open(path: impl AsRef<Path>, options: RdbOptions) -> Result<Self, FormatError> {
        let file = File::open(path.as_ref()).await?;
        Self::from_reader(BufReader::with_capacity(READ_BUFFER_SIZE, file), options).await
    }
}

impl<R: AsyncRead + Unpin> RdbDecoder<R> {
    /// Wraps any async byte source and validates its header.
    pub async fn from_reader(reader: R, options: RdbOptions) -> Result<Self, FormatError> {
        let mut decoder = RdbDecoder {
            reader,
            options,
            version: 0,
            crc: Crc64::new(),
            offset: 0,
            db: 0,
            capture: Vec::new(),
            capturing: false,
            finished: false,
            failed: false,
            entries: 0,
        };
        decoder.read_header().await?;
        Ok(decoder)
    }

    async fn read_header(&mut self) -> Result<(), FormatError> {
        let mut header = [0u8; 9];
        match self.fill(&mut header).await {
            Err(FormatError::UnexpectedEof { .. }) => return Err(FormatError::BadMagic),
            other => other?,
        }
        if &header[..5] != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = std::str::from_utf8(&header[5..])
            .ok()
            .and_then(|digits| digits.parse::<u32>().ok())
            .ok_or(FormatError::BadMagic)?;
        if !(MIN_RDB_VERSION..=MAX_RDB_VERSION).contains(&version) {
            return Err(FormatError::UnsupportedVersion(version));
        }
        debug!(version, "RDB header");
        self.version = version;
        Ok(())
    }

    /// The next key/value record, or `None` once the EOF opcode has been
    /// read and the checksum verified.
    ///
    /// After an error every later call returns [`FormatError::Exhausted`].
    pub async fn next_entry(&mut self) -> Result<Option<RdbEntry>, FormatError> {
        if self.failed {
            return Err(FormatError::Exhausted);
        }
        if self.finished {
            return Ok(None);
        }
        match self.read_record().await {
            Ok(Some(entry)) => {
                self.entries += 1;
                Ok(Some(entry))
            }
            Ok(None) => {
                self.finished = true;
                debug!(entries = self.entries, bytes = self.offset, "RDB fully read");
                Ok(None)
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    async fn read_record(&mut self) -> Result<Option<RdbEntry>, FormatError> {
        let mut expire_at_ms = None;

        loop {
            let at = self.offset;
            let op = self.read_u8().await?;
            match op {
                opcode::EOF => {
                    self.verify_checksum().await?;
                    return Ok(None);
                }
                opcode::SELECTDB => {
                    let db = self.read_len().await?;
                    self.db = u32::try_from(db).map_err(|_| invalid(at, "database index too large"))?;
                    debug!(db = self.db, "SELECTDB");
                }
                opcode::RESIZEDB => {
                    let keys = self.read_len().await?;
                    let expires = self.read_len().await?;
                    debug!(db = self.db, keys, expires, "RESIZEDB");
                }
                opcode::EXPIRETIME => {
                    let secs = u32::from_le_bytes(self.read_array().await?);
                    expire_at_ms = Some(u64::from(secs) * 1000);
                }
                opcode::EXPIRETIME_MS => {
                    expire_at_ms = Some(u64::from_le_bytes(self.read_array().await?));
                }
                opcode::AUX => {
                    let key = self.read_string().await?;
                    let value = self.read_string().await?;
                    debug!(
                        field = %String::from_utf8_lossy(&key),
                        value = %String::from_utf8_lossy(&value),
                        "AUX"
                    );
                }
                opcode::FREQ => {
                    self.read_u8().await?;
                }
                opcode::IDLE => {
                    self.read_len().await?;
                }
                opcode::MODULE_AUX => {
                    let module_id = self.read_len().await?;
                    self.read_len().await?;
                    self.read_len().await?;
                    self.skip_module_value().await?;
                    debug!(module_id, "Skipped module aux data");
                }
                opcode::FUNCTION2 => {
                    self.skip_string().await?;
                    debug!("Skipped function library");
                }
                opcode::SLOT_INFO => {
                    for _ in 0..3 {
                        self.read_len().await?;
                    }
                }
                opcode::FUNCTION_PRE_GA => {
                    return Err(FormatError::Unsupported {
                        what: "opcode",
                        byte: op,
                        offset: at,
                    });
                }
                type_byte => {
                    let value_type =
                        RdbValueType::from_byte(type_byte).ok_or(FormatError::Unsupported {
                            what: "value type",
                            byte: type_byte,
                            offset: at,
                        })?;
                    let key = self.read_string().await?;

                    self.capture.clear();
                    self.capture.push(type_byte);
                    self.capturing = true;
                    let walked = self.skip_value(value_type).await;
                    self.capturing = false;
                    walked?;

                    let payload = self.finish_payload();
                    trace!(
                        db = self.db,
                        key = %String::from_utf8_lossy(&key),
                        value_type = ?value_type,
                        payload_len = payload.len(),
                        "RDB entry"
                    );
                    return Ok(Some(RdbEntry {
                        db: self.db,
                        key: Bytes::from(key),
                        value_type,
                        payload,
                        expire_at_ms,
                    }));
                }
            }
        }
    }

    /// Appends the RDB version and a CRC64 to the captured value bytes.
    fn finish_payload(&mut self) -> Bytes {
        let mut payload = std::mem::take(&mut self.capture);
        payload.extend_from_slice(&(self.version as u16).to_le_bytes());
        let crc = crc64(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());
        Bytes::from(payload)
    }

    async fn verify_checksum(&mut self) -> Result<(), FormatError> {
        if self.version < CHECKSUM_SINCE_VERSION {
            return Ok(());
        }
        let actual = self.crc.digest();

        // The checksum itself is not part of the checksummed data.
        let mut trailer = [0u8; 8];
        match self.reader.read_exact(&mut trailer).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if self.options.strict_checksum {
                    return Err(FormatError::MissingChecksum);
                }
                warn!("RDB file ends without a checksum");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let expected = u64::from_le_bytes(trailer);
        if expected == 0 {
            debug!("RDB checksum disabled by the writer");
        } else if expected != actual {
            if self.options.strict_checksum {
                return Err(FormatError::ChecksumMismatch { expected, actual });
            }
            warn!(
                expected = %format!("{:016x}", expected),
                actual = %format!("{:016x}", actual),
                "RDB checksum mismatch"
            );
        }
        Ok(())
    }

    async fn skip_value(&mut self, value_type: RdbValueType) -> Result<(), FormatError> {
        use RdbValueType::*;
        match value_type {
            String | HashZipmap | ListZiplist | SetIntset | ZSetZiplist | HashZiplist
            | HashListpack | ZSetListpack | SetListpack => self.skip_string().await,
            List | Set | ListQuicklist => {
                let n = self.read_len().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                }
                Ok(())
            }
            ZSet => {
                let n = self.read_len().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                    self.skip_string_double().await?;
                }
                Ok(())
            }
            ZSet2 => {
                let n = self.read_len().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                    self.skip(8).await?;
                }
                Ok(())
            }
            Hash => {
                let n = self.read_len().await?;
                for _ in 0..n {
                    self.skip_string().await?;
                    self.skip_string().await?;
                }
                Ok(())
            }
            ListQuicklist2 => {
                let n = self.read_len().await?;
                for _ in 0..n {
                    // container kind (plain or packed)
                    self.read_len().await?;
                    self.skip_string().await?;
                }
                Ok(())
            }
            Module2 => {
                self.read_len().await?;
                self.skip_module_value().await
            }
            StreamListpacks => self.skip_stream(1).await,
            StreamListpacks2 => self.skip_stream(2).await,
            StreamListpacks3 => self.skip_stream(3).await,
        }
    }

    async fn skip_stream(&mut self, revision: u8) -> Result<(), FormatError> {
        let listpacks = self.read_len().await?;
        for _ in 0..listpacks {
            self.skip_string().await?;
            self.skip_string().await?;
        }

        // length, last id
        for _ in 0..3 {
            self.read_len().await?;
        }
        if revision >= 2 {
            // first id, max deleted id, entries added
            for _ in 0..5 {
                self.read_len().await?;
            }
        }

        let groups = self.read_len().await?;
        for _ in 0..groups {
            self.skip_string().await?;
            self.read_len().await?;
            self.read_len().await?;
            if revision >= 2 {
                self.read_len().await?;
            }

            let pending = self.read_len().await?;
            for _ in 0..pending {
                // raw id, delivery time
                self.skip(16 + 8).await?;
                self.read_len().await?;
            }

            let consumers = self.read_len().await?;
            for _ in 0..consumers {
                self.skip_string().await?;
                self.skip(8).await?;
                if revision >= 3 {
                    self.skip(8).await?;
                }
                let owned = self.read_len().await?;
                self.skip(owned.saturating_mul(16)).await?;
            }
        }
        Ok(())
    }

    async fn skip_module_value(&mut self) -> Result<(), FormatError> {
        loop {
            let at = self.offset;
            match self.read_len().await? {
                module_op::EOF => return Ok(()),
                module_op::SINT | module_op::UINT => {
                    self.read_len().await?;
                }
                module_op::FLOAT => self.skip(4).await?,
                module_op::DOUBLE => self.skip(8).await?,
                module_op::STRING => self.skip_string().await?,
                other => return Err(invalid(at, format!("unknown module opcode {}", other))),
            }
        }
    }

    /// Old-style zset score: a length byte followed by ASCII, with 253-255
    /// standing for NaN and the infinities.
    async fn skip_string_double(&mut self) -> Result<(), FormatError> {
        match self.read_u8().await? {
            253..=255 => Ok(()),
            len => self.skip(u64::from(len)).await,
        }
    }

    async fn read_length(&mut self) -> Result<Length, FormatError> {
        let at = self.offset;
        let first = self.read_u8().await?;
        match first >> 6 {
            0 => Ok(Length::Plain(u64::from(first & 0x3f))),
            1 => {
                let next = self.read_u8().await?;
                Ok(Length::Plain((u64::from(first & 0x3f) << 8) | u64::from(next)))
            }
            2 => match first {
                0x80 => Ok(Length::Plain(u64::from(u32::from_be_bytes(
                    self.read_array().await?,
                )))),
                0x81 => Ok(Length::Plain(u64::from_be_bytes(self.read_array().await?))),
                _ => Err(invalid(at, format!("bad length prefix 0x{:02x}", first))),
            },
            _ => Ok(Length::Encoded(first & 0x3f)),
        }
    }

    async fn read_len(&mut self) -> Result<u64, FormatError> {
        let at = self.offset;
        match self.read_length().await? {
            Length::Plain(n) => Ok(n),
            Length::Encoded(_) => Err(invalid(at, "encoded string where a length was expected")),
        }
    }

    async fn read_string(&mut self) -> Result<Vec<u8>, FormatError> {
        let at = self.offset;
        match self.read_length().await? {
            Length::Plain(len) => self.read_vec(len).await,
            Length::Encoded(encoding::INT8) => {
                let [b] = self.read_array::<1>().await?;
                Ok((b as i8).to_string().into_bytes())
            }
            Length::Encoded(encoding::INT16) => {
                let n = i16::from_le_bytes(self.read_array().await?);
                Ok(n.to_string().into_bytes())
            }
            Length::Encoded(encoding::INT32) => {
                let n = i32::from_le_bytes(self.read_array().await?);
                Ok(n.to_string().into_bytes())
            }
            Length::Encoded(encoding::LZF) => {
                let compressed_len = self.read_len().await?;
                let len = self.read_len().await?;
                if len > MAX_STRING_LEN {
                    return Err(invalid(at, format!("string of {} bytes", len)));
                }
                let compressed = self.read_vec(compressed_len).await?;
                lzf::decompress(&compressed, len as usize)
            }
            Length::Encoded(other) => Err(invalid(at, format!("unknown string encoding {}", other))),
        }
    }

    async fn skip_string(&mut self) -> Result<(), FormatError> {
        let at = self.offset;
        match self.read_length().await? {
            Length::Plain(len) => self.skip(len).await,
            Length::Encoded(encoding::INT8) => self.skip(1).await,
            Length::Encoded(encoding::INT16) => self.skip(2).await,
            Length::Encoded(encoding::INT32) => self.skip(4).await,
            Length::Encoded(encoding::LZF) => {
                let compressed_len = self.read_len().await?;
                self.read_len().await?;
                self.skip(compressed_len).await
            }
            Length::Encoded(other) => Err(invalid(at, format!("unknown string encoding {}", other))),
        }
    }

    async fn read_vec(&mut self, len: u64) -> Result<Vec<u8>, FormatError> {
        if len > MAX_STRING_LEN {
            return Err(invalid(self.offset, format!("string of {} bytes", len)));
        }
        // Grows with the bytes actually read, not the declared length.
        let len = len as usize;
        let mut buf = Vec::with_capacity(len.min(READ_CHUNK));
        let mut chunk = [0u8; READ_CHUNK];
        while buf.len() < len {
            let n = (len - buf.len()).min(READ_CHUNK);
            self.fill(&mut chunk[..n]).await?;
            buf.extend_from_slice(&chunk[..n]);
        }
        Ok(buf)
    }

    /// Consumes `len` bytes without keeping them (beyond the capture).
    async fn skip(&mut self, len: u64) -> Result<(), FormatError> {
        if len > MAX_STRING_LEN {
            return Err(invalid(self.offset, format!("string of {} bytes", len)));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut remaining = len as usize;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.fill(&mut chunk[..n]).await?;
            remaining -= n;
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8, FormatError> {
        let [b] = self.read_array::<1>().await?;
        Ok(b)
    }

    async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], FormatError> {
        let mut buf = [0u8; N];
        self.fill(&mut buf).await?;
        Ok(buf)
    }

    /// Reads exactly `buf.len()` bytes, feeding the checksum and the
    /// capture buffer.
    async fn fill(&mut self, buf: &mut [u8]) -> Result<(), FormatError> {
        let offset = self.offset;
        self.reader.read_exact(buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FormatError::UnexpectedEof { offset }
            } else {
                FormatError::Io(e)
            }
        })?;
        self.crc.update(buf);
        self.offset += buf.len() as u64;
        if self.capturing {
            self.capture.extend_from_slice(buf);
        }
        Ok(())
    }

    /// RDB version from the header.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Database of the most recent SELECTDB.
    pub fn current_db(&self) -> u32 {
        self.db
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn entries_read(&self) -> u64 {
        self.entries
    }
}

fn invalid(offset: u64, detail: impl Into<String>) -> FormatError {
    FormatError::InvalidEncoding {
        offset,
        detail: detail.into(),
    }
}
