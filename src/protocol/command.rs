//! Outgoing commands.
//!
//! A command is an ordered list of binary-safe arguments. On the wire it
//! is always a RESP array of bulk strings, which every server accepts.

use crate::protocol::types::{prefix, CRLF};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// A command ready to be sent, e.g. `SCAN 0 MATCH user:* COUNT 100`.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    /// Starts a command with its name as the first argument.
    pub fn new(name: &'static str) -> Self {
        Self {
            args: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    /// Appends a binary argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends an argument copied from a borrowed slice.
    pub fn arg_slice(mut self, arg: &[u8]) -> Self {
        self.args.push(Bytes::copy_from_slice(arg));
        self
    }

    /// Appends an integer rendered in decimal.
    pub fn arg_int(mut self, n: i64) -> Self {
        self.args.push(Bytes::from(n.to_string()));
        self
    }

    /// The command name, as sent.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Encodes the command as a RESP array of bulk strings.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(prefix::ARRAY);
        buf.put_slice(self.args.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        for arg in &self.args {
            buf.put_u8(prefix::BULK_STRING);
            buf.put_slice(arg.len().to_string().as_bytes());
            buf.put_slice(CRLF);
            buf.put_slice(arg);
            buf.put_slice(CRLF);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // AUTH arguments never reach the logs.
        if self.name().eq_ignore_ascii_case(b"AUTH") {
            return write!(f, "AUTH ***");
        }
        let mut first = true;
        for arg in &self.args {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match std::str::from_utf8(arg) {
                Ok(s) if arg.len() <= 64 => f.write_str(s)?,
                _ => write!(f, "<{} bytes>", arg.len())?,
            }
        }
        Ok(())
    }
}
