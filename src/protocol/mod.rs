//! RESP Protocol Implementation
//!
//! The client half of the Redis Serialization Protocol: commands go out as
//! arrays of bulk strings, replies come back as any of the RESP2 types.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` reply enum and its serialization
//! - `parser`: zero-copy incremental reply decoder
//! - `command`: outgoing command builder
//!
//! ## Example
//!
//! ```
//! use keysweep::protocol::{Command, RespParser, RespValue};
//! use bytes::BytesMut;
//!
//! let mut out = BytesMut::new();
//! Command::new("TYPE").arg("user:1").encode_into(&mut out);
//!
//! let mut incoming = BytesMut::from(&b"+hash\r\n"[..]);
//! let reply = RespParser::new().decode(&mut incoming).unwrap().unwrap();
//! assert_eq!(reply, RespValue::simple_string("hash"));
//! ```

pub mod command;
pub mod parser;
pub mod types;

pub use command::Command;
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
