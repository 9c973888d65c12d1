//! Wire Client Module
//!
//! Opens and drives connections to a single Redis-compatible server. Higher
//! layers (the cluster router, the scanner, the operations) never touch a
//! socket directly; they hand a [`Command`](crate::protocol::Command) to a
//! [`Connection`] and get one [`RespValue`](crate::protocol::RespValue) back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ConnectionDescriptor                       │
//! │        host:port, credentials, db, timeouts                 │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ connect()
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Connection                             │
//! │                                                             │
//! │  ┌─────────────┐    ┌──────────┐    ┌──────────┐            │
//! │  │ TCP connect │───>│   AUTH   │───>│   PING   │            │
//! │  └─────────────┘    └──────────┘    └────┬─────┘            │
//! │                                          │                  │
//! │                                          ▼                  │
//! │                     ┌─────────────┐ ┌──────────┐            │
//! │                     │  execute()  │<│  SELECT  │            │
//! │                     └─────────────┘ └──────────┘            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use keysweep::connection::{Connection, ConnectionDescriptor};
//! use keysweep::protocol::Command;
//!
//! let desc = ConnectionDescriptor::new("127.0.0.1", 6379).with_db(2);
//! let mut conn = Connection::connect(&desc).await?;
//! let reply = conn.execute(&Command::new("DBSIZE")).await?;
//! ```

pub mod client;
pub mod descriptor;

pub use client::{Connection, ConnectionError, ConnectionStats};
pub use descriptor::{ConnectionDescriptor, Credentials, NodeAddr, DEFAULT_MAX_DATABASES};
