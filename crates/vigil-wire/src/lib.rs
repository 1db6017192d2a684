//! # vigil-wire: wire codec for the monitored store's client protocol
//!
//! The monitored key-value store speaks a line-oriented request/reply
//! protocol (RESP). This crate provides the [`Frame`] type with an
//! incremental decoder and an encoder, plus builders for every command the
//! supervisor issues ([`cmd`]).
//!
//! Decoding is incremental: [`Frame::decode`] returns `Ok(None)` while the
//! buffer holds only a partial frame and consumes nothing. Malformed input
//! is an error; the caller is expected to drop the connection.

pub mod cmd;
mod frame;

pub use frame::{Frame, WireError, MAX_ARRAY_LEN, MAX_BULK_LEN};
