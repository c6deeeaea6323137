//! JSON-RPC tool server client
//!
//! Layered bottom-up:
//!
//! - `types`     -- JSON-RPC 2.0 envelopes and the tool protocol types
//! - `framing`   -- newline and Content-Length frame codecs
//! - `client`    -- request correlation over a pair of message channels
//! - `protocol`  -- the initialize handshake and typed tool operations
//! - `transport` -- the `ServerTransport` trait and the stdio implementation

pub mod client;
pub mod framing;
pub mod protocol;
pub mod transport;
pub mod types;
