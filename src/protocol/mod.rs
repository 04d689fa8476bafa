//! Wire protocol: framing, envelope handling, and mutual authentication.
//!
//! Everything here is transport-agnostic — the same code runs over the TLS
//! control channel and the DTLS realtime channel.

pub mod auth;
pub mod message_io;

/// Protocol version stamped into (and required of) every envelope.
pub const PROTOCOL_VERSION: u32 = 0x0000_0100;

/// Client identification string reported in `NodeInfo`.
pub fn client_version() -> String {
    format!("lichtenstein-client {}", env!("CARGO_PKG_VERSION"))
}
