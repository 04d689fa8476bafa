//! Protocol buffer messages for the Lichtenstein wire protocol.
//!
//! The messages are written out by hand against the `prost` runtime rather
//! than generated at build time; the schema is small and stable, and this
//! keeps the build free of a `protoc` dependency.
//!
//! Every payload travels inside the [`Message`] envelope as a
//! `google.protobuf.Any` whose type URL is
//! `type.googleapis.com/lichtenstein.protocol.<Name>` (node-API requests use
//! the `lichtenstein.protocol.client.` package). [`pack`] and [`unpack`] are
//! the only places type URLs are produced or checked.

use crate::error::{Error, Result};

/// Prefix shared by every type URL on the wire.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outer envelope wrapping every logical message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    /// Protocol version; must equal the process constant.
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// The actual payload, dispatched by type URL.
    #[prost(message, optional, tag = "2")]
    pub payload: Option<prost_types::Any>,
}

/// Error report; may substitute for any expected message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WireError {
    #[prost(string, tag = "1")]
    pub description: String,
}

// ---------------------------------------------------------------------------
// Authentication handshake
// ---------------------------------------------------------------------------

/// First message of the handshake: the initiator announces itself.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthHello {
    /// 16 raw UUID bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub uuid: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub supported_methods: Vec<String>,
}

/// The responder's challenge; `payload` carries the method-specific message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthChallenge {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(message, optional, tag = "2")]
    pub payload: Option<prost_types::Any>,
}

/// Hash functions accepted for the HMAC method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum HashFunction {
    Sha1 = 0,
    Whirlpool = 1,
}

/// HMAC-specific challenge carried inside [`AuthChallenge`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct HmacAuthChallenge {
    #[prost(enumeration = "HashFunction", tag = "1")]
    pub function: i32,
    /// 64 bytes from a cryptographic RNG.
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
}

/// The initiator's answer; `payload` carries the method-specific message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthResponse {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<prost_types::Any>,
}

/// HMAC-specific response carried inside [`AuthResponse`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct HmacAuthResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub hmac: Vec<u8>,
    /// The challenge nonce, echoed verbatim.
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
}

/// Final verdict of the handshake.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthState {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error_details: String,
}

// ---------------------------------------------------------------------------
// Node API (lichtenstein.protocol.client package)
// ---------------------------------------------------------------------------

/// Request for node metadata; each section is opt-in.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetInfo {
    #[prost(bool, tag = "1")]
    pub wants_node_info: bool,
    #[prost(bool, tag = "2")]
    pub wants_adoption_info: bool,
    #[prost(bool, tag = "3")]
    pub wants_performance_info: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetInfoResponse {
    #[prost(message, optional, tag = "1")]
    pub node: Option<NodeInfo>,
    #[prost(message, optional, tag = "2")]
    pub adoption: Option<AdoptionStatus>,
    #[prost(message, optional, tag = "3")]
    pub performance: Option<PerformanceInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NodeInfo {
    #[prost(string, tag = "1")]
    pub hostname: String,
    /// Operating system description (sysname, release, version).
    #[prost(string, tag = "2")]
    pub os: String,
    #[prost(string, tag = "3")]
    pub hardware: String,
    /// Client library name and version.
    #[prost(string, tag = "4")]
    pub client: String,
    /// 16 raw UUID bytes.
    #[prost(bytes = "vec", tag = "5")]
    pub uuid: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AdoptionStatus {
    #[prost(bool, tag = "1")]
    pub is_adopted: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PerformanceInfo {
    #[prost(uint64, tag = "1")]
    pub uptime_secs: u64,
}

/// A controller's request to adopt this node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AdoptRequest {
    /// 16 raw UUID bytes of the adopting controller.
    #[prost(bytes = "vec", tag = "1")]
    pub server_uuid: Vec<u8>,
    #[prost(string, tag = "2")]
    pub api_address: String,
    #[prost(uint32, tag = "3")]
    pub api_port: u32,
    #[prost(string, tag = "4")]
    pub rt_address: String,
    #[prost(uint32, tag = "5")]
    pub rt_port: u32,
    /// Shared HMAC secret issued by the controller.
    #[prost(string, tag = "6")]
    pub secret: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AdoptAck {
    #[prost(bool, tag = "1")]
    pub is_adopted: bool,
}

// ---------------------------------------------------------------------------
// Any packing
// ---------------------------------------------------------------------------

/// A message that can travel inside the envelope's `Any` payload.
pub trait ProtocolMessage: prost::Message + Default {
    /// Fully-qualified protobuf type name, e.g.
    /// `lichtenstein.protocol.AuthHello`.
    const TYPE_NAME: &'static str;

    /// The complete type URL for this message.
    fn type_url() -> String {
        format!("{TYPE_URL_PREFIX}{}", Self::TYPE_NAME)
    }
}

macro_rules! protocol_message {
    ($ty:ident, $name:literal) => {
        impl ProtocolMessage for $ty {
            const TYPE_NAME: &'static str = $name;
        }
    };
}

protocol_message!(WireError, "lichtenstein.protocol.Error");
protocol_message!(AuthHello, "lichtenstein.protocol.AuthHello");
protocol_message!(AuthChallenge, "lichtenstein.protocol.AuthChallenge");
protocol_message!(HmacAuthChallenge, "lichtenstein.protocol.HmacAuthChallenge");
protocol_message!(AuthResponse, "lichtenstein.protocol.AuthResponse");
protocol_message!(HmacAuthResponse, "lichtenstein.protocol.HmacAuthResponse");
protocol_message!(AuthState, "lichtenstein.protocol.AuthState");
protocol_message!(GetInfo, "lichtenstein.protocol.client.GetInfo");
protocol_message!(
    GetInfoResponse,
    "lichtenstein.protocol.client.GetInfoResponse"
);
protocol_message!(AdoptRequest, "lichtenstein.protocol.client.AdoptRequest");
protocol_message!(AdoptAck, "lichtenstein.protocol.client.AdoptAck");

/// Pack a message into an `Any` with its canonical type URL.
pub fn pack<M: ProtocolMessage>(message: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: M::type_url(),
        value: message.encode_to_vec(),
    }
}

/// Unpack an `Any` into the expected message type.
///
/// Fails with a protocol error when the type URL does not match `M` or the
/// bytes do not decode.
pub fn unpack<M: ProtocolMessage>(any: &prost_types::Any) -> Result<M> {
    if any.type_url != M::type_url() {
        return Err(Error::Protocol(format!(
            "expected {}, got '{}'",
            M::type_url(),
            any.type_url
        )));
    }

    M::decode(any.value.as_slice()).map_err(Into::into)
}

/// The type URL carried by an envelope, or an empty string when the payload
/// is absent.
pub fn payload_type(message: &Message) -> &str {
    message
        .payload
        .as_ref()
        .map_or("", |any| any.type_url.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let hello = AuthHello {
            uuid: vec![0xAB; 16],
            supported_methods: vec!["me.tseifert.lichtenstein.auth.hmac".into()],
        };

        let any = pack(&hello);
        assert_eq!(
            any.type_url,
            "type.googleapis.com/lichtenstein.protocol.AuthHello"
        );

        let back: AuthHello = unpack(&any).unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn unpack_rejects_wrong_type_url() {
        let any = pack(&AuthState {
            success: true,
            error_details: String::new(),
        });

        let result: Result<AuthHello> = unpack(&any);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn payload_type_of_empty_envelope() {
        let message = Message {
            version: 1,
            payload: None,
        };
        assert_eq!(payload_type(&message), "");
    }
}
