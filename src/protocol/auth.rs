//! Mutual HMAC challenge/response authentication.
//!
//! Runs before any application traffic on a connection, in either role, over
//! either transport:
//!
//! 1. Initiator → Responder: `AuthHello { uuid, supported_methods }`
//! 2. Responder → Initiator: `AuthChallenge { method, HmacAuthChallenge }`
//! 3. Initiator → Responder: `AuthResponse { HmacAuthResponse }`
//! 4. Responder → Initiator: `AuthState { success }`
//!
//! At any step either side may substitute `Error`, which the receiver
//! converts into a local protocol error and aborts on.
//!
//! The HMAC input is exactly `uuid_bytes(16) || nonce` — no length prefixes,
//! no domain separator; this layout is fixed by the protocol.

use log::{debug, warn};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::io::Transport;
use crate::proto::{
    self, AuthChallenge, AuthHello, AuthResponse, AuthState, HashFunction, HmacAuthChallenge,
    HmacAuthResponse, ProtocolMessage, WireError,
};
use crate::protocol::message_io::MessageIo;

/// Method identifier announced in `AuthHello` and echoed in `AuthChallenge`.
pub const HMAC_METHOD: &str = "me.tseifert.lichtenstein.auth.hmac";

/// Challenge nonce length in bytes.
pub const NONCE_LEN: usize = 64;

/// How many empty reads (datagram receive timeouts) to tolerate while
/// waiting for the next handshake message.
const READ_ATTEMPTS: usize = 15;

// ---------------------------------------------------------------------------
// Capability handed to the authenticator
// ---------------------------------------------------------------------------

/// Which end of the handshake this side runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Everything the handshake needs to know; the authenticator holds no handle
/// to the node itself.
#[derive(Clone)]
pub struct AuthConfig {
    /// The node identity both sides must agree on.
    pub uuid: Uuid,
    /// Shared HMAC secret from the adoption.
    pub secret: Vec<u8>,
    pub role: Role,
}

impl AuthConfig {
    pub fn initiator(uuid: Uuid, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            secret: secret.into(),
            role: Role::Initiator,
        }
    }

    pub fn responder(uuid: Uuid, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            secret: secret.into(),
            role: Role::Responder,
        }
    }
}

// ---------------------------------------------------------------------------
// HMAC primitives
// ---------------------------------------------------------------------------

/// Map a negotiated hash function to an OpenSSL digest.
fn digest_for(function: HashFunction) -> Result<MessageDigest> {
    match function {
        HashFunction::Sha1 => Ok(MessageDigest::sha1()),
        HashFunction::Whirlpool => MessageDigest::from_nid(Nid::WHIRLPOOL)
            .ok_or_else(|| Error::Ssl("WHIRLPOOL digest unavailable in this build".into())),
    }
}

/// The responder's preferred hash function.
///
/// WHIRLPOOL wherever the crypto library provides it; SHA1 otherwise.
pub fn default_function() -> HashFunction {
    if MessageDigest::from_nid(Nid::WHIRLPOOL).is_some() {
        HashFunction::Whirlpool
    } else {
        warn!("WHIRLPOOL unavailable, challenging with SHA1");
        HashFunction::Sha1
    }
}

/// Compute `HMAC_function(secret, uuid_bytes || nonce)`.
///
/// Pure: identical inputs produce identical output across runs.
pub fn compute_hmac(
    function: HashFunction,
    secret: &[u8],
    uuid: &Uuid,
    nonce: &[u8],
) -> Result<Vec<u8>> {
    let key = PKey::hmac(secret)?;
    let mut signer = Signer::new(digest_for(function)?, &key)?;
    signer.update(uuid.as_bytes())?;
    signer.update(nonce)?;
    Ok(signer.sign_to_vec()?)
}

/// Fill a fresh challenge nonce from the cryptographic RNG.
fn generate_nonce() -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; NONCE_LEN];
    openssl::rand::rand_bytes(&mut nonce)?;
    Ok(nonce)
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

/// Drives the four-message exchange in the configured role.
pub struct HmacAuthenticator {
    config: AuthConfig,
}

impl HmacAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Run the handshake to completion in the configured role.
    ///
    /// On the responder side this reads the initiator's `AuthHello` itself;
    /// call [`respond_to_hello`](Self::respond_to_hello) instead when the
    /// hello has already been consumed by a dispatch layer.
    pub fn run<T: Transport>(&self, io: &mut MessageIo<T>) -> Result<()> {
        match self.config.role {
            Role::Initiator => self.authenticate(io),
            Role::Responder => {
                let envelope = read_one(io)?;
                fail_on_wire_error(&envelope)?;
                let hello: AuthHello = expect_payload(&envelope)?;
                self.respond_to_hello(io, &hello)
            }
        }
    }

    // ── Initiator side ────────────────────────────────────────

    /// Authenticate against a responder: send the hello, answer the
    /// challenge, and wait for the verdict.
    pub fn authenticate<T: Transport>(&self, io: &mut MessageIo<T>) -> Result<()> {
        io.send_message(&AuthHello {
            uuid: self.config.uuid.as_bytes().to_vec(),
            supported_methods: vec![HMAC_METHOD.to_string()],
        })?;

        // Challenge (or error) from the responder.
        let envelope = read_one(io)?;
        fail_on_wire_error(&envelope)?;
        let challenge: AuthChallenge = expect_payload(&envelope)?;
        self.respond_to_challenge(io, &challenge)?;

        // Final verdict.
        let envelope = read_one(io)?;
        fail_on_wire_error(&envelope)?;
        let state: AuthState = expect_payload(&envelope)?;

        if state.success {
            debug!("authentication succeeded");
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "auth failed: \"{}\"",
                state.error_details
            )))
        }
    }

    fn respond_to_challenge<T: Transport>(
        &self,
        io: &mut MessageIo<T>,
        challenge: &AuthChallenge,
    ) -> Result<()> {
        if challenge.method != HMAC_METHOD {
            return Err(Error::Protocol(format!(
                "responder chose unsupported auth method '{}'",
                challenge.method
            )));
        }

        let payload = challenge
            .payload
            .as_ref()
            .ok_or_else(|| Error::Protocol("AuthChallenge carries no payload".into()))?;
        let hmac_challenge: HmacAuthChallenge = proto::unpack(payload)?;

        let function = HashFunction::try_from(hmac_challenge.function).map_err(|_| {
            Error::Protocol(format!(
                "unknown HMAC function: {}",
                hmac_challenge.function
            ))
        })?;

        let hmac = compute_hmac(
            function,
            &self.config.secret,
            &self.config.uuid,
            &hmac_challenge.nonce,
        )?;

        io.send_message(&AuthResponse {
            payload: Some(proto::pack(&HmacAuthResponse {
                hmac,
                nonce: hmac_challenge.nonce.clone(),
            })),
        })
    }

    // ── Responder side ────────────────────────────────────────

    /// Handle an authentication request whose `AuthHello` was already read.
    ///
    /// Issues the challenge, verifies the echoed nonce and HMAC, and sends
    /// the verdict. Every check failure is reported to the peer before the
    /// local error surfaces.
    pub fn respond_to_hello<T: Transport>(
        &self,
        io: &mut MessageIo<T>,
        hello: &AuthHello,
    ) -> Result<()> {
        if let Err(e) = self.verify_hello(hello) {
            io.send_error(&e);
            return Err(e);
        }

        let nonce = generate_nonce()?;
        let function = default_function();

        io.send_message(&AuthChallenge {
            method: HMAC_METHOD.to_string(),
            payload: Some(proto::pack(&HmacAuthChallenge {
                function: function as i32,
                nonce: nonce.clone(),
            })),
        })?;

        let expected = compute_hmac(function, &self.config.secret, &self.config.uuid, &nonce)?;

        let envelope = read_one(io)?;
        fail_on_wire_error(&envelope)?;
        let response: AuthResponse = expect_payload(&envelope)?;

        let payload = response
            .payload
            .as_ref()
            .ok_or_else(|| Error::Protocol("AuthResponse carries no payload".into()))?;
        let hmac_response: HmacAuthResponse = proto::unpack(payload)?;

        let nonce_ok = hmac_response.nonce.len() == nonce.len()
            && openssl::memcmp::eq(&hmac_response.nonce, &nonce);
        let hmac_ok = hmac_response.hmac.len() == expected.len()
            && openssl::memcmp::eq(&hmac_response.hmac, &expected);

        if !nonce_ok || !hmac_ok {
            let reason = if nonce_ok {
                "received HMAC is incorrect"
            } else {
                "received nonce is not the same as what was sent"
            };
            warn!("auth: {reason}");

            io.send_message(&AuthState {
                success: false,
                error_details: reason.to_string(),
            })?;
            return Err(Error::Protocol(reason.to_string()));
        }

        io.send_message(&AuthState {
            success: true,
            error_details: String::new(),
        })?;
        debug!("peer {} authenticated", self.config.uuid);
        Ok(())
    }

    /// Check the hello's UUID and method list, in that order.
    fn verify_hello(&self, hello: &AuthHello) -> Result<()> {
        if hello.uuid.as_slice() != self.config.uuid.as_bytes() {
            let received = Uuid::from_slice(&hello.uuid)
                .map_or_else(|_| format!("{} bytes", hello.uuid.len()), |u| u.to_string());
            return Err(Error::Protocol(format!(
                "received UUID: {received}, expected {}",
                self.config.uuid
            )));
        }

        if !hello
            .supported_methods
            .iter()
            .any(|method| method == HMAC_METHOD)
        {
            return Err(Error::Protocol(format!(
                "could not find a supported authentication method (expected {HMAC_METHOD})"
            )));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handshake read helpers
// ---------------------------------------------------------------------------

/// Block until one framed message arrives, tolerating datagram receive
/// timeouts up to a bound.
fn read_one<T: Transport>(io: &mut MessageIo<T>) -> Result<proto::Message> {
    for _ in 0..READ_ATTEMPTS {
        let mut slot = None;
        let got = io.read_message(|envelope| {
            slot = Some(envelope);
            Ok(())
        })?;
        if got {
            return slot.ok_or_else(|| Error::Protocol("reader lost the envelope".into()));
        }
    }

    Err(Error::Protocol(
        "timed out waiting for a handshake message".into(),
    ))
}

/// Convert a wire `Error` payload into a local protocol error.
fn fail_on_wire_error(envelope: &proto::Message) -> Result<()> {
    if proto::payload_type(envelope) == WireError::type_url() {
        let err: WireError = proto::unpack(
            envelope
                .payload
                .as_ref()
                .ok_or_else(|| Error::Protocol("empty Error payload".into()))?,
        )?;
        return Err(Error::Protocol(format!(
            "received error from peer: {}",
            err.description
        )));
    }
    Ok(())
}

/// Unpack the envelope's payload as `M`, or fail naming what arrived.
fn expect_payload<M: ProtocolMessage>(envelope: &proto::Message) -> Result<M> {
    let payload = envelope
        .payload
        .as_ref()
        .ok_or_else(|| Error::Protocol("message carries no payload".into()))?;

    if payload.type_url != M::type_url() {
        return Err(Error::Protocol(format!(
            "received unexpected message type '{}'; expected Error or {}",
            payload.type_url,
            M::type_url()
        )));
    }

    proto::unpack(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_is_deterministic() {
        let uuid = Uuid::from_bytes([7u8; 16]);
        let nonce = [42u8; NONCE_LEN];

        let a = compute_hmac(HashFunction::Sha1, b"hunter2", &uuid, &nonce).unwrap();
        let b = compute_hmac(HashFunction::Sha1, b"hunter2", &uuid, &nonce).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
    }

    #[test]
    fn hmac_depends_on_uuid_and_secret_and_nonce() {
        let uuid = Uuid::from_bytes([7u8; 16]);
        let other_uuid = Uuid::from_bytes([8u8; 16]);
        let nonce = [42u8; NONCE_LEN];
        let other_nonce = [43u8; NONCE_LEN];

        let base = compute_hmac(HashFunction::Sha1, b"hunter2", &uuid, &nonce).unwrap();
        assert_ne!(
            base,
            compute_hmac(HashFunction::Sha1, b"hunter2", &other_uuid, &nonce).unwrap()
        );
        assert_ne!(
            base,
            compute_hmac(HashFunction::Sha1, b"wrong", &uuid, &nonce).unwrap()
        );
        assert_ne!(
            base,
            compute_hmac(HashFunction::Sha1, b"hunter2", &uuid, &other_nonce).unwrap()
        );
    }

    #[test]
    fn whirlpool_hmac_when_available() {
        if MessageDigest::from_nid(Nid::WHIRLPOOL).is_none() {
            return; // legacy digest not present in this build
        }

        let uuid = Uuid::from_bytes([1u8; 16]);
        let nonce = [9u8; NONCE_LEN];
        let mac = compute_hmac(HashFunction::Whirlpool, b"secret", &uuid, &nonce).unwrap();
        assert_eq!(mac.len(), 64);
    }

    #[test]
    fn nonces_are_fresh() {
        let a = generate_nonce().unwrap();
        let b = generate_nonce().unwrap();
        assert_eq!(a.len(), NONCE_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn verify_hello_rejects_wrong_uuid() {
        let auth = HmacAuthenticator::new(AuthConfig::responder(
            Uuid::from_bytes([1u8; 16]),
            b"secret".to_vec(),
        ));

        let hello = AuthHello {
            uuid: vec![2u8; 16],
            supported_methods: vec![HMAC_METHOD.into()],
        };
        assert!(matches!(
            auth.verify_hello(&hello),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn verify_hello_rejects_unknown_methods() {
        let uuid = Uuid::from_bytes([1u8; 16]);
        let auth = HmacAuthenticator::new(AuthConfig::responder(uuid, b"secret".to_vec()));

        let hello = AuthHello {
            uuid: uuid.as_bytes().to_vec(),
            supported_methods: vec!["example.org.auth.none".into()],
        };
        assert!(matches!(
            auth.verify_hello(&hello),
            Err(Error::Protocol(_))
        ));
    }
}
