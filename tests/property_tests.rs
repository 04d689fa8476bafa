//! Property tests for the wire codec, HMAC primitives, and backoff policy.

mod common;

use std::time::Duration;

use proptest::prelude::*;
use uuid::Uuid;

use common::duplex_pair;
use lichtenstein_client::mdns::TxtDictionary;
use lichtenstein_client::node::backoff_delay;
use lichtenstein_client::proto::{self, HashFunction, WireError};
use lichtenstein_client::protocol::auth::compute_hmac;
use lichtenstein_client::protocol::message_io::MessageIo;

// ── Framing ───────────────────────────────────────────────────

proptest! {
    /// Every serialised message decodes back to itself, and exactly one
    /// frame is consumed per read.
    #[test]
    fn framing_round_trip(descriptions in proptest::collection::vec(".{0,64}", 1..8)) {
        let (a, b) = duplex_pair();
        let mut tx = MessageIo::new(a);
        let mut rx = MessageIo::new(b);

        for description in &descriptions {
            tx.send_message(&WireError { description: description.clone() }).unwrap();
        }

        for description in &descriptions {
            let mut slot = None;
            let got = rx.read_message(|envelope| { slot = Some(envelope); Ok(()) }).unwrap();
            prop_assert!(got);

            let envelope = slot.unwrap();
            let err: WireError = proto::unpack(envelope.payload.as_ref().unwrap()).unwrap();
            prop_assert_eq!(&err.description, description);
        }
    }

    /// A frame truncated anywhere before its declared end is a protocol
    /// error, never a partial message.
    #[test]
    fn truncated_frames_never_decode(cut in 1usize..40) {
        let (a, b) = duplex_pair();
        let mut tx = MessageIo::new(a);
        tx.send_message(&WireError { description: "0123456789012345678901234567890123456789".into() }).unwrap();

        let frames = tx.into_inner().sent_log.lock().unwrap().clone();
        let frame = &frames[0];
        prop_assume!(cut < frame.len());

        use lichtenstein_client::io::Transport;
        let (mut feeder, consumer) = duplex_pair();
        feeder.write(&frame[..frame.len() - cut]).unwrap();
        drop(feeder);
        drop(b);

        let mut rx = MessageIo::new(consumer);
        let result = rx.read_message(|_| Ok(()));
        prop_assert!(result.is_err());
    }
}

// ── HMAC ──────────────────────────────────────────────────────

proptest! {
    /// HMAC is a pure function of (function, secret, uuid, nonce).
    #[test]
    fn hmac_is_pure(
        secret in proptest::collection::vec(any::<u8>(), 1..64),
        uuid_bytes in proptest::array::uniform16(any::<u8>()),
        nonce in proptest::collection::vec(any::<u8>(), 64..=64),
    ) {
        let uuid = Uuid::from_bytes(uuid_bytes);
        let a = compute_hmac(HashFunction::Sha1, &secret, &uuid, &nonce).unwrap();
        let b = compute_hmac(HashFunction::Sha1, &secret, &uuid, &nonce).unwrap();
        prop_assert_eq!(a, b);
    }

    /// Any single-byte perturbation of the nonce changes the digest.
    #[test]
    fn hmac_nonce_sensitivity(
        secret in proptest::collection::vec(any::<u8>(), 1..32),
        nonce in proptest::collection::vec(any::<u8>(), 64..=64),
        flip in 0usize..64,
    ) {
        let uuid = Uuid::from_bytes([9u8; 16]);
        let base = compute_hmac(HashFunction::Sha1, &secret, &uuid, &nonce).unwrap();

        let mut tampered = nonce.clone();
        tampered[flip] ^= 0x01;
        let other = compute_hmac(HashFunction::Sha1, &secret, &uuid, &tampered).unwrap();
        prop_assert_ne!(base, other);
    }
}

// ── TXT codec ─────────────────────────────────────────────────

proptest! {
    /// encode → parse is the identity for well-formed dictionaries.
    #[test]
    fn txt_round_trip(
        entries in proptest::collection::btree_map(
            "[a-z][a-z0-9_-]{0,8}",
            "[ -<>-~]{0,20}", // printable, no '='
            0..6,
        )
    ) {
        let mut txt = TxtDictionary::new();
        for (key, value) in &entries {
            txt.set(key.clone(), value.clone());
        }

        let parsed = TxtDictionary::parse(&txt.encode());
        prop_assert_eq!(parsed, txt);
    }

    /// The parser consumes arbitrary input without panicking.
    #[test]
    fn txt_parse_total(blob in proptest::collection::vec(any::<u8>(), 0..256)) {
        let _ = TxtDictionary::parse(&blob);
    }
}

// ── Backoff ───────────────────────────────────────────────────

proptest! {
    /// The verification retry delay always lands in the jittered window and
    /// never exceeds the cap.
    #[test]
    fn backoff_within_bounds(attempt in any::<u32>()) {
        let delay = backoff_delay(attempt);
        let nominal = (2f64.powi(attempt.min(16) as i32)).min(60.0);

        prop_assert!(delay >= Duration::from_secs_f64(nominal * 0.5));
        prop_assert!(delay < Duration::from_secs_f64(nominal * 1.5));
        prop_assert!(delay < Duration::from_secs(90));
    }
}
