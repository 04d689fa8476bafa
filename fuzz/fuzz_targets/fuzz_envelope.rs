//! Fuzz target: envelope and payload decoding.
//!
//! Arbitrary bytes must never panic the protobuf layer, and a payload type
//! mismatch must always surface as an error rather than a bogus decode.
//!
//! cargo fuzz run fuzz_envelope

#![no_main]

use libfuzzer_sys::fuzz_target;
use prost::Message as _;

use lichtenstein_client::proto::{self, AuthHello};

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = proto::Message::decode(data) else {
        return;
    };

    let type_url = proto::payload_type(&envelope).to_string();

    if let Some(payload) = envelope.payload {
        let result: lichtenstein_client::Result<AuthHello> = proto::unpack(&payload);
        if result.is_ok() {
            // A successful unpack implies the type URL matched exactly.
            assert_eq!(type_url, "type.googleapis.com/lichtenstein.protocol.AuthHello");
        }
    }
});
