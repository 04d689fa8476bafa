//! Fuzz target: TXT blob parser.
//!
//! The parser must consume any input without panicking, and re-encoding a
//! parsed dictionary must parse back to the same dictionary.
//!
//! cargo fuzz run fuzz_txt_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

use lichtenstein_client::mdns::TxtDictionary;

fuzz_target!(|data: &[u8]| {
    let parsed = TxtDictionary::parse(data);

    // encode/parse reaches a fixed point after the first normalisation.
    let reparsed = TxtDictionary::parse(&parsed.encode());
    assert_eq!(parsed, reparsed);
});
