//! Fuzz target: framed message reader.
//!
//! Drives arbitrary byte streams through `MessageIo::read_message` and
//! asserts it never panics and never hands a caller an envelope from a
//! malformed stream without the version gate.
//!
//! cargo fuzz run fuzz_frame_reader

#![no_main]

use libfuzzer_sys::fuzz_target;

use lichtenstein_client::io::Transport;
use lichtenstein_client::protocol::PROTOCOL_VERSION;
use lichtenstein_client::protocol::message_io::MessageIo;
use lichtenstein_client::{Error, Result};

/// Minimal transport serving a fixed byte buffer.
struct ByteTransport {
    data: Vec<u8>,
    offset: usize,
}

impl Transport for ByteTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.data[self.offset..];
        if remaining.is_empty() {
            return Err(Error::SessionClosed);
        }
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(data.len())
    }

    fn pending(&self) -> usize {
        self.data.len() - self.offset
    }

    fn close(&mut self) {}
}

fuzz_target!(|data: &[u8]| {
    let mut io = MessageIo::new(ByteTransport {
        data: data.to_vec(),
        offset: 0,
    });

    // Keep consuming frames until the stream errors or runs dry; any
    // envelope that reaches the callback must have passed the version gate.
    loop {
        let result = io.read_message(|envelope| {
            assert_eq!(envelope.version, PROTOCOL_VERSION);
            Ok(())
        });
        match result {
            Ok(true) => continue,
            Ok(false) | Err(_) => break,
        }
    }
});
