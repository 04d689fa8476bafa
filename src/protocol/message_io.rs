//! Framed message IO over a secure transport.
//!
//! Wire format, identical on TLS and DTLS:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────────┐
//! │ length (u32 BE)  │ payload: protobuf Message bytes  │
//! └──────────────────┴──────────────────────────────────┘
//! ```
//!
//! The framing is deliberately trivial so boundaries survive record
//! coalescing and the reader can pre-allocate. The protocol version lives in
//! the envelope, not the header, so the envelope can evolve without
//! reframing.

use log::{debug, error, warn};
use prost::Message as _;

use crate::error::{Error, Result};
use crate::io::Transport;
use crate::proto::{self, ProtocolMessage};
use crate::protocol::PROTOCOL_VERSION;

/// Wire header size: the big-endian payload length.
const HEADER_LEN: usize = 4;

/// Upper bound on a declared payload length; protects the reader's
/// pre-allocation from hostile headers.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Read granularity; large enough for a whole TLS record or DTLS datagram.
const READ_CHUNK: usize = 16 * 1024;

/// Framed protobuf IO over any [`Transport`].
pub struct MessageIo<T: Transport> {
    transport: T,
    /// Bytes past the last consumed frame, carried into the next read so a
    /// coalesced record never desynchronises the stream.
    carry: Vec<u8>,
}

impl<T: Transport> MessageIo<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            carry: Vec::new(),
        }
    }

    /// Access the underlying transport (for `close`/`pending`).
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    // ── Sending ───────────────────────────────────────────────

    /// Serialise `payload` inside a versioned envelope and write the
    /// length-prefixed frame in a single call.
    ///
    /// A short write means the session is unusable; the frame is failed
    /// outright rather than retried.
    pub fn send_message<M: ProtocolMessage>(&mut self, payload: &M) -> Result<()> {
        self.send_any(proto::pack(payload))?;
        debug!("sent {}", M::type_url());
        Ok(())
    }

    /// Send an already-packed payload inside a versioned envelope.
    ///
    /// The type-erased twin of [`send_message`](Self::send_message), used by
    /// dispatch code that works in terms of `Any` payloads.
    pub fn send_any(&mut self, payload: prost_types::Any) -> Result<()> {
        let envelope = proto::Message {
            version: PROTOCOL_VERSION,
            payload: Some(payload),
        };

        let body = envelope.encode_to_vec();
        let length = u32::try_from(body.len()).map_err(|_| {
            Error::Protocol(format!("message of {} bytes exceeds framing", body.len()))
        })?;

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&length.to_be_bytes());
        frame.extend_from_slice(&body);

        let written = self.transport.write(&frame)?;
        if written != frame.len() {
            error!(
                "couldn't write full message (wrote {written}, but total is {})",
                frame.len()
            );
            return Err(Error::Protocol(format!(
                "short write: {written} of {} bytes",
                frame.len()
            )));
        }
        Ok(())
    }

    /// Package an error as a wire `Error` message and emit it.
    ///
    /// Secondary transmission failures are swallowed; there is nothing
    /// useful left to do with them.
    pub fn send_error(&mut self, e: &Error) {
        let report = proto::WireError {
            description: e.to_string(),
        };

        if let Err(send_err) = self.send_message(&report) {
            warn!("failed to send error alert: {send_err}");
        }
    }

    // ── Receiving ─────────────────────────────────────────────

    /// Read exactly one framed message and hand the decoded envelope to
    /// `success`.
    ///
    /// Returns `Ok(false)` without invoking the callback when nothing was
    /// available within the transport's receive timeout (datagram sessions
    /// only). Short reads, oversized declarations, undecodable payloads and
    /// version mismatches are protocol errors; exactly one frame is consumed
    /// per successful call, so a version mismatch does not desynchronise the
    /// stream.
    pub fn read_message<F>(&mut self, success: F) -> Result<bool>
    where
        F: FnOnce(proto::Message) -> Result<()>,
    {
        // Reads pull whole records: datagram sessions deliver a frame per
        // record, and a partial chunk is topped up below.
        let mut data = std::mem::take(&mut self.carry);
        let mut scratch = vec![0u8; READ_CHUNK];

        if data.is_empty() {
            let n = self.transport.read(&mut scratch)?;
            if n == 0 {
                return Ok(false);
            }
            data.extend_from_slice(&scratch[..n]);
        }

        while data.len() < HEADER_LEN {
            self.top_up(&mut data, &mut scratch, HEADER_LEN)?;
        }

        let length =
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        debug!("message contains {length} more bytes");

        if length > MAX_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "declared payload of {length} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit"
            )));
        }

        let total = HEADER_LEN + length;
        while data.len() < total {
            self.top_up(&mut data, &mut scratch, total)?;
        }

        // Anything past this frame belongs to the next one.
        self.carry = data.split_off(total);

        let envelope = proto::Message::decode(&data[HEADER_LEN..])?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "invalid protocol version (wire message is version 0x{:x}, \
                 whereas the protocol lib is 0x{:x})",
                envelope.version, PROTOCOL_VERSION
            )));
        }

        success(envelope)?;
        Ok(true)
    }

    /// Read more bytes toward `target`; a quiet receive window mid-frame
    /// means the peer stopped short of the declared length.
    fn top_up(&mut self, data: &mut Vec<u8>, scratch: &mut [u8], target: usize) -> Result<()> {
        let n = self.transport.read(scratch)?;
        if n == 0 {
            return Err(Error::Protocol(format!(
                "expected to read {target} bytes, got {} bytes instead",
                data.len()
            )));
        }
        data.extend_from_slice(&scratch[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::Transport;
    use crate::proto::AuthState;

    /// In-memory transport: writes append to an output buffer, reads drain
    /// a preloaded input buffer.
    struct BufferTransport {
        input: Vec<u8>,
        output: Vec<u8>,
        closed: bool,
    }

    impl BufferTransport {
        fn new(input: Vec<u8>) -> Self {
            Self {
                input,
                output: Vec::new(),
                closed: false,
            }
        }
    }

    impl Transport for BufferTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.closed {
                return Err(Error::SessionClosed);
            }
            let n = buf.len().min(self.input.len());
            buf[..n].copy_from_slice(&self.input[..n]);
            self.input.drain(..n);
            Ok(n)
        }

        fn write(&mut self, data: &[u8]) -> Result<usize> {
            if self.closed {
                return Err(Error::SessionClosed);
            }
            self.output.extend_from_slice(data);
            Ok(data.len())
        }

        fn pending(&self) -> usize {
            self.input.len()
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn frame_of(payload: &impl ProtocolMessage) -> Vec<u8> {
        let mut io = MessageIo::new(BufferTransport::new(Vec::new()));
        io.send_message(payload).unwrap();
        io.into_inner().output
    }

    #[test]
    fn send_then_read_round_trip() {
        let state = AuthState {
            success: true,
            error_details: String::new(),
        };

        let mut io = MessageIo::new(BufferTransport::new(frame_of(&state)));
        let consumed = io
            .read_message(|envelope| {
                assert_eq!(envelope.version, PROTOCOL_VERSION);
                let got: AuthState = proto::unpack(envelope.payload.as_ref().unwrap()).unwrap();
                assert_eq!(got, state);
                Ok(())
            })
            .unwrap();
        assert!(consumed);
        assert_eq!(io.transport_mut().pending(), 0);
    }

    #[test]
    fn empty_input_reads_nothing() {
        let mut io = MessageIo::new(BufferTransport::new(Vec::new()));
        let consumed = io.read_message(|_| panic!("callback must not run")).unwrap();
        assert!(!consumed);
    }

    #[test]
    fn truncated_frame_is_protocol_error() {
        let mut frame = frame_of(&AuthState {
            success: false,
            error_details: "nope".into(),
        });
        frame.truncate(frame.len() - 3);

        let mut io = MessageIo::new(BufferTransport::new(frame));
        let result = io.read_message(|_| panic!("callback must not run"));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn hostile_length_is_rejected_before_allocation() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        frame.extend_from_slice(&[0u8; 100]);

        let mut io = MessageIo::new(BufferTransport::new(frame));
        let result = io.read_message(|_| panic!("callback must not run"));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn version_mismatch_consumes_exactly_one_frame() {
        use prost::Message as _;

        // Hand-build an envelope with the wrong version, then append a
        // valid frame behind it.
        let bad = proto::Message {
            version: PROTOCOL_VERSION ^ 0xFF,
            payload: Some(proto::pack(&AuthState {
                success: true,
                error_details: String::new(),
            })),
        };
        let bad_body = bad.encode_to_vec();

        let mut input = Vec::new();
        input.extend_from_slice(&(bad_body.len() as u32).to_be_bytes());
        input.extend_from_slice(&bad_body);
        let good = AuthState {
            success: true,
            error_details: String::new(),
        };
        input.extend_from_slice(&frame_of(&good));

        let mut io = MessageIo::new(BufferTransport::new(input));

        let result = io.read_message(|_| panic!("callback must not run"));
        assert!(matches!(result, Err(Error::Protocol(_))));

        // The stream is not desynchronised: the next read yields the good
        // frame.
        let consumed = io
            .read_message(|envelope| {
                let got: AuthState = proto::unpack(envelope.payload.as_ref().unwrap()).unwrap();
                assert_eq!(got, good);
                Ok(())
            })
            .unwrap();
        assert!(consumed);
    }

    #[test]
    fn send_error_writes_a_wire_error() {
        let mut io = MessageIo::new(BufferTransport::new(Vec::new()));
        io.send_error(&Error::Handler("node is already adopted".into()));

        let output = io.into_inner().output;
        let mut reader = MessageIo::new(BufferTransport::new(output));
        reader
            .read_message(|envelope| {
                let err: proto::WireError =
                    proto::unpack(envelope.payload.as_ref().unwrap()).unwrap();
                assert!(err.description.contains("already adopted"));
                Ok(())
            })
            .unwrap();
    }
}
