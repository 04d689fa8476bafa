//! Secure transport layer — TLS stream and DTLS datagram sessions.
//!
//! Four entry points, symmetric in both flavours:
//!
//! - [`tls_client::connect`] / [`tls_server::TlsServer`] — stream TLS over TCP
//! - [`dtls_client::connect`] / [`dtls_server::DtlsServer`] — datagram DTLS
//!   over UDP
//!
//! Every accepted or connected endpoint is a [`SecureSession`] exposing the
//! byte-level [`Transport`] contract the message layer builds on. Sessions
//! exclusively own their socket and are closed exactly once.

pub mod dtls_client;
pub mod dtls_server;
pub mod tls_client;
pub mod tls_server;

use std::io::{self, Read, Write};
use std::net::UdpSocket;

use log::debug;
use openssl::ssl::{ErrorCode, ShutdownResult, SslStream};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Transport contract
// ---------------------------------------------------------------------------

/// Byte-oriented secure channel.
///
/// The message layer is generic over `Transport`, so control (TLS) and
/// realtime (DTLS) sessions share one framing and dispatch implementation.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes into `buf`.
    ///
    /// Returns the number of bytes actually read: `0` when nothing is
    /// available within the datagram receive timeout, or on a clean
    /// half-close. Once the session is closed, further reads fail with
    /// [`Error::SessionClosed`].
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write `data`, returning the number of bytes actually written.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Bytes immediately readable from the session buffer.
    fn pending(&self) -> usize;

    /// Clean shutdown. Idempotent.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Secure session over any Read + Write channel
// ---------------------------------------------------------------------------

/// A TLS or DTLS session bound to an underlying byte channel.
///
/// Owned by exactly one thread at a time; the SSL state is not safe for
/// concurrent use.
pub struct SecureSession<S: Read + Write> {
    stream: SslStream<S>,
    open: bool,
    /// Peer description for log lines.
    peer: String,
}

impl<S: Read + Write> SecureSession<S> {
    pub(crate) fn new(stream: SslStream<S>, peer: String) -> Self {
        Self {
            stream,
            open: true,
            peer,
        }
    }

    /// Whether the session has not yet been closed (locally or by the peer).
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Peer description (address or hostname:port).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Map an SSL I/O error to the transport error classes.
    ///
    /// Returns byte counts only on success; every failure is an explicit
    /// error or a documented zero.
    fn map_ssl_error(&mut self, e: &openssl::ssl::Error, op: &str) -> Error {
        match e.code() {
            ErrorCode::ZERO_RETURN => {
                // Peer sent close_notify; the session is finished.
                self.open = false;
                Error::SessionClosed
            }
            ErrorCode::SYSCALL => match e.io_error() {
                Some(io) => Error::system(
                    format!("{op} on session with {}: {io}", self.peer),
                    io.raw_os_error().unwrap_or(0),
                ),
                // Syscall error with nothing on the error queue is an
                // abrupt EOF from the peer.
                None => {
                    self.open = false;
                    Error::SessionClosed
                }
            },
            _ => Error::Ssl(format!("{op} failed: {e}")),
        }
    }
}

impl<S: Read + Write + Send> Transport for SecureSession<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::SessionClosed);
        }

        match self.stream.ssl_read(buf) {
            Ok(n) => Ok(n),
            // Nothing to consume within the receive window: a retryable
            // read, or a datagram receive timeout surfacing as a
            // would-block syscall.
            Err(e) if e.code() == ErrorCode::WANT_READ => Ok(0),
            Err(e) if is_receive_timeout(&e) => Ok(0),
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                self.open = false;
                Ok(0)
            }
            Err(e) => Err(self.map_ssl_error(&e, "read")),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(Error::SessionClosed);
        }

        match self.stream.ssl_write(data) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.map_ssl_error(&e, "write")),
        }
    }

    fn pending(&self) -> usize {
        self.stream.ssl().pending()
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        // Send close_notify; a Sent result means the peer's notify is still
        // outstanding, which is fine for a one-way teardown.
        match self.stream.shutdown() {
            Ok(ShutdownResult::Sent | ShutdownResult::Received) => {
                debug!("session with {} shut down cleanly", self.peer);
            }
            Err(e) => {
                debug!("shutdown of session with {} ignored error: {e}", self.peer);
            }
        }
    }
}

impl<S: Read + Write> Drop for SecureSession<S> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.stream.shutdown();
        }
    }
}

/// Whether an SSL error is a socket receive timeout (the 2-second DTLS
/// window elapsing) rather than a real failure.
fn is_receive_timeout(e: &openssl::ssl::Error) -> bool {
    e.code() == ErrorCode::SYSCALL
        && e.io_error().is_some_and(|io| {
            io.kind() == io::ErrorKind::WouldBlock || io.kind() == io::ErrorKind::TimedOut
        })
}

// ---------------------------------------------------------------------------
// UDP channel adapter
// ---------------------------------------------------------------------------

/// `Read`/`Write` adapter over a connected UDP socket, so a datagram socket
/// can back an [`SslStream`].
#[derive(Debug)]
pub struct UdpChannel {
    sock: UdpSocket,
}

impl UdpChannel {
    pub fn new(sock: UdpSocket) -> Self {
        Self { sock }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.sock
    }
}

impl Read for UdpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }
}

impl Write for UdpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
