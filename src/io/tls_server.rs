//! Stream TLS server for the node API.
//!
//! Accepts on a pre-bound TCP listener and wraps each connection in a TLS
//! session. The PEM certificate and private key are loaded at construction
//! and validated against each other; a mismatch is a configuration error
//! before any client is accepted.
//!
//! The listener runs non-blocking and is polled via [`TlsServer::try_accept`]
//! so the accept loop can observe a shutdown request; accepted sockets are
//! switched back to blocking before the handshake.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;

use log::debug;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslMode};

use crate::error::{Error, Result};
use crate::io::SecureSession;

/// An accepted, handshake-complete client.
pub struct AcceptedClient {
    pub session: SecureSession<TcpStream>,
    pub addr: SocketAddr,
    /// Socket handle kept for cross-thread teardown: shutting it down
    /// unblocks a reader thread without touching the SSL state.
    pub teardown: TcpStream,
}

pub struct TlsServer {
    listener: TcpListener,
    ctx: SslContext,
}

impl TlsServer {
    /// Wrap a listening socket with a TLS context loaded from PEM files.
    pub fn new(listener: TcpListener, cert_path: &Path, key_path: &Path) -> Result<Self> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
        builder.set_mode(SslMode::AUTO_RETRY);
        load_cert_and_key(&mut builder, cert_path, key_path)?;

        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            ctx: builder.build(),
        })
    }

    /// Local address of the listening socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Poll for a pending connection and complete the TLS handshake.
    ///
    /// Returns `Ok(None)` when nothing is waiting. Per-accept failures are
    /// returned to the caller, which logs and keeps accepting; only a dead
    /// listener ends the accept loop.
    pub fn try_accept(&self) -> Result<Option<AcceptedClient>> {
        let (stream, addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        debug!("accepted TCP connection from {addr}");

        // The handshake and session I/O are blocking; only the listener
        // polls.
        stream.set_nonblocking(false)?;
        let teardown = stream.try_clone()?;

        let ssl = Ssl::new(&self.ctx)?;
        let ssl_stream = ssl
            .accept(stream)
            .map_err(|e| Error::Ssl(format!("TLS accept from {addr} failed: {e}")))?;

        Ok(Some(AcceptedClient {
            session: SecureSession::new(ssl_stream, addr.to_string()),
            addr,
            teardown,
        }))
    }
}

/// Load a PEM certificate/private-key pair into a context, verifying that
/// the key matches the certificate.
pub(crate) fn load_cert_and_key(
    builder: &mut SslContextBuilder,
    cert_path: &Path,
    key_path: &Path,
) -> Result<()> {
    builder
        .set_certificate_chain_file(cert_path)
        .map_err(|e| Error::Config(format!("could not load certificate {cert_path:?}: {e}")))?;
    builder
        .set_private_key_file(key_path, SslFiletype::PEM)
        .map_err(|e| Error::Config(format!("could not load private key {key_path:?}: {e}")))?;
    builder
        .check_private_key()
        .map_err(|e| Error::Config(format!("private key does not match certificate: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_is_config_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let result = TlsServer::new(
            listener,
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
