//! Outbound stream TLS client.
//!
//! Resolves the controller's host/port (any address family), opens a TCP
//! socket, and performs the TLS handshake with auto-retry enabled so
//! want-read/want-write renegotiation is invisible to the caller.

use std::net::{TcpStream, ToSocketAddrs};

use log::{debug, warn};
use openssl::ssl::{SslConnector, SslMethod, SslMode, SslVerifyMode};

use crate::error::{Error, Result};
use crate::io::SecureSession;

/// Peer-verification policy for outbound sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPeer {
    /// Validate the controller's certificate chain (default).
    Yes,
    /// Skip chain validation. Test rigs only.
    DangerouslyNo,
}

/// Connect to `host:port` and establish a TLS session.
pub fn connect(host: &str, port: u16, verify: VerifyPeer) -> Result<SecureSession<TcpStream>> {
    let stream = connect_tcp(host, port)?;

    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_mode(SslMode::AUTO_RETRY);

    if verify == VerifyPeer::DangerouslyNo {
        warn!("TLS client: peer verification disabled for {host}:{port}");
        builder.set_verify(SslVerifyMode::NONE);
    }

    let connector = builder.build();
    let mut config = connector.configure()?;
    if verify == VerifyPeer::DangerouslyNo {
        config.set_verify_hostname(false);
    }

    let ssl_stream = config
        .connect(host, stream)
        .map_err(|e| Error::Ssl(format!("TLS handshake with {host}:{port} failed: {e}")))?;

    debug!("TLS handshake with {host}:{port} complete");
    Ok(SecureSession::new(ssl_stream, format!("{host}:{port}")))
}

/// Resolve the hostname and connect a TCP socket to the first address that
/// accepts, regardless of family.
fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::system(format!("error resolving '{host}': {e}"), 0))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(e) => Error::from(e),
        None => Error::system(format!("'{host}' resolved to no addresses"), 0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_to_unresolvable_host_is_system_error() {
        let result = connect("host.invalid.", 7421, VerifyPeer::Yes);
        assert!(matches!(result, Err(Error::System { .. })));
    }

    #[test]
    fn connect_to_closed_port_is_system_error() {
        // Bind and immediately drop a listener so the port is closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect("127.0.0.1", port, VerifyPeer::Yes);
        assert!(matches!(result, Err(Error::System { .. })));
    }
}
