//! Outbound datagram DTLS client for the realtime channel.
//!
//! Resolves the realtime endpoint, connects a UDP socket to it, applies the
//! 2-second receive timeout, and performs the DTLS handshake. Reads on the
//! resulting session return 0 when the timeout elapses with no datagram.

use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::{debug, warn};
use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslVerifyMode};

use crate::error::{Error, Result};
use crate::io::tls_client::VerifyPeer;
use crate::io::{SecureSession, UdpChannel};

/// Receive timeout applied to the datagram socket; bounds every blocking
/// read on the realtime session.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Connect to `host:port` and establish a DTLS session.
pub fn connect(host: &str, port: u16, verify: VerifyPeer) -> Result<SecureSession<UdpChannel>> {
    let sock = connect_udp(host, port)?;
    sock.set_read_timeout(Some(RECV_TIMEOUT))?;

    let mut builder = SslContextBuilder::new(SslMethod::dtls())?;
    builder.set_read_ahead(true);
    if verify == VerifyPeer::DangerouslyNo {
        warn!("DTLS client: peer verification disabled for {host}:{port}");
        builder.set_verify(SslVerifyMode::NONE);
    } else {
        builder.set_default_verify_paths()?;
        builder.set_verify(SslVerifyMode::PEER);
    }
    let ctx = builder.build();

    let ssl = Ssl::new(&ctx)?;
    let ssl_stream = ssl
        .connect(UdpChannel::new(sock))
        .map_err(|e| Error::Ssl(format!("DTLS handshake with {host}:{port} failed: {e}")))?;

    debug!("DTLS handshake with {host}:{port} complete");
    Ok(SecureSession::new(ssl_stream, format!("{host}:{port}")))
}

/// Resolve the hostname and connect a UDP socket to the first usable
/// address, matching its family on the local side.
fn connect_udp(host: &str, port: u16) -> Result<UdpSocket> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::system(format!("error resolving '{host}': {e}"), 0))?;

    let mut last_err = None;
    for addr in addrs {
        let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let sock = match UdpSocket::bind(bind_addr) {
            Ok(s) => s,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        match sock.connect(addr) {
            Ok(()) => return Ok(sock),
            Err(e) => {
                debug!("UDP connect to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(e) => Error::from(e),
        None => Error::system(format!("'{host}' resolved to no addresses"), 0),
    })
}
