//! Datagram DTLS server with the RFC 6347 stateless cookie exchange.
//!
//! The realtime channel is point-to-point, so the server is a single-session
//! endpoint: [`DtlsServer::accept`] waits for the first ClientHello, runs the
//! cookie exchange against that peer, and yields the established session.
//!
//! Waiting is driven by the socket's receive timeout in short slices so a
//! shutdown request is honoured promptly and no CPU is burned while idle.
//!
//! ## Cookie algorithm
//!
//! A 16-byte secret is derived once per process from the cryptographic RNG.
//! The cookie for a peer is `HMAC-SHA1(secret, peer_port_be || peer_ip)`;
//! verification recomputes the HMAC and compares byte-exactly. The cookie
//! depends on nothing the peer can choose besides its own address.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use log::{debug, info, warn};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslVerifyMode};

use crate::error::{Error, Result};
use crate::io::tls_server::load_cert_and_key;
use crate::io::{SecureSession, UdpChannel};

/// Granularity of the accept wait; the shutdown flag is re-checked at this
/// interval.
const ACCEPT_POLL: Duration = Duration::from_millis(250);

/// Receive timeout applied once a peer is engaged.
const SESSION_RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Process-global cookie secret
// ---------------------------------------------------------------------------

static COOKIE_SECRET: OnceLock<[u8; 16]> = OnceLock::new();

/// The process cookie secret, generated on first use and immutable after.
fn cookie_secret() -> Result<&'static [u8; 16]> {
    if let Some(secret) = COOKIE_SECRET.get() {
        return Ok(secret);
    }

    let mut fresh = [0u8; 16];
    openssl::rand::rand_bytes(&mut fresh)?;

    // A concurrent initialiser may have won the race; either secret is fine,
    // the guard keeps exactly one.
    Ok(COOKIE_SECRET.get_or_init(|| fresh))
}

/// Compute the cookie for a peer address.
fn compute_cookie(peer: &SocketAddr) -> Result<Vec<u8>> {
    let secret = cookie_secret()?;

    let mut input = Vec::with_capacity(18);
    input.extend_from_slice(&peer.port().to_be_bytes());
    match peer.ip() {
        IpAddr::V4(ip) => input.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => input.extend_from_slice(&ip.octets()),
    }

    let key = PKey::hmac(secret)?;
    let mut signer = Signer::new(MessageDigest::sha1(), &key)?;
    signer.update(&input)?;
    Ok(signer.sign_to_vec()?)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct DtlsServer {
    sock: UdpSocket,
    ctx: SslContext,
    /// Peer currently in the cookie exchange; read by the cookie callbacks.
    pending_peer: Arc<Mutex<Option<SocketAddr>>>,
}

impl DtlsServer {
    /// Wrap a bound UDP socket with a DTLS context loaded from PEM files.
    pub fn new(sock: UdpSocket, cert_path: &Path, key_path: &Path) -> Result<Self> {
        let pending_peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        let mut builder = SslContextBuilder::new(SslMethod::dtls())?;
        builder.set_read_ahead(true);
        builder.set_options(SslOptions::COOKIE_EXCHANGE);
        builder.set_verify(SslVerifyMode::NONE);
        load_cert_and_key(&mut builder, cert_path, key_path)?;

        let generate_peer = Arc::clone(&pending_peer);
        builder.set_cookie_generate_cb(move |_ssl, buf| {
            let peer = generate_peer.lock().expect("pending peer lock poisoned");
            let Some(addr) = *peer else {
                // No exchange in progress; refuse to issue a cookie.
                return Ok(0);
            };
            match compute_cookie(&addr) {
                Ok(cookie) => {
                    let n = cookie.len().min(buf.len());
                    buf[..n].copy_from_slice(&cookie[..n]);
                    Ok(n)
                }
                Err(e) => {
                    warn!("cookie generation for {addr} failed: {e}");
                    Ok(0)
                }
            }
        });

        let verify_peer = Arc::clone(&pending_peer);
        builder.set_cookie_verify_cb(move |_ssl, cookie| {
            let peer = verify_peer.lock().expect("pending peer lock poisoned");
            let Some(addr) = *peer else {
                return false;
            };
            match compute_cookie(&addr) {
                Ok(expected) => {
                    cookie.len() == expected.len() && openssl::memcmp::eq(cookie, &expected)
                }
                Err(e) => {
                    warn!("cookie verification for {addr} failed: {e}");
                    false
                }
            }
        });

        Ok(Self {
            sock,
            ctx: builder.build(),
            pending_peer,
        })
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Wait for a peer, run the cookie exchange and handshake, and yield the
    /// established session.
    ///
    /// Returns `Ok(None)` when `shutdown` was raised before any peer
    /// arrived. Consumes the server: the realtime datagram endpoint serves
    /// exactly one peer.
    pub fn accept(self, shutdown: &AtomicBool) -> Result<Option<SecureSession<UdpChannel>>> {
        self.sock.set_read_timeout(Some(ACCEPT_POLL))?;

        let peer = loop {
            if shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let mut probe = [0u8; 1];
            match self.sock.peek_from(&mut probe) {
                Ok((_, peer)) => break peer,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };

        debug!("DTLS: first datagram from {peer}, starting cookie exchange");
        *self
            .pending_peer
            .lock()
            .expect("pending peer lock poisoned") = Some(peer);

        self.sock.connect(peer)?;
        self.sock.set_read_timeout(Some(SESSION_RECV_TIMEOUT))?;

        let ssl = Ssl::new(&self.ctx)?;
        let ssl_stream = ssl
            .accept(UdpChannel::new(self.sock))
            .map_err(|e| Error::Ssl(format!("DTLS accept from {peer} failed: {e}")))?;

        info!("DTLS session established with {peer}");
        Ok(Some(SecureSession::new(ssl_stream, peer.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_deterministic_per_peer() {
        let a: SocketAddr = "10.0.0.1:7422".parse().unwrap();
        let c1 = compute_cookie(&a).unwrap();
        let c2 = compute_cookie(&a).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 20); // SHA-1 digest size
    }

    #[test]
    fn cookie_differs_across_peers() {
        let a: SocketAddr = "10.0.0.1:7422".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:7422".parse().unwrap();
        let c: SocketAddr = "10.0.0.1:7423".parse().unwrap();

        let ca = compute_cookie(&a).unwrap();
        assert_ne!(ca, compute_cookie(&b).unwrap());
        assert_ne!(ca, compute_cookie(&c).unwrap());
    }

    #[test]
    fn missing_certificate_is_config_error() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let result = DtlsServer::new(
            sock,
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
