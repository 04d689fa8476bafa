//! Shared test fixtures: in-memory transports and throwaway certificates.
#![allow(dead_code)] // not every test crate uses every fixture

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};

use lichtenstein_client::io::Transport;
use lichtenstein_client::{Error, Result};

// ---------------------------------------------------------------------------
// In-memory duplex transport
// ---------------------------------------------------------------------------

/// One end of an in-memory duplex channel implementing [`Transport`].
///
/// Reads block up to a short timeout and then report "nothing available",
/// mirroring the datagram receive-timeout behaviour.
pub struct DuplexTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    closed: bool,
    /// Everything this end has written, for assertions and replay tests.
    pub sent_log: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Create a connected pair of transports.
pub fn duplex_pair() -> (DuplexTransport, DuplexTransport) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();

    let make = |tx, rx| DuplexTransport {
        tx,
        rx,
        buffer: Vec::new(),
        closed: false,
        sent_log: Arc::new(Mutex::new(Vec::new())),
    };

    (make(a_tx, a_rx), make(b_tx, b_rx))
}

impl Transport for DuplexTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }

        if self.buffer.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(250)) {
                Ok(bytes) => self.buffer.extend_from_slice(&bytes),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    // Drain what is left, then report closure.
                    if self.buffer.is_empty() {
                        self.closed = true;
                        return Err(Error::SessionClosed);
                    }
                }
            }
        }

        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        self.sent_log
            .lock()
            .expect("sent log lock poisoned")
            .push(data.to_vec());
        self.tx
            .send(data.to_vec())
            .map_err(|_| Error::SessionClosed)?;
        Ok(data.len())
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

// ---------------------------------------------------------------------------
// Throwaway certificates
// ---------------------------------------------------------------------------

/// Write a fresh self-signed certificate and key under a temp directory.
/// Returns (cert_path, key_path, dir) — keep `dir` alive for the test.
pub fn make_self_signed_cert(tag: &str) -> (PathBuf, PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!(
        "licht-test-{tag}-{}-{:?}",
        std::process::id(),
        std::thread::current().id()
    ));
    fs::create_dir_all(&dir).expect("create cert dir");

    let rsa = Rsa::generate(2048).expect("generate key");
    let key = PKey::from_rsa(rsa).expect("wrap key");

    let mut name = X509NameBuilder::new().expect("name builder");
    name.append_entry_by_text("CN", "localhost").expect("CN");
    let name = name.build();

    let not_before = Asn1Time::days_from_now(0).expect("not before");
    let not_after = Asn1Time::days_from_now(7).expect("not after");

    let mut builder = X509::builder().expect("x509 builder");
    builder.set_version(2).expect("version");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(&name).expect("issuer");
    builder.set_pubkey(&key).expect("pubkey");
    builder.set_not_before(&not_before).expect("not before");
    builder.set_not_after(&not_after).expect("not after");

    let serial = {
        let mut bn = BigNum::new().expect("bignum");
        bn.rand(64, MsbOption::MAYBE_ZERO, false).expect("serial");
        bn.to_asn1_integer().expect("serial asn1")
    };
    builder.set_serial_number(&serial).expect("serial set");

    builder.sign(&key, MessageDigest::sha256()).expect("sign");
    let cert = builder.build();

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    fs::write(&cert_path, cert.to_pem().expect("cert pem")).expect("write cert");
    fs::write(&key_path, key.private_key_to_pem_pkcs8().expect("key pem")).expect("write key");

    (cert_path, key_path, dir)
}
