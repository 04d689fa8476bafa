//! Realtime channel client.
//!
//! Connects the DTLS datagram session, authenticates with the adoption
//! secret, and runs a reader thread that feeds every framed message to a
//! [`RealtimeSink`]. Frame semantics are the sink's business; the bundled
//! [`LogSink`] just logs what arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::io::tls_client::VerifyPeer;
use crate::io::{Transport, UdpChannel, dtls_client};
use crate::proto;
use crate::protocol::auth::{AuthConfig, HmacAuthenticator};
use crate::protocol::message_io::MessageIo;

/// Receives decoded realtime messages in session FIFO order.
pub trait RealtimeSink: Send {
    fn on_message(&mut self, message: &proto::Message);
}

/// Default sink: log and move on.
pub struct LogSink;

impl RealtimeSink for LogSink {
    fn on_message(&mut self, message: &proto::Message) {
        debug!(
            "received realtime message: {} ({} payload bytes)",
            proto::payload_type(message),
            message.payload.as_ref().map_or(0, |any| any.value.len())
        );
    }
}

/// Owns the realtime session's reader thread.
pub struct RealtimeClient {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RealtimeClient {
    /// Open the DTLS session, authenticate, and start the reader.
    ///
    /// Authentication failures surface to the caller; the reader thread only
    /// exists once the channel is live.
    pub fn connect(
        host: &str,
        port: u16,
        auth: AuthConfig,
        verify: VerifyPeer,
        sink: Box<dyn RealtimeSink>,
    ) -> Result<Self> {
        let session = dtls_client::connect(host, port, verify)?;
        let mut io = MessageIo::new(session);

        let authenticator = HmacAuthenticator::new(auth);
        if let Err(e) = authenticator.authenticate(&mut io) {
            error!("failed to authenticate realtime client: {e}");
            io.transport_mut().close();
            return Err(e);
        }
        debug!("successfully authenticated realtime client");

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("realtime-reader".into())
            .spawn(move || reader_loop(io, sink, &flag))
            .map_err(|e| Error::Config(format!("could not spawn realtime reader: {e}")))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the reader and close the session. The reader observes the flag
    /// within the datagram receive timeout.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("realtime reader thread panicked");
            }
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(
    mut io: MessageIo<crate::io::SecureSession<UdpChannel>>,
    mut sink: Box<dyn RealtimeSink>,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match io.read_message(|message| {
            sink.on_message(&message);
            Ok(())
        }) {
            // Either a dispatched message or a quiet receive window.
            Ok(_) => {}
            Err(Error::SessionClosed) => {
                debug!("realtime session closed");
                break;
            }
            Err(e @ (Error::Ssl(_) | Error::System { .. })) => {
                warn!("fatal error on realtime client: {e}");
                break;
            }
            // Framing or handler-level trouble is reported to the peer and
            // the stream continues.
            Err(e) => {
                warn!("error in realtime client: {e}");
                io.send_error(&e);
            }
        }
    }

    debug!("realtime client shutting down");
    io.transport_mut().close();
}
