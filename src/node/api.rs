//! Node API server — accept loop and per-connection handlers.
//!
//! A dedicated worker polls the TLS listener; every accepted session gets
//! its own handler thread that reads framed messages and dispatches them
//! through the handler registry by payload type URL. Handler-level failures
//! are reported to the peer and the session continues; protocol-level
//! failures are reported and the session closes. The accept loop logs
//! per-accept errors and keeps going.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::io::Transport;
use crate::io::tls_server::{AcceptedClient, TlsServer};
use crate::node::NodeHandle;
use crate::node::handlers;
use crate::proto;
use crate::protocol::message_io::MessageIo;

/// Accept-poll cadence; bounds shutdown latency of the accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Owns the listener thread and the per-connection handlers.
pub struct ApiServer {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ApiServer {
    /// Load the certificate, then start accepting on `listener`.
    pub fn start(
        node: NodeHandle,
        listener: TcpListener,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<Self> {
        let server = TlsServer::new(listener, cert_path, key_path)?;
        let local_addr = server.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name("api-accept".into())
            .spawn(move || accept_loop(&node, &server, &flag))
            .map_err(|e| Error::Config(format!("could not spawn accept loop: {e}")))?;

        Ok(Self {
            shutdown,
            thread: Some(thread),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and tear down every live session.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("accept loop thread panicked");
            }
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(node: &NodeHandle, server: &TlsServer, shutdown: &Arc<AtomicBool>) {
    // Handlers are owned by the accept loop and torn down when it exits.
    let mut clients: Vec<ClientHandler> = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        match server.try_accept() {
            Ok(Some(accepted)) => {
                info!("got new API client: {}", accepted.addr);
                match ClientHandler::spawn(node.clone(), accepted, Arc::clone(shutdown)) {
                    Ok(handler) => clients.push(handler),
                    Err(e) => error!("could not start client handler: {e}"),
                }
            }
            Ok(None) => {
                // Reap finished handlers while idle.
                clients.retain_mut(|client| !client.reap());
                thread::sleep(ACCEPT_POLL);
            }
            Err(Error::Ssl(e)) => error!("TLS error accepting client: {e}"),
            Err(Error::System { context, .. }) => {
                if shutdown.load(Ordering::SeqCst) {
                    debug!("listening socket was closed");
                    break;
                }
                error!("system error accepting client: {context}");
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => error!("error accepting client: {e}"),
        }
    }

    debug!("shutting down API, closing {} session(s)", clients.len());
    for mut client in clients {
        client.stop();
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

struct ClientHandler {
    shutdown: Arc<AtomicBool>,
    /// Socket-level handle used to unblock the reader from another thread.
    teardown: TcpStream,
    thread: Option<JoinHandle<()>>,
    peer: SocketAddr,
}

impl ClientHandler {
    fn spawn(
        node: NodeHandle,
        accepted: AcceptedClient,
        server_shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let AcceptedClient {
            session,
            addr,
            teardown,
        } = accepted;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let thread = thread::Builder::new()
            .name(format!("api-client-{addr}"))
            .spawn(move || {
                let mut io = MessageIo::new(session);
                reader_loop(&node, &mut io, &flag, &server_shutdown);
                debug!("shutting down API client for {addr}");
                io.transport_mut().close();
            })
            .map_err(|e| Error::Config(format!("could not spawn handler thread: {e}")))?;

        Ok(Self {
            shutdown,
            teardown,
            thread: Some(thread),
            peer: addr,
        })
    }

    /// True when the handler thread has already finished (peer hung up).
    fn reap(&mut self) -> bool {
        match &self.thread {
            Some(thread) if thread.is_finished() => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblocks a reader parked in a TLS read.
        let _ = self.teardown.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("handler thread for {} panicked", self.peer);
            }
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Service one session until the peer hangs up, a non-recoverable error
/// occurs, or shutdown is requested.
fn reader_loop<T: Transport>(
    node: &NodeHandle,
    io: &mut MessageIo<T>,
    shutdown: &AtomicBool,
    server_shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) && !server_shutdown.load(Ordering::SeqCst) {
        let mut slot = None;
        let received = io.read_message(|envelope| {
            slot = Some(envelope);
            Ok(())
        });

        let envelope = match received {
            Ok(true) => match slot {
                Some(envelope) => envelope,
                None => continue,
            },
            Ok(false) => continue,
            Err(Error::SessionClosed) => {
                debug!("connection was closed");
                break;
            }
            Err(e @ Error::Protocol(_)) => {
                error!("protocol error, closing connection: {e}");
                io.send_error(&e);
                break;
            }
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    error!("error reading from client: {e}");
                }
                break;
            }
        };

        match dispatch(node, &envelope, io) {
            Ok(()) => {}
            Err(e @ Error::Handler(_)) => {
                // Application-level refusal: tell the peer, keep serving.
                warn!("handler error: {e}");
                io.send_error(&e);
            }
            Err(e) => {
                error!("closing connection: {e}");
                io.send_error(&e);
                break;
            }
        }
    }
}

/// Look the payload's type URL up in the registry and run the handler.
fn dispatch<T: Transport>(
    node: &NodeHandle,
    envelope: &proto::Message,
    io: &mut MessageIo<T>,
) -> Result<()> {
    let type_url = proto::payload_type(envelope);

    let handler = handlers::lookup(type_url).ok_or_else(|| {
        Error::Protocol(format!("received unknown message of type {type_url}"))
    })?;

    let mut reply = IoReplySink { io };
    handler(node, envelope, &mut reply)
}

// ---------------------------------------------------------------------------
// Reply sink
// ---------------------------------------------------------------------------

/// Type-erased reply channel handed to request handlers.
pub trait ReplySink {
    fn send_any(&mut self, payload: prost_types::Any) -> Result<()>;
}

struct IoReplySink<'a, T: Transport> {
    io: &'a mut MessageIo<T>,
}

impl<T: Transport> ReplySink for IoReplySink<'_, T> {
    fn send_any(&mut self, payload: prost_types::Any) -> Result<()> {
        self.io.send_any(payload)
    }
}

/// Reply sink that records payloads; used by handler tests.
#[cfg(test)]
pub(crate) struct RecordingSink(pub Vec<prost_types::Any>);

#[cfg(test)]
impl ReplySink for RecordingSink {
    fn send_any(&mut self, payload: prost_types::Any) -> Result<()> {
        self.0.push(payload);
        Ok(())
    }
}
