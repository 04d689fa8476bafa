//! Node lifecycle — the top-level state machine.
//!
//! The node runs as a state machine on its own thread and owns every other
//! moving part: the mDNS advertisement, the API accept loop, the
//! authenticated control channel to the controller, and the realtime
//! datagram session.
//!
//! ```text
//!  START ──[adopted]──▶ VERIFY_ADOPT ──[ok]──▶ START_RT ──▶ IDLE
//!    │                       │  ▲                  │          ▲
//!    │                 [fail, backoff]        [fail]──────────┘
//!    │                       ▼  │
//!    └──[not adopted]──▶   IDLE ◀── external setNextState
//!
//!  Any state ──[stop()]──▶ SHUTDOWN
//! ```
//!
//! IDLE blocks on a condition variable; exactly one event is consumed per
//! wakeup, and spurious wakeups go back to waiting. Observers reading the
//! current state outside the machine's mutex see a possibly stale value and
//! must not depend on its freshness.

pub mod api;
pub mod handlers;
pub mod realtime;

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::io::tls_client::{self, VerifyPeer};
use crate::io::{SecureSession, Transport};
use crate::mdns::{Advertiser, SERVICE_TYPE, sd::MdnsAdvertiser};
use crate::protocol::auth::{AuthConfig, HmacAuthenticator};
use crate::protocol::message_io::MessageIo;
use crate::store::{DataStore, keys};

use api::ApiServer;
use realtime::{LogSink, RealtimeClient};

/// TXT `version` value advertised on the fabric.
const TXT_VERSION: &str = "0.1";

/// Backoff parameters for adoption verification retries.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

type ControlChannel = MessageIo<SecureSession<TcpStream>>;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// The node is in exactly one of these at any observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    Idle,
    VerifyAdopt,
    StartRt,
    Shutdown,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Idle => "IDLE",
            Self::VerifyAdopt => "VERIFY_ADOPT",
            Self::StartRt => "START_RT",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}

/// Verification retry delay: `min(base * 2^attempt, cap)` scaled by a
/// uniform jitter in `[0.5, 1.5)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = exponential.min(BACKOFF_CAP.as_secs_f64());
    let jitter = 0.5 + fastrand::f64();
    Duration::from_secs_f64(capped * jitter)
}

// ---------------------------------------------------------------------------
// Shared node state
// ---------------------------------------------------------------------------

struct StateCell {
    state: State,
    /// Raised by `set_next_state`; consumed (one per wakeup) by IDLE.
    wake: bool,
}

pub(crate) struct NodeCore {
    config: NodeConfig,
    store: Arc<dyn DataStore>,
    cell: Mutex<StateCell>,
    cond: Condvar,
    shutdown: AtomicBool,
    /// Authenticated control channel; lives for the node's lifetime once
    /// verification succeeds.
    control: Mutex<Option<ControlChannel>>,
    realtime: Mutex<Option<RealtimeClient>>,
    started_at: Instant,
}

impl NodeCore {
    fn verify_mode(&self) -> VerifyPeer {
        if self.config.danger_disable_verify {
            VerifyPeer::DangerouslyNo
        } else {
            VerifyPeer::Yes
        }
    }

    fn current_state(&self) -> State {
        self.cell.lock().expect("state lock poisoned").state
    }

    /// Set the next state and wake the machine from IDLE.
    fn set_next_state(&self, next: State) {
        debug!("requested change to state {}", next.name());
        {
            let mut cell = self.cell.lock().expect("state lock poisoned");
            cell.state = next;
            cell.wake = true;
        }
        self.cond.notify_one();
    }

    /// Internal transition taken by the machine itself; does not raise the
    /// wake flag.
    fn advance(&self, next: State) {
        let mut cell = self.cell.lock().expect("state lock poisoned");
        trace!(
            "state machine transition: {} -> {}",
            cell.state.name(),
            next.name()
        );
        cell.state = next;
    }

    fn is_adopted(&self) -> bool {
        self.store.get(keys::ADOPTION_VALID).as_deref() == Some("1")
    }

    /// Clear the adoption bit; called on every path that detects missing or
    /// rejected adoption state, before the error surfaces.
    fn invalidate_adoption(&self) {
        if let Err(e) = self.store.set(keys::ADOPTION_VALID, "0") {
            error!("could not invalidate adoption: {e}");
        }
    }

    /// Read a required store key, invalidating the adoption when it is
    /// missing.
    fn require_key(&self, key: &str) -> Result<String> {
        match self.store.get(key) {
            Some(value) => Ok(value),
            None => {
                error!("missing {key} in data store, invalidating adoption");
                self.invalidate_adoption();
                Err(Error::Store(format!("missing {key} in data store")))
            }
        }
    }

    fn require_port(&self, key: &str) -> Result<u16> {
        let raw = self.require_key(key)?;
        raw.parse::<u16>().map_err(|_| {
            error!("unparseable {key} '{raw}' in data store, invalidating adoption");
            self.invalidate_adoption();
            Error::Store(format!("unparseable {key} in data store"))
        })
    }

    /// Verify the stored adoption against the controller.
    ///
    /// Connects to the stored controller address, authenticates with the
    /// stored secret, and on success keeps the TLS session as the node's
    /// control channel. Every failure path invalidates the adoption before
    /// returning.
    fn verify_adoption(&self) -> Result<()> {
        let host = self.require_key(keys::SERVER_HOST)?;
        let port = self.require_port(keys::SERVER_PORT)?;

        let session = tls_client::connect(&host, port, self.verify_mode())?;
        let mut io = MessageIo::new(session);

        let secret = self.require_key(keys::ADOPTION_SECRET)?;

        let auth = HmacAuthenticator::new(AuthConfig::initiator(
            self.config.uuid,
            secret.into_bytes(),
        ));
        if let Err(e) = auth.authenticate(&mut io) {
            error!("controller rejected adoption token: {e}");
            self.invalidate_adoption();
            io.transport_mut().close();
            return Err(e);
        }

        info!("adoption verified with controller at {host}:{port}");
        *self.control.lock().expect("control lock poisoned") = Some(io);
        Ok(())
    }

    /// Bring up the realtime datagram session.
    fn start_realtime(&self) -> Result<()> {
        let host = self.require_key(keys::RT_HOST)?;
        let port = self.require_port(keys::RT_PORT)?;
        let secret = self.require_key(keys::ADOPTION_SECRET)?;

        let client = RealtimeClient::connect(
            &host,
            port,
            AuthConfig::initiator(self.config.uuid, secret.into_bytes()),
            self.verify_mode(),
            Box::new(LogSink),
        )?;

        *self.realtime.lock().expect("realtime lock poisoned") = Some(client);
        Ok(())
    }

    /// Sleep up to `duration`, returning early (true) when an external event
    /// or shutdown arrives.
    fn interruptible_sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cell = self.cell.lock().expect("state lock poisoned");

        loop {
            if cell.wake || self.shutdown.load(Ordering::SeqCst) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .cond
                .wait_timeout(cell, deadline - now)
                .expect("state lock poisoned");
            cell = next;
        }
    }
}

// ---------------------------------------------------------------------------
// Handle passed to request handlers
// ---------------------------------------------------------------------------

/// Narrow capability the API handlers get instead of the node itself.
#[derive(Clone)]
pub struct NodeHandle {
    core: Arc<NodeCore>,
}

impl NodeHandle {
    pub fn uuid(&self) -> Uuid {
        self.core.config.uuid
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.core.store
    }

    pub fn is_adopted(&self) -> bool {
        self.core.is_adopted()
    }

    /// Run adoption verification against the stored controller address.
    pub fn verify_adoption(&self) -> Result<()> {
        self.core.verify_adoption()
    }

    /// Ask the state machine to bring up the realtime channel.
    pub fn request_realtime_start(&self) {
        self.core.set_next_state(State::StartRt);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.core.started_at.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A full Lichtenstein network client.
///
/// Configure it, call [`start`](Self::start), and it advertises itself and
/// handles all fabric traffic on background threads until
/// [`stop`](Self::stop).
pub struct Node {
    core: Arc<NodeCore>,
    /// Injected before `start`; `None` selects the bundled mDNS backend.
    advertiser: Option<Box<dyn Advertiser>>,
    machine: Option<JoinHandle<()>>,
    api: Option<ApiServer>,
}

impl Node {
    /// Create a node from validated configuration and a data store.
    pub fn new(config: NodeConfig, store: Arc<dyn DataStore>) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            core: Arc::new(NodeCore {
                config,
                store,
                cell: Mutex::new(StateCell {
                    state: State::Start,
                    wake: false,
                }),
                cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
                control: Mutex::new(None),
                realtime: Mutex::new(None),
                started_at: Instant::now(),
            }),
            advertiser: None,
            machine: None,
            api: None,
        })
    }

    /// Replace the advertisement backend. Must be called before `start`.
    pub fn set_advertiser(&mut self, advertiser: Box<dyn Advertiser>) {
        self.advertiser = Some(advertiser);
    }

    /// Capability handed to request handlers and embedders.
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Current state of the machine. Stale the moment it is returned.
    pub fn current_state(&self) -> State {
        self.core.current_state()
    }

    /// Port the API actually listens on (useful with port 0 in tests).
    pub fn api_port(&self) -> Option<u16> {
        self.api.as_ref().map(|api| api.port())
    }

    /// Bind the API listener, register the built-in handlers, and launch the
    /// state machine.
    ///
    /// Configuration failures (bad certificate, unusable listen address)
    /// surface here, before any connection is accepted.
    pub fn start(&mut self) -> Result<()> {
        if self.machine.is_some() {
            return Ok(());
        }

        handlers::register_builtin_handlers()?;

        let bind = format!("{}:{}", self.core.config.listen_host, self.core.config.api_port);
        let listener = TcpListener::bind(&bind)
            .map_err(|e| Error::Config(format!("could not bind API listener on {bind}: {e}")))?;

        let api = ApiServer::start(
            self.handle(),
            listener,
            &self.core.config.cert_path,
            &self.core.config.key_path,
        )?;
        info!("API listening on {}", api.local_addr());
        self.api = Some(api);

        let advertiser: Box<dyn Advertiser> = match self.advertiser.take() {
            Some(advertiser) => advertiser,
            None => Box::new(MdnsAdvertiser::new(
                &handlers::local_hostname(),
                SERVICE_TYPE,
                self.core.config.api_port,
            )?),
        };

        let core = Arc::clone(&self.core);
        self.machine = Some(
            thread::Builder::new()
                .name("node-state-machine".into())
                .spawn(move || state_machine(&core, advertiser))
                .map_err(|e| Error::Config(format!("could not spawn state machine: {e}")))?,
        );

        Ok(())
    }

    /// Shut the node down: close connections, stop advertising, and join
    /// every worker. Idempotent.
    pub fn stop(&mut self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.set_next_state(State::Shutdown);

        if let Some(machine) = self.machine.take() {
            if machine.join().is_err() {
                error!("state machine thread panicked");
            }
        }

        if let Some(mut api) = self.api.take() {
            api.stop();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// The state machine itself
// ---------------------------------------------------------------------------

fn state_machine(core: &Arc<NodeCore>, mut advertiser: Box<dyn Advertiser>) {
    debug!("beginning mDNS advertisement");
    let txt = [
        ("version", TXT_VERSION.to_string()),
        ("type", "client".to_string()),
        ("uuid", core.config.uuid.to_string()),
    ];
    for (key, value) in &txt {
        if let Err(e) = advertiser.set_txt_record(key, value) {
            warn!("could not set TXT record {key}: {e}");
        }
    }
    if let Err(e) = advertiser.start_advertising() {
        warn!("mDNS advertisement unavailable: {e}");
    }

    let mut attempt: u32 = 0;

    loop {
        let state = core.current_state();
        trace!("state machine changed to: {}", state.name());

        match state {
            // Power-on: route on the persisted adoption status.
            State::Start => {
                if core.is_adopted() {
                    core.advance(State::VerifyAdopt);
                } else {
                    info!("node is not adopted; waiting for adoption");
                    core.advance(State::Idle);
                }
            }

            // Block until an event raises the wake flag; consume exactly
            // one event per wakeup.
            State::Idle => {
                let mut cell = core.cell.lock().expect("state lock poisoned");
                while !cell.wake {
                    cell = core.cond.wait(cell).expect("state lock poisoned");
                }
                cell.wake = false;
            }

            State::VerifyAdopt => match core.verify_adoption() {
                Ok(()) => {
                    attempt = 0;
                    core.advance(State::StartRt);
                }
                Err(e) => {
                    error!("failed to verify adoption: {e}");
                    if core.is_adopted() {
                        let delay = backoff_delay(attempt);
                        attempt = attempt.saturating_add(1);
                        warn!(
                            "retrying adoption verification in {:.1}s (attempt {attempt})",
                            delay.as_secs_f64()
                        );
                        // An external event or shutdown aborts the wait; the
                        // loop re-reads whatever state was requested.
                        let _ = core.interruptible_sleep(delay);
                    } else {
                        // Adoption state was lost; nothing left to retry.
                        attempt = 0;
                        core.advance(State::Idle);
                    }
                }
            },

            State::StartRt => {
                match core.start_realtime() {
                    Ok(()) => info!("realtime session established"),
                    Err(e) => error!("failed to start realtime session: {e}"),
                }
                core.advance(State::Idle);
            }

            State::Shutdown => break,
        }

        if core.shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    // Housekeeping: withdraw the advertisement, close the control channel,
    // and stop the realtime reader.
    debug!("shutting down mDNS advertisement");
    advertiser.stop_advertising();

    if let Some(mut control) = core
        .control
        .lock()
        .expect("control lock poisoned")
        .take()
    {
        control.transport_mut().close();
    }

    if let Some(mut realtime) = core
        .realtime
        .lock()
        .expect("realtime lock poisoned")
        .take()
    {
        realtime.stop();
    }

    debug!("state machine is done, bye bye");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for attempt in 0..20 {
            let nominal = (2f64.powi(attempt.min(16) as i32)).min(60.0);
            let delay = backoff_delay(attempt).as_secs_f64();
            assert!(
                delay >= nominal * 0.5 && delay < nominal * 1.5,
                "attempt {attempt}: {delay} outside [{}, {})",
                nominal * 0.5,
                nominal * 1.5
            );
        }
    }

    #[test]
    fn backoff_caps_at_sixty_seconds() {
        for attempt in [6, 10, 16, u32::MAX] {
            assert!(backoff_delay(attempt) < Duration::from_secs(90));
        }
    }

    #[test]
    fn state_names_are_stable() {
        assert_eq!(State::Start.name(), "START");
        assert_eq!(State::VerifyAdopt.name(), "VERIFY_ADOPT");
        assert_eq!(State::Shutdown.name(), "SHUTDOWN");
    }
}
