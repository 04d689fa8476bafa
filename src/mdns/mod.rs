//! mDNS advertise and browse.
//!
//! The node publishes itself as `_licht._tcp.,_client-api-v1` with TXT keys
//! `version`, `type` and `uuid`, and can browse for peers with bounded,
//! cancellable waits. The concrete responder lives behind the
//! [`Advertiser`]/[`Browser`] traits so alternate backends (Avahi, embedded
//! responders) slot in without touching the node lifecycle; [`sd`] is the
//! bundled implementation.

pub mod sd;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;

/// Service type advertised on the fabric (base type plus subtype).
pub const SERVICE_TYPE: &str = "_licht._tcp.,_client-api-v1";

// ---------------------------------------------------------------------------
// TXT dictionary
// ---------------------------------------------------------------------------

/// Ordered TXT key/value map with the DNS-SD blob codec.
///
/// A TXT blob is a concatenation of length-prefixed strings (one byte of
/// length, then that many bytes of `key=value`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtDictionary {
    entries: BTreeMap<String, String>,
}

impl TxtDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse a TXT blob, reading until the input is exhausted.
    ///
    /// A declared length that overruns the input takes whatever remains;
    /// strings without `=` are stored with an empty value; empty strings are
    /// skipped. Parsing never fails.
    pub fn parse(blob: &[u8]) -> Self {
        let mut entries = BTreeMap::new();
        let mut rest = blob;

        while let Some((&len, tail)) = rest.split_first() {
            let take = (len as usize).min(tail.len());
            let (entry, remainder) = tail.split_at(take);
            rest = remainder;

            if entry.is_empty() {
                continue;
            }

            let text = String::from_utf8_lossy(entry);
            match text.split_once('=') {
                Some((key, value)) => entries.insert(key.to_string(), value.to_string()),
                None => entries.insert(text.to_string(), String::new()),
            };
        }

        Self { entries }
    }

    /// Encode the dictionary as a TXT blob. Entries longer than 255 bytes
    /// are truncated at the DNS-SD string limit.
    pub fn encode(&self) -> Vec<u8> {
        let mut blob = Vec::new();
        for (key, value) in &self.entries {
            let entry = format!("{key}={value}");
            let bytes = entry.as_bytes();
            let len = bytes.len().min(255);
            blob.push(len as u8);
            blob.extend_from_slice(&bytes[..len]);
        }
        blob
    }
}

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Publishes the node's service record. Lifetime follows the node's state
/// machine: started when it comes up, stopped on shutdown.
pub trait Advertiser: Send {
    /// Begin (or resume) advertising. Idempotent.
    fn start_advertising(&mut self) -> Result<()>;

    /// Withdraw the advertisement. Idempotent.
    fn stop_advertising(&mut self);

    /// Set a TXT record and re-publish when active.
    fn set_txt_record(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove a TXT record and re-publish when active.
    fn remove_txt_record(&mut self, key: &str) -> Result<()>;

    fn is_advertising(&self) -> bool;
}

/// Browses for peer services with a bounded wait.
pub trait Browser: Send {
    /// Collect peers of `service_type` until the platform reports no more
    /// results or `timeout` elapses, whichever is first. An expired timeout
    /// is not an error; partial results remain available.
    fn browse(&mut self, service_type: &str, timeout: Duration) -> Result<()>;

    /// Snapshot of the records gathered so far.
    fn results(&self) -> Vec<ServiceRecord>;
}

// ---------------------------------------------------------------------------
// Service records
// ---------------------------------------------------------------------------

/// Resolved endpoint data; replaced wholesale on every (re-)resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInfo {
    pub hostname: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: TxtDictionary,
}

struct RecordState {
    resolved: Option<ResolvedInfo>,
    shutdown: bool,
}

struct RecordShared {
    name: String,
    service_type: String,
    domain: String,
    state: Mutex<RecordState>,
    cond: Condvar,
}

/// One browse result: name/type/domain from the browse stage, host, port and
/// TXT only after [`resolve`](Self::resolve) completes.
///
/// Cloning shares the underlying record; the backend populating it and any
/// number of waiters observe the same state.
#[derive(Clone)]
pub struct ServiceRecord {
    shared: Arc<RecordShared>,
}

impl ServiceRecord {
    pub fn new(name: &str, service_type: &str, domain: &str) -> Self {
        Self {
            shared: Arc::new(RecordShared {
                name: name.to_string(),
                service_type: service_type.to_string(),
                domain: domain.to_string(),
                state: Mutex::new(RecordState {
                    resolved: None,
                    shutdown: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn service_type(&self) -> &str {
        &self.shared.service_type
    }

    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    /// Wait until the record carries resolved data or `timeout` elapses.
    ///
    /// Returns whether resolved data is available. A timeout is not an
    /// error, and a cancelled record (its browser was dropped) unblocks
    /// immediately.
    pub fn resolve(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().expect("record lock poisoned");

        loop {
            if state.resolved.is_some() || state.shutdown {
                return state.resolved.is_some();
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (next, _timed_out) = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .expect("record lock poisoned");
            state = next;
        }
    }

    /// Snapshot of the resolved data, if any.
    pub fn resolved(&self) -> Option<ResolvedInfo> {
        self.shared
            .state
            .lock()
            .expect("record lock poisoned")
            .resolved
            .clone()
    }

    /// Snapshot of the TXT records (empty before resolution).
    pub fn txt_records(&self) -> TxtDictionary {
        self.resolved().map(|r| r.txt).unwrap_or_default()
    }

    /// Replace the resolved data atomically and wake any waiters.
    pub(crate) fn set_resolved(&self, info: ResolvedInfo) {
        let mut state = self.shared.state.lock().expect("record lock poisoned");
        state.resolved = Some(info);
        self.shared.cond.notify_all();
    }

    /// Unblock all waiters without delivering data.
    pub(crate) fn cancel(&self) {
        let mut state = self.shared.state.lock().expect("record lock poisoned");
        state.shutdown = true;
        self.shared.cond.notify_all();
    }
}
