//! mDNS backend over the `mdns-sd` responder.
//!
//! One daemon per advertiser/browser; the daemon runs its own worker
//! threads, and a drainer thread translates its event stream into the
//! [`ServiceRecord`] model. Dropping a browser mid-wait raises the shutdown
//! flag, wakes every waiter, and stops the query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::{Error, Result};
use crate::mdns::{Advertiser, Browser, ResolvedInfo, ServiceRecord, TxtDictionary};

fn mdns_err(context: &str, e: &mdns_sd::Error) -> Error {
    Error::system(format!("mdns: {context}: {e}"), 0)
}

/// Map the fabric's advertised type string (base type plus `,`-separated
/// subtype) onto the responder's type-domain syntax.
fn backend_type(fabric: &str) -> String {
    match fabric.split_once(',') {
        Some((base, subtype)) => format!("{subtype}._sub.{}local.", base),
        None => format!("{fabric}local."),
    }
}

/// The base type-domain without any subtype, used for registration
/// fullnames.
fn base_type(fabric: &str) -> String {
    match fabric.split_once(',') {
        Some((base, _)) => format!("{}local.", base),
        None => format!("{fabric}local."),
    }
}

// ---------------------------------------------------------------------------
// Advertiser
// ---------------------------------------------------------------------------

/// Publishes the node's service record via `mdns-sd`.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    instance: String,
    port: u16,
    fabric_type: String,
    txt: TxtDictionary,
    active: bool,
}

impl MdnsAdvertiser {
    /// `instance` names this node (typically its hostname); `fabric_type`
    /// is the fabric's service type string, e.g. [`crate::mdns::SERVICE_TYPE`].
    pub fn new(instance: &str, fabric_type: &str, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| mdns_err("daemon start", &e))?;

        Ok(Self {
            daemon,
            instance: instance.to_string(),
            port,
            fabric_type: fabric_type.to_string(),
            txt: TxtDictionary::new(),
            active: false,
        })
    }

    fn fullname(&self) -> String {
        format!("{}.{}", self.instance, base_type(&self.fabric_type))
    }

    fn publish(&self) -> Result<()> {
        let properties: HashMap<String, String> = self
            .txt
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let info = ServiceInfo::new(
            &backend_type(&self.fabric_type),
            &self.instance,
            &format!("{}.local.", self.instance),
            "",
            self.port,
            properties,
        )
        .map_err(|e| mdns_err("service info", &e))?
        .enable_addr_auto();

        self.daemon
            .register(info)
            .map_err(|e| mdns_err("register", &e))
    }
}

impl Advertiser for MdnsAdvertiser {
    fn start_advertising(&mut self) -> Result<()> {
        if self.active {
            return Ok(());
        }

        self.publish()?;
        self.active = true;
        info!(
            "mDNS: advertising {} on port {} ({} TXT records)",
            self.fullname(),
            self.port,
            self.txt.len()
        );
        Ok(())
    }

    fn stop_advertising(&mut self) {
        if !self.active {
            return;
        }

        if let Err(e) = self.daemon.unregister(&self.fullname()) {
            warn!("mDNS: unregister failed: {e}");
        }
        self.active = false;
        info!("mDNS: stopped advertising {}", self.fullname());
    }

    fn set_txt_record(&mut self, key: &str, value: &str) -> Result<()> {
        self.txt.set(key, value);
        if self.active {
            self.publish()?;
        }
        Ok(())
    }

    fn remove_txt_record(&mut self, key: &str) -> Result<()> {
        self.txt.remove(key);
        if self.active {
            self.publish()?;
        }
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.active
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.stop_advertising();
        let _ = self.daemon.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

struct BrowseShared {
    /// Records keyed by fullname; values are shared with callers.
    records: Mutex<Vec<(String, ServiceRecord)>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

/// Browses the fabric for peers via `mdns-sd`.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    shared: Arc<BrowseShared>,
    active_type: Option<String>,
    drainer: Option<JoinHandle<()>>,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| mdns_err("daemon start", &e))?;

        Ok(Self {
            daemon,
            shared: Arc::new(BrowseShared {
                records: Mutex::new(Vec::new()),
                cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            active_type: None,
            drainer: None,
        })
    }

    fn record_for(shared: &BrowseShared, fullname: &str, service_type: &str) -> ServiceRecord {
        let mut records = shared.records.lock().expect("browse lock poisoned");
        if let Some((_, record)) = records.iter().find(|(name, _)| name == fullname) {
            return record.clone();
        }

        let instance = fullname
            .strip_suffix(&format!(".{service_type}"))
            .unwrap_or(fullname);
        let record = ServiceRecord::new(instance, service_type, "local.");
        records.push((fullname.to_string(), record.clone()));
        record
    }

    fn drain_events(
        shared: &Arc<BrowseShared>,
        receiver: &mdns_sd::Receiver<ServiceEvent>,
        service_type: &str,
    ) {
        // Blocks on the daemon's event channel; `stop_browse` delivers
        // SearchStopped and a daemon shutdown closes the channel, so the
        // thread always has a way out.
        loop {
            let event = match receiver.recv() {
                Ok(event) => event,
                Err(_) => return,
            };
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match event {
                ServiceEvent::ServiceFound(_, fullname) => {
                    debug!("mDNS: found {fullname}");
                    Self::record_for(shared, &fullname, service_type);
                    shared.cond.notify_all();
                }
                ServiceEvent::ServiceResolved(resolved) => {
                    debug!("mDNS: resolved {}", resolved.get_fullname());
                    let record =
                        Self::record_for(shared, resolved.get_fullname(), service_type);

                    let mut txt = TxtDictionary::new();
                    for property in resolved.get_properties().iter() {
                        txt.set(property.key(), property.val_str());
                    }

                    record.set_resolved(ResolvedInfo {
                        hostname: resolved.get_hostname().to_string(),
                        port: resolved.get_port(),
                        addresses: resolved.get_addresses().iter().copied().collect(),
                        txt,
                    });
                    shared.cond.notify_all();
                }
                ServiceEvent::ServiceRemoved(_, fullname) => {
                    debug!("mDNS: removed {fullname}");
                }
                ServiceEvent::SearchStopped(_) => return,
                ServiceEvent::SearchStarted(_) => {}
            }
        }
    }

    fn stop_active_browse(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();

        match self.active_type.take() {
            Some(ty) => {
                // SearchStopped (or the closing channel) releases the
                // drainer; join only once the stop was delivered.
                match self.daemon.stop_browse(&ty) {
                    Ok(()) => {
                        if let Some(handle) = self.drainer.take() {
                            let _ = handle.join();
                        }
                    }
                    Err(e) => {
                        debug!("mDNS: stop_browse: {e}");
                        // The drainer unblocks when the daemon goes away.
                        drop(self.drainer.take());
                    }
                }
            }
            None => drop(self.drainer.take()),
        }
    }
}

impl Browser for MdnsBrowser {
    fn browse(&mut self, service_type: &str, timeout: Duration) -> Result<()> {
        // One query at a time; a fresh browse supersedes the previous one
        // and its results.
        self.stop_active_browse();
        {
            let mut records = self.shared.records.lock().expect("browse lock poisoned");
            for (_, record) in records.iter() {
                record.cancel();
            }
            records.clear();
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);

        let ty = backend_type(service_type);
        let receiver = self
            .daemon
            .browse(&ty)
            .map_err(|e| mdns_err("browse", &e))?;
        self.active_type = Some(ty.clone());

        let shared = Arc::clone(&self.shared);
        let base = base_type(service_type);
        self.drainer = Some(thread::spawn(move || {
            Self::drain_events(&shared, &receiver, &base);
        }));

        // Bounded wait: the responder has no "no more coming" signal, so the
        // timeout (or cancellation) ends the collection window.
        let deadline = Instant::now() + timeout;
        let mut records = self.shared.records.lock().expect("browse lock poisoned");
        loop {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (next, _) = self
                .shared
                .cond
                .wait_timeout(records, deadline - now)
                .expect("browse lock poisoned");
            records = next;
        }
    }

    fn results(&self) -> Vec<ServiceRecord> {
        self.shared
            .records
            .lock()
            .expect("browse lock poisoned")
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        self.stop_active_browse();

        // Unblock anything still waiting on an individual record.
        for record in self.results() {
            record.cancel();
        }
        let _ = self.daemon.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_type_splits_subtype() {
        assert_eq!(
            backend_type("_licht._tcp.,_client-api-v1"),
            "_client-api-v1._sub._licht._tcp.local."
        );
        assert_eq!(base_type("_licht._tcp.,_client-api-v1"), "_licht._tcp.local.");
    }

    #[test]
    fn backend_type_without_subtype() {
        assert_eq!(backend_type("_licht._tcp."), "_licht._tcp.local.");
    }
}
