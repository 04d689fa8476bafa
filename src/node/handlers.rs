//! Request handler registry and the built-in node API handlers.
//!
//! The registry maps payload type URLs to handler functions. It is
//! populated explicitly by [`register_builtin_handlers`] when the node
//! starts (no static-initialiser side effects) and is effectively read-only
//! afterwards. Registering two handlers for one type URL is an error.

use std::collections::HashMap;
use std::sync::{Once, OnceLock, RwLock};

use log::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::NodeHandle;
use crate::node::api::ReplySink;
use crate::proto::{
    self, AdoptAck, AdoptRequest, AdoptionStatus, GetInfo, GetInfoResponse, NodeInfo,
    PerformanceInfo, ProtocolMessage,
};
use crate::protocol::client_version;
use crate::store::keys;

/// A request handler: receives the decoded envelope, replies through the
/// sink.
pub type Handler = fn(&NodeHandle, &proto::Message, &mut dyn ReplySink) -> Result<()>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

static REGISTRY: OnceLock<RwLock<HashMap<String, Handler>>> = OnceLock::new();
static BUILTINS: Once = Once::new();

fn registry() -> &'static RwLock<HashMap<String, Handler>> {
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a handler for a payload type URL.
///
/// Duplicate registration for the same URL is a configuration error.
pub fn register_handler(type_url: &str, handler: Handler) -> Result<()> {
    let mut map = registry().write().expect("registry lock poisoned");
    if map.contains_key(type_url) {
        return Err(Error::Config(format!(
            "handler for {type_url} registered twice"
        )));
    }
    map.insert(type_url.to_string(), handler);
    debug!("registered handler for {type_url}");
    Ok(())
}

/// Look up the handler for a type URL.
pub fn lookup(type_url: &str) -> Option<Handler> {
    registry()
        .read()
        .expect("registry lock poisoned")
        .get(type_url)
        .copied()
}

/// Register the built-in handlers. Called from `Node::start`; idempotent.
pub fn register_builtin_handlers() -> Result<()> {
    let mut outcome = Ok(());
    BUILTINS.call_once(|| {
        outcome = (|| {
            register_handler(&GetInfo::type_url(), handle_get_info)?;
            register_handler(&AdoptRequest::type_url(), handle_adopt_request)
        })();
    });
    outcome
}

// ---------------------------------------------------------------------------
// GetInfo
// ---------------------------------------------------------------------------

fn handle_get_info(
    node: &NodeHandle,
    envelope: &proto::Message,
    reply: &mut dyn ReplySink,
) -> Result<()> {
    let payload = envelope
        .payload
        .as_ref()
        .ok_or_else(|| Error::Protocol("GetInfo carries no payload".into()))?;
    let request: GetInfo = proto::unpack(payload)?;

    info!(
        "get info: node={} adoption={} performance={}",
        request.wants_node_info, request.wants_adoption_info, request.wants_performance_info
    );

    let response = GetInfoResponse {
        node: request.wants_node_info.then(|| make_node_info(node)),
        adoption: request.wants_adoption_info.then(|| AdoptionStatus {
            is_adopted: node.is_adopted(),
        }),
        performance: request.wants_performance_info.then(|| PerformanceInfo {
            uptime_secs: node.uptime_secs(),
        }),
    };

    reply.send_any(proto::pack(&response))
}

fn make_node_info(node: &NodeHandle) -> NodeInfo {
    let (os, hardware) = uname_info();

    NodeInfo {
        hostname: local_hostname(),
        os,
        hardware,
        client: client_version(),
        uuid: node.uuid().as_bytes().to_vec(),
    }
}

// ---------------------------------------------------------------------------
// AdoptRequest
// ---------------------------------------------------------------------------

fn handle_adopt_request(
    node: &NodeHandle,
    envelope: &proto::Message,
    reply: &mut dyn ReplySink,
) -> Result<()> {
    let payload = envelope
        .payload
        .as_ref()
        .ok_or_else(|| Error::Protocol("AdoptRequest carries no payload".into()))?;
    let request: AdoptRequest = proto::unpack(payload)?;

    debug!(
        "received adoption request: api {}:{}, rt {}:{}",
        request.api_address, request.api_port, request.rt_address, request.rt_port
    );

    if node.is_adopted() {
        return Err(Error::Handler("node is already adopted".into()));
    }

    let server_uuid = Uuid::from_slice(&request.server_uuid)
        .map_err(|_| Error::Handler("server UUID must be 16 bytes".into()))?;

    let api_port = valid_port(request.api_port, "apiPort")?;
    let rt_port = valid_port(request.rt_port, "rtPort")?;

    // Persist everything verification needs, then run it; a failure path
    // below resets `adoption.valid` before the error reaches the peer.
    let store = node.store();
    store.set(keys::SERVER_UUID, &server_uuid.to_string())?;
    store.set(keys::SERVER_HOST, &request.api_address)?;
    store.set(keys::SERVER_PORT, &api_port.to_string())?;
    store.set(keys::RT_HOST, &request.rt_address)?;
    store.set(keys::RT_PORT, &rt_port.to_string())?;
    store.set(keys::ADOPTION_SECRET, &request.secret)?;

    node.verify_adoption()
        .map_err(|e| Error::Handler(format!("failed to verify adoption: {e}")))?;

    store.set(keys::ADOPTION_VALID, "1")?;
    info!("adopted by controller {server_uuid}");

    // The realtime channel comes up on the state machine thread.
    node.request_realtime_start();

    reply.send_any(proto::pack(&AdoptAck { is_adopted: true }))
}

fn valid_port(raw: u32, field: &str) -> Result<u16> {
    u16::try_from(raw).map_err(|_| Error::Handler(format!("{field} {raw} out of range")))
}

// ---------------------------------------------------------------------------
// Host introspection
// ---------------------------------------------------------------------------

/// This machine's hostname, or `localhost` when unavailable.
pub(crate) fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes a NUL-terminated name into a buffer we own;
    // the length argument bounds the write.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }

    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Operating system description and machine type, uname style.
fn uname_info() -> (String, String) {
    // SAFETY: utsname is plain data; uname fills every field on success.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return (
            std::env::consts::OS.to_string(),
            std::env::consts::ARCH.to_string(),
        );
    }

    fn field(raw: &[libc::c_char]) -> String {
        let bytes: Vec<u8> = raw
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    (
        format!(
            "{} {} {}",
            field(&uts.sysname),
            field(&uts.release),
            field(&uts.version)
        ),
        field(&uts.machine),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::Node;
    use crate::node::api::RecordingSink;
    use crate::protocol::PROTOCOL_VERSION;
    use crate::store::{DataStore, MemoryDataStore};
    use std::sync::Arc;

    fn test_node(store: Arc<dyn DataStore>) -> Node {
        let config = NodeConfig {
            uuid: Uuid::from_bytes([0xA5; 16]),
            listen_host: "127.0.0.1".into(),
            api_port: 7420,
            cert_path: "/etc/licht/cert.pem".into(),
            key_path: "/etc/licht/key.pem".into(),
            store_path: "/tmp/licht-test.json".into(),
            danger_disable_verify: true,
        };
        Node::new(config, store).unwrap()
    }

    fn envelope_of<M: ProtocolMessage>(payload: &M) -> proto::Message {
        proto::Message {
            version: PROTOCOL_VERSION,
            payload: Some(proto::pack(payload)),
        }
    }

    #[test]
    fn builtin_registration_is_idempotent() {
        register_builtin_handlers().unwrap();
        register_builtin_handlers().unwrap();
        assert!(lookup(&GetInfo::type_url()).is_some());
        assert!(lookup(&AdoptRequest::type_url()).is_some());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        register_builtin_handlers().unwrap();
        let result = register_handler(&GetInfo::type_url(), handle_get_info);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn unknown_type_url_has_no_handler() {
        assert!(lookup("type.googleapis.com/example.Bogus").is_none());
    }

    #[test]
    fn get_info_honours_section_selection() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
        let node = test_node(Arc::clone(&store));
        let handle = node.handle();

        let request = envelope_of(&GetInfo {
            wants_node_info: true,
            wants_adoption_info: true,
            wants_performance_info: false,
        });

        let mut sink = RecordingSink(Vec::new());
        handle_get_info(&handle, &request, &mut sink).unwrap();

        assert_eq!(sink.0.len(), 1);
        let response: GetInfoResponse = proto::unpack(&sink.0[0]).unwrap();

        let info = response.node.expect("node info requested");
        assert_eq!(info.uuid, vec![0xA5; 16]);
        assert!(!info.hostname.is_empty());
        assert!(info.client.starts_with("lichtenstein-client"));

        assert!(!response.adoption.expect("adoption requested").is_adopted);
        assert!(response.performance.is_none());
    }

    #[test]
    fn adopt_request_rejected_when_already_adopted() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
        store.set(keys::ADOPTION_VALID, "1").unwrap();

        let node = test_node(Arc::clone(&store));
        let request = envelope_of(&AdoptRequest {
            server_uuid: vec![1; 16],
            api_address: "10.0.0.1".into(),
            api_port: 7421,
            rt_address: "10.0.0.1".into(),
            rt_port: 7422,
            secret: "hunter2".into(),
        });

        let mut sink = RecordingSink(Vec::new());
        let result = handle_adopt_request(&node.handle(), &request, &mut sink);
        assert!(matches!(result, Err(Error::Handler(_))));
        assert!(sink.0.is_empty());
    }

    #[test]
    fn adopt_request_rejects_short_uuid() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
        let node = test_node(Arc::clone(&store));

        let request = envelope_of(&AdoptRequest {
            server_uuid: vec![1; 4],
            api_address: "10.0.0.1".into(),
            api_port: 7421,
            rt_address: "10.0.0.1".into(),
            rt_port: 7422,
            secret: "hunter2".into(),
        });

        let mut sink = RecordingSink(Vec::new());
        let result = handle_adopt_request(&node.handle(), &request, &mut sink);
        assert!(matches!(result, Err(Error::Handler(_))));
    }

    #[test]
    fn adopt_request_failure_leaves_adoption_invalid() {
        let store: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
        let node = test_node(Arc::clone(&store));

        // No controller is listening on this address, so verification fails
        // after the fields were persisted.
        let request = envelope_of(&AdoptRequest {
            server_uuid: vec![2; 16],
            api_address: "127.0.0.1".into(),
            api_port: 1,
            rt_address: "127.0.0.1".into(),
            rt_port: 2,
            secret: "hunter2".into(),
        });

        let mut sink = RecordingSink(Vec::new());
        let result = handle_adopt_request(&node.handle(), &request, &mut sink);
        assert!(matches!(result, Err(Error::Handler(_))));
        assert_ne!(store.get(keys::ADOPTION_VALID).as_deref(), Some("1"));
        assert_eq!(store.get(keys::SERVER_HOST).as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn hostname_and_uname_are_populated() {
        assert!(!local_hostname().is_empty());
        let (os, hardware) = uname_info();
        assert!(!os.is_empty());
        assert!(!hardware.is_empty());
    }
}
