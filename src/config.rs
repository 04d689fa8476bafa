//! Node configuration.
//!
//! Loaded from a JSON file by the binary and validated before any socket is
//! opened. Invalid values are rejected, not clamped.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Everything the node needs to come up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Immutable node identity. A nil UUID is invalid.
    pub uuid: Uuid,

    /// Address the API listens on.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Port the API listens on.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// PEM certificate presented by the API listener.
    pub cert_path: PathBuf,
    /// PEM private key for the certificate.
    pub key_path: PathBuf,

    /// Location of the persistent key/value store.
    pub store_path: PathBuf,

    /// Skip peer-chain validation on outbound sessions. Test rigs only.
    #[serde(default)]
    pub danger_disable_verify: bool,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    7420
}

impl NodeConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("could not read {path:?}: {e}")))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("could not parse {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Ensure all required parameters are set correctly before any service
    /// starts.
    pub fn validate(&self) -> Result<()> {
        if self.uuid.is_nil() {
            return Err(Error::Config("node UUID may not be nil".into()));
        }
        if self.listen_host.is_empty() {
            return Err(Error::Config("listen host may not be empty".into()));
        }
        if self.cert_path.as_os_str().is_empty() || self.key_path.as_os_str().is_empty() {
            return Err(Error::Config(
                "certificate and key paths are required".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> NodeConfig {
        NodeConfig {
            uuid: Uuid::from_bytes([7u8; 16]),
            listen_host: default_listen_host(),
            api_port: default_api_port(),
            cert_path: "/etc/licht/cert.pem".into(),
            key_path: "/etc/licht/key.pem".into(),
            store_path: "/var/lib/licht/state.json".into(),
            danger_disable_verify: false,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn nil_uuid_is_rejected() {
        let config = NodeConfig {
            uuid: Uuid::nil(),
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn empty_listen_host_is_rejected() {
        let config = NodeConfig {
            listen_host: String::new(),
            ..valid_config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn defaults_fill_in_when_absent() {
        let raw = r#"{
            "uuid": "f0bc2f0e-7e43-4b9a-9f68-1f0573cbcb01",
            "cert_path": "/etc/licht/cert.pem",
            "key_path": "/etc/licht/key.pem",
            "store_path": "/var/lib/licht/state.json"
        }"#;

        let config: NodeConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.api_port, 7420);
        assert!(!config.danger_disable_verify);
        assert!(config.validate().is_ok());
    }
}
