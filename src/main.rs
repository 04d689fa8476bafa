//! Lichtenstein node — main entry point.
//!
//! Loads the configuration, opens the persistent store, starts the node,
//! and waits for SIGINT. Configuration failures exit non-zero before any
//! connection is accepted.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use log::info;

use lichtenstein_client::config::NodeConfig;
use lichtenstein_client::node::Node;
use lichtenstein_client::store::{DataStore, FileDataStore};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!(
        "lichtenstein-node v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let config_path: PathBuf = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from("node.json"), PathBuf::from);

    let config = NodeConfig::load(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    let store: Arc<dyn DataStore> = Arc::new(
        FileDataStore::open(&config.store_path)
            .with_context(|| format!("opening data store at {:?}", config.store_path))?,
    );

    let mut node = Node::new(config, store).context("constructing node")?;
    node.start().context("starting node")?;
    info!("node is up; press Ctrl-C to stop");

    // Park until SIGINT.
    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing signal handler")?;
    let _ = rx.recv();

    info!("SIGINT received, shutting down");
    node.stop();
    Ok(())
}
