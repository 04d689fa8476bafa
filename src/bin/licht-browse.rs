//! Browse tool — lists fabric peers advertising a given service type.
//!
//! Handy when commissioning a fabric: run it to see which nodes are
//! discoverable and what their TXT records say.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::info;

use lichtenstein_client::mdns::sd::MdnsBrowser;
use lichtenstein_client::mdns::{Browser, SERVICE_TYPE};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let service = match args.next() {
        Some(service) => service,
        None => SERVICE_TYPE.to_string(),
    };
    if args.next().is_some() {
        bail!("usage: licht-browse [service-type]");
    }

    info!("searching for service '{service}'");

    let mut browser = MdnsBrowser::new().context("starting mDNS browser")?;
    browser
        .browse(&service, Duration::from_secs(2))
        .context("browsing")?;

    let results = browser.results();
    info!("got {} results", results.len());

    println!(
        "{:<20} {:<28} {:<32} {:>5}  TXT",
        "Type", "Name", "Host", "Port"
    );

    for record in results {
        record.resolve(Duration::from_secs(1));

        let (host, port) = record
            .resolved()
            .map_or(("N/A".to_string(), "N/A".to_string()), |info| {
                (info.hostname, info.port.to_string())
            });

        let txt = record
            .txt_records()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");

        println!(
            "{:<20} {:<28} {:<32} {:>5}  {}",
            record.service_type(),
            record.name(),
            host,
            port,
            txt
        );
    }

    Ok(())
}
