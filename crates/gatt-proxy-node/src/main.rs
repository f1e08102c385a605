//! GATT Proxy Node - mirror a BLE peripheral from the command line
//!
//! This binary wires the hardware adapters into the proxy runtime:
//! - btleplug for the central role facing the remote device
//! - BlueZ for the peripheral role facing local clients
//!
//! It makes one connection attempt and exits when the remote link closes
//! or on Ctrl-C.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gatt_proxy_core::{
    BluezPeripheral, BtleplugCentral, GattProxy, ProxyConfig, ProxyConfigBuilder, ProxyEventKind,
    ServiceConfig,
};

#[derive(Parser)]
#[command(name = "gatt-proxy-node")]
#[command(about = "Mirror a remote BLE peripheral as a local one and relay its traffic")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Name of the remote device to mirror (overrides the config file)
    #[arg(long, short)]
    target: Option<String>,

    /// Name the mirror advertises (defaults to the target name)
    #[arg(long)]
    local_name: Option<String>,

    /// Service to mirror, as SERVICE=CHAR[,CHAR...] (repeatable, added to the config file)
    #[arg(long = "service", value_parser = parse_service)]
    services: Vec<ServiceConfig>,

    /// Time allowed from connect to a complete topology (e.g. "30s")
    #[arg(long, value_parser = humantime::parse_duration)]
    discovery_timeout: Option<Duration>,

    /// Give up scanning after this long (e.g. "1m")
    #[arg(long, value_parser = humantime::parse_duration)]
    scan_timeout: Option<Duration>,

    /// Print proxy events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn parse_service(s: &str) -> Result<ServiceConfig, String> {
    let (service, characteristics) = s
        .split_once('=')
        .ok_or_else(|| format!("expected SERVICE=CHAR[,CHAR...], got '{}'", s))?;
    let service = Uuid::parse_str(service.trim()).map_err(|e| format!("bad service id: {}", e))?;
    let characteristics = characteristics
        .split(',')
        .map(|c| Uuid::parse_str(c.trim()).map_err(|e| format!("bad characteristic id: {}", e)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ServiceConfig::new(service, characteristics))
}

fn build_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = match &args.config {
        Some(path) => ProxyConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProxyConfigBuilder::new().build(),
    };

    if let Some(target) = &args.target {
        config.target_name = target.clone();
    }
    if let Some(local_name) = &args.local_name {
        config.local_name = Some(local_name.clone());
    }
    config.services.extend(args.services.iter().cloned());
    if let Some(timeout) = args.discovery_timeout {
        config.link.discovery_timeout = timeout;
    }
    if args.scan_timeout.is_some() {
        config.link.scan_timeout = args.scan_timeout;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&args)?;
    info!(
        "Mirroring '{}' as '{}' ({} services)",
        config.target_name,
        config.advertised_name(),
        config.services.len()
    );

    // Bring up both radios
    let (central_tx, central_rx) = mpsc::unbounded_channel();
    let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
    let central = BtleplugCentral::new(central_tx)
        .await
        .context("opening central adapter")?;
    let peripheral = BluezPeripheral::new(peripheral_tx)
        .await
        .context("opening peripheral adapter")?;

    let (proxy, handle) = GattProxy::new(config, central, central_rx, peripheral, peripheral_rx)?;
    let mut events = handle.subscribe_events();
    let runner = tokio::spawn(proxy.run());

    handle.connect().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if args.json {
                        println!("{}", serde_json::to_string(&event)?);
                    } else {
                        info!("{}", event.describe());
                    }
                    if matches!(event.kind, ProxyEventKind::LinkDisconnected { .. }) {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event stream lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    if let Ok(status) = handle.status().await {
        info!(
            "Relayed {} reads, {} writes, {} values",
            status.stats.reads_forwarded, status.stats.writes_forwarded, status.stats.values_relayed
        );
    }
    // Already stopped if the runtime exited on its own
    let _ = handle.shutdown().await;
    match runner.await {
        Ok(result) => result?,
        Err(e) => error!("Proxy task failed: {}", e),
    }

    info!("GATT proxy node stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const S1: &str = "0000180d-0000-1000-8000-00805f9b34fb";
    const C1: &str = "00002a37-0000-1000-8000-00805f9b34fb";
    const C2: &str = "00002a38-0000-1000-8000-00805f9b34fb";

    #[test]
    fn test_parse_service() {
        let service = parse_service(&format!("{}={},{}", S1, C1, C2)).unwrap();
        assert_eq!(service.uuid, Uuid::parse_str(S1).unwrap());
        assert_eq!(service.characteristics.len(), 2);

        assert!(parse_service(S1).is_err());
        assert!(parse_service(&format!("{}=nope", S1)).is_err());
    }

    #[test]
    fn test_build_config_from_args() {
        let service = format!("{}={}", S1, C1);
        let args = Args::parse_from([
            "gatt-proxy-node",
            "--target",
            "Heart Rate",
            "--service",
            service.as_str(),
            "--discovery-timeout",
            "5s",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.target_name, "Heart Rate");
        assert_eq!(config.advertised_name(), "Heart Rate");
        assert_eq!(config.link.discovery_timeout, Duration::from_secs(5));
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_build_config_requires_services() {
        let args = Args::parse_from(["gatt-proxy-node", "--target", "Heart Rate"]);
        assert!(build_config(&args).is_err());
    }
}
