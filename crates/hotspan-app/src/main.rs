//! Hotspan - share this machine's internet connection over a local group.
//!
//! This binary stands in for the platform service layer: it supplies the
//! configuration, drives the controller's start/stop entry points, and
//! prints status transitions and per-client transfer totals. The group
//! itself is treated as externally managed (`--address` names the local
//! address joined devices reach this host on); pass `--synthetic` to run
//! against the scripted radio instead.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hotspan_core::AlwaysGranted;
use hotspan_net::{
    NetworkController, ServerConfig, ServerNetworkBand, StaticGroup, SyntheticGroup,
    WirelessGroup, DEFAULT_PROXY_PORT,
};

/// Hotspan - ad-hoc internet sharing through a local proxy
#[derive(Parser, Debug)]
#[command(name = "hotspan", version, about)]
struct Args {
    /// Network name for the hosted group (platform default when omitted)
    #[arg(long)]
    ssid: Option<String>,

    /// WPA2 passphrase, 8-63 characters (platform default when omitted)
    #[arg(long)]
    passphrase: Option<String>,

    /// Proxy listening port on the group address
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// Frequency band preference: auto, 2.4ghz, or 5ghz
    #[arg(long, default_value = "auto")]
    band: String,

    /// Local address joined devices reach this host on
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Use the scripted radio instead of an externally managed group
    #[arg(long)]
    synthetic: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(args: &Args) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hotspan={},warn", args.log_level)));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let band = ServerNetworkBand::parse(&args.band)
        .ok_or_else(|| anyhow!("unknown band {:?}; expected auto, 2.4ghz, or 5ghz", args.band))?;

    let mut config = ServerConfig::default().with_port(args.port).with_band(band);
    if let Some(ssid) = args.ssid {
        config = config.with_ssid(ssid);
    }
    if let Some(passphrase) = args.passphrase {
        config = config.with_passphrase(passphrase);
    }

    let group: Arc<dyn WirelessGroup> = if args.synthetic {
        Arc::new(SyntheticGroup::new(args.address))
    } else {
        Arc::new(StaticGroup::new(args.address))
    };
    let controller = NetworkController::new(group, Arc::new(AlwaysGranted));

    // Relay status transitions to the log for the operator.
    let mut status = controller.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow().clone();
            tracing::info!("Hotspot status: {current}");
        }
    });

    controller
        .start(config)
        .await
        .context("hotspot failed to start")?;

    if let Some(info) = wait_for_group(&controller).await {
        tracing::info!(
            "Clients join {:?} (passphrase {:?}) and use proxy {}:{}",
            info.ssid,
            info.passphrase,
            info.local_ip,
            args.port
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    controller.stop().await;

    for client in controller.clients().list_seen() {
        tracing::info!(
            "{}: {} sent, {} received",
            client.nickname,
            client.transfer_to_internet(),
            client.transfer_from_internet()
        );
    }
    Ok(())
}

/// Waits for the group to publish its connection details, giving up once
/// the controller settles without one.
async fn wait_for_group(
    controller: &NetworkController,
) -> Option<hotspan_net::NetworkGroupInfo> {
    let mut group_info = controller.group_info();
    let mut status = controller.status();
    loop {
        if let Some(info) = group_info.borrow_and_update().clone() {
            return Some(info);
        }
        if status.borrow_and_update().is_error() {
            return None;
        }
        tokio::select! {
            changed = group_info.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}
