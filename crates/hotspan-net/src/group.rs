//! Wireless group capability.
//!
//! The radio that hosts the local group is platform-owned; the controller
//! only ever talks to it through [`WirelessGroup`]. Two implementations
//! ship: [`StaticGroup`] for hosts whose radio is managed outside this
//! process, and [`SyntheticGroup`], a scripted radio for exercising the
//! controller's state machine without hardware.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, ServerNetworkBand};

/// SSID used when the caller did not name the network.
const DEFAULT_SSID: &str = "DIRECT-hotspan";

/// Passphrase used when the caller did not supply one.
const DEFAULT_PASSPHRASE: &str = "hotspan123";

/// Everything a joined device needs to know about the hosted group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkGroupInfo {
    /// Network name devices see.
    pub ssid: String,
    /// WPA2 passphrase devices join with.
    pub passphrase: String,
    /// This host's address inside the group; the proxy binds here.
    pub local_ip: IpAddr,
    /// Band the group came up on.
    pub band: ServerNetworkBand,
}

/// Asynchronous notifications from the radio.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// The group is up and joinable.
    Ready(NetworkGroupInfo),
    /// The group went away without a teardown request.
    Lost(String),
}

/// Group creation failures.
#[derive(Debug, Clone, Error)]
pub enum GroupError {
    /// The platform refused to create a group.
    #[error("platform refused group creation: {0}")]
    Refused(String),

    /// Creation did not finish in time.
    #[error("group creation timed out")]
    Timeout,

    /// The radio cannot host the requested band.
    #[error("frequency band {0} is not supported by this radio")]
    UnsupportedBand(ServerNetworkBand),
}

/// A radio capable of hosting a local wireless group.
#[async_trait]
pub trait WirelessGroup: Send + Sync {
    /// Creates the group and returns its connection details once joinable.
    async fn create_group(&self, config: &ServerConfig) -> Result<NetworkGroupInfo, GroupError>;

    /// Tears the group down. Best-effort; never fails.
    async fn destroy_group(&self);

    /// Subscribes to ready/lost notifications.
    fn subscribe(&self) -> broadcast::Receiver<GroupEvent>;
}

fn info_from_config(config: &ServerConfig, local_ip: IpAddr) -> NetworkGroupInfo {
    NetworkGroupInfo {
        ssid: config.ssid.clone().unwrap_or_else(|| DEFAULT_SSID.to_string()),
        passphrase: config
            .passphrase
            .clone()
            .unwrap_or_else(|| DEFAULT_PASSPHRASE.to_string()),
        local_ip,
        band: config.band,
    }
}

/// Group provider for hosts whose radio is managed outside this process.
///
/// Treats a pre-configured local address as the group's address: creation
/// succeeds immediately and teardown is a no-op.
#[derive(Debug)]
pub struct StaticGroup {
    local_ip: IpAddr,
    events: broadcast::Sender<GroupEvent>,
    active: Mutex<Option<NetworkGroupInfo>>,
}

impl StaticGroup {
    /// Creates a provider for the given local address.
    pub fn new(local_ip: IpAddr) -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            local_ip,
            events,
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WirelessGroup for StaticGroup {
    async fn create_group(&self, config: &ServerConfig) -> Result<NetworkGroupInfo, GroupError> {
        let info = info_from_config(config, self.local_ip);
        info!("Using externally managed group on {}", self.local_ip);
        *self.active.lock() = Some(info.clone());
        let _ = self.events.send(GroupEvent::Ready(info.clone()));
        Ok(info)
    }

    async fn destroy_group(&self) {
        self.active.lock().take();
    }

    fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }
}

/// Scripted radio for driving the controller without hardware.
///
/// Tests (and the daemon's dry-run mode) configure delays, failures, and
/// spontaneous group loss, then watch the controller react.
#[derive(Debug)]
pub struct SyntheticGroup {
    local_ip: IpAddr,
    ready_delay: Mutex<Duration>,
    fail_next: Mutex<Option<GroupError>>,
    create_calls: AtomicUsize,
    events: broadcast::Sender<GroupEvent>,
    active: Mutex<Option<NetworkGroupInfo>>,
}

impl SyntheticGroup {
    /// Creates a scripted radio whose groups come up on `local_ip`.
    pub fn new(local_ip: IpAddr) -> Self {
        let (events, _) = broadcast::channel(8);
        Self {
            local_ip,
            ready_delay: Mutex::new(Duration::ZERO),
            fail_next: Mutex::new(None),
            create_calls: AtomicUsize::new(0),
            events,
            active: Mutex::new(None),
        }
    }

    /// Delays every subsequent group creation by `delay`.
    pub fn set_ready_delay(&self, delay: Duration) {
        *self.ready_delay.lock() = delay;
    }

    /// Makes the next creation attempt fail with `error`.
    pub fn fail_next_create(&self, error: GroupError) {
        *self.fail_next.lock() = Some(error);
    }

    /// Number of creation attempts seen so far.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// The currently hosted group, if any.
    pub fn current(&self) -> Option<NetworkGroupInfo> {
        self.active.lock().clone()
    }

    /// Simulates the radio dropping the group out from under us.
    pub fn drop_group(&self, reason: &str) {
        warn!("Synthetic radio dropping group: {reason}");
        self.active.lock().take();
        let _ = self.events.send(GroupEvent::Lost(reason.to_string()));
    }
}

#[async_trait]
impl WirelessGroup for SyntheticGroup {
    async fn create_group(&self, config: &ServerConfig) -> Result<NetworkGroupInfo, GroupError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.ready_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.fail_next.lock().take() {
            debug!("Synthetic radio failing creation: {error}");
            return Err(error);
        }

        let info = info_from_config(config, self.local_ip);
        *self.active.lock() = Some(info.clone());
        let _ = self.events.send(GroupEvent::Ready(info.clone()));
        Ok(info)
    }

    async fn destroy_group(&self) {
        self.active.lock().take();
    }

    fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }
}
