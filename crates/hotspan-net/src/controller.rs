//! Hotspot lifecycle controller.
//!
//! Owns the start/stop state machine tying the radio and the proxy
//! together: group creation is requested from the radio, the proxy starts
//! once the group is joinable, and teardown always stops the proxy before
//! releasing the group. Status transitions never block on session I/O, so a
//! stop request lands even while the proxy is mid-drain.
//!
//! Status and group info are published through watch channels; external
//! callers observe them and drive [`NetworkController::start`] /
//! [`NetworkController::stop`], nothing more.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use hotspan_core::{ClientRegistry, FixerPipeline, PermissionGuard};
use hotspan_proxy::{ProxyManager, ProxyStatsSnapshot};

use crate::config::{ConfigError, ServerConfig};
use crate::group::{GroupEvent, NetworkGroupInfo, WirelessGroup};
use crate::status::{FailureReason, RunningStatus};

/// Errors a start request reports synchronously, before any group work.
#[derive(Debug, Error)]
pub enum StartError {
    /// The supplied configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A required permission is missing; group creation was not attempted.
    #[error("permission to host a wireless group is missing")]
    PermissionRequired,
}

/// Out-of-band notifications for the service layer.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The hotspot left the running state without an explicit stop request.
    Shutdown {
        /// Human-readable cause.
        reason: String,
    },
}

#[derive(Default)]
struct ControllerInner {
    stop_requested: bool,
    monitor_task: Option<tokio::task::JoinHandle<()>>,
}

/// Coordinates the wireless group and the proxy across the hotspot's
/// lifecycle.
///
/// Cheap to clone; all clones drive the same hotspot.
#[derive(Clone)]
pub struct NetworkController {
    group: Arc<dyn WirelessGroup>,
    permissions: Arc<dyn PermissionGuard>,
    proxy: Arc<ProxyManager>,
    registry: ClientRegistry,
    status_tx: watch::Sender<RunningStatus>,
    group_tx: watch::Sender<Option<NetworkGroupInfo>>,
    events_tx: broadcast::Sender<ServerEvent>,
    inner: Arc<Mutex<ControllerInner>>,
}

impl NetworkController {
    /// Creates a controller with a fresh registry and the standard fixer
    /// pipeline.
    pub fn new(group: Arc<dyn WirelessGroup>, permissions: Arc<dyn PermissionGuard>) -> Self {
        let registry = ClientRegistry::new();
        let proxy = Arc::new(ProxyManager::new(
            registry.clone(),
            FixerPipeline::standard(),
        ));
        Self::with_parts(group, permissions, registry, proxy)
    }

    /// Creates a controller around caller-supplied parts. The proxy manager
    /// must share `registry`.
    pub fn with_parts(
        group: Arc<dyn WirelessGroup>,
        permissions: Arc<dyn PermissionGuard>,
        registry: ClientRegistry,
        proxy: Arc<ProxyManager>,
    ) -> Self {
        let (status_tx, _) = watch::channel(RunningStatus::NotRunning);
        let (group_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(8);
        Self {
            group,
            permissions,
            proxy,
            registry,
            status_tx,
            group_tx,
            events_tx,
            inner: Arc::new(Mutex::new(ControllerInner::default())),
        }
    }

    /// Requests hotspot start with the given configuration.
    ///
    /// Validation and the permission check happen before any group work; an
    /// invalid configuration is rejected here and the state machine never
    /// leaves its current state. Group creation and proxy startup continue
    /// asynchronously — watch [`NetworkController::status`] for the
    /// outcome. A start while already starting or running is a no-op.
    pub async fn start(&self, config: ServerConfig) -> Result<(), StartError> {
        config.validate()?;

        let mut inner = self.inner.lock().await;
        match self.current_status() {
            RunningStatus::Starting | RunningStatus::Running => {
                debug!("Start ignored; already {}", self.current_status());
                return Ok(());
            }
            RunningStatus::Stopping => {
                warn!("Start ignored while stopping");
                return Ok(());
            }
            RunningStatus::NotRunning | RunningStatus::Error(_) => {}
        }

        inner.stop_requested = false;
        self.set_status(RunningStatus::Starting);

        if !self.permissions.can_create_group() {
            warn!(
                "Cannot host group; missing permissions: {:?}",
                self.permissions.missing_permissions()
            );
            self.set_status(RunningStatus::Error(FailureReason::PermissionRequired));
            return Err(StartError::PermissionRequired);
        }

        let controller = self.clone();
        tokio::spawn(async move {
            controller.run_start(config).await;
        });
        Ok(())
    }

    /// Requests hotspot stop.
    ///
    /// Idempotent: stopping an already stopped (or failed) hotspot does
    /// nothing, and a stop while still starting cancels the in-flight start
    /// before anything is served.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        match self.current_status() {
            RunningStatus::Starting => {
                info!("Stop requested while starting; unwinding");
                inner.stop_requested = true;
                self.set_status(RunningStatus::Stopping);
            }
            RunningStatus::Running => {
                self.set_status(RunningStatus::Stopping);
                if let Some(monitor) = inner.monitor_task.take() {
                    monitor.abort();
                }
                self.proxy.stop().await;
                self.group.destroy_group().await;
                self.group_tx.send_replace(None);
                self.set_status(RunningStatus::NotRunning);
                info!("Hotspot stopped");
            }
            other => debug!("Stop ignored; status is {other}"),
        }
    }

    /// Subscribes to status transitions.
    pub fn status(&self) -> watch::Receiver<RunningStatus> {
        self.status_tx.subscribe()
    }

    /// The status right now.
    pub fn current_status(&self) -> RunningStatus {
        self.status_tx.borrow().clone()
    }

    /// Subscribes to the hosted group's connection details.
    pub fn group_info(&self) -> watch::Receiver<Option<NetworkGroupInfo>> {
        self.group_tx.subscribe()
    }

    /// The hosted group's details right now, if any.
    pub fn current_group(&self) -> Option<NetworkGroupInfo> {
        self.group_tx.borrow().clone()
    }

    /// Subscribes to out-of-band server events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    /// The seen/blocked client registry, for display and moderation.
    pub fn clients(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Point-in-time proxy session counters.
    pub fn proxy_stats(&self) -> ProxyStatsSnapshot {
        self.proxy.stats()
    }

    /// True while the proxy listener is up.
    pub async fn proxy_running(&self) -> bool {
        self.proxy.is_running().await
    }

    fn set_status(&self, status: RunningStatus) {
        let previous = self.status_tx.send_replace(status.clone());
        if previous != status {
            info!("Status: {previous} -> {status}");
        }
    }

    /// Continues a start past the synchronous checks: group creation, then
    /// proxy startup against the group's address.
    async fn run_start(self, config: ServerConfig) {
        info!("Requesting wireless group creation");
        let created = self.group.create_group(&config).await;

        let mut inner = self.inner.lock().await;
        if inner.stop_requested {
            inner.stop_requested = false;
            if created.is_ok() {
                self.group.destroy_group().await;
            }
            self.group_tx.send_replace(None);
            self.set_status(RunningStatus::NotRunning);
            info!("Start cancelled by stop request");
            return;
        }

        let info = match created {
            Ok(info) => info,
            Err(e) => {
                error!("Group creation failed: {e}");
                self.set_status(RunningStatus::Error(FailureReason::GroupCreation(
                    e.to_string(),
                )));
                return;
            }
        };

        self.group_tx.send_replace(Some(info.clone()));
        info!(
            "Wireless group ready: ssid={:?} address={}",
            info.ssid, info.local_ip
        );

        match self.proxy.start(info.local_ip, config.port).await {
            Ok(bound) => {
                info!("Proxy serving group clients on {bound}");
                // Subscribe before publishing Running so a loss fired right
                // after startup cannot slip past the monitor.
                let group_events = self.group.subscribe();
                let proxy_fatal = self.proxy.subscribe_fatal();
                inner.monitor_task =
                    Some(tokio::spawn(self.clone().run_monitor(group_events, proxy_fatal)));
                self.set_status(RunningStatus::Running);
            }
            Err(e) => {
                error!("Proxy startup failed: {e}");
                self.group.destroy_group().await;
                self.group_tx.send_replace(None);
                self.set_status(RunningStatus::Error(FailureReason::Bind(e.to_string())));
            }
        }
    }

    /// Watches for group loss and fatal proxy failures while running.
    async fn run_monitor(
        self,
        mut group_events: broadcast::Receiver<GroupEvent>,
        mut proxy_fatal: broadcast::Receiver<String>,
    ) {
        loop {
            tokio::select! {
                event = group_events.recv() => match event {
                    Ok(GroupEvent::Lost(reason)) => {
                        self.handle_group_lost(reason).await;
                        break;
                    }
                    Ok(GroupEvent::Ready(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
                fatal = proxy_fatal.recv() => match fatal {
                    Ok(reason) => {
                        self.handle_proxy_fatal(reason).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
            }
        }
    }

    /// The radio dropped the group out from under a running hotspot.
    async fn handle_group_lost(&self, reason: String) {
        let mut inner = self.inner.lock().await;
        if !self.current_status().is_running() {
            return;
        }
        warn!("Wireless group lost: {reason}");
        inner.monitor_task = None;
        self.set_status(RunningStatus::Stopping);
        self.proxy.stop().await;
        self.group.destroy_group().await;
        self.group_tx.send_replace(None);
        self.set_status(RunningStatus::NotRunning);
        let _ = self.events_tx.send(ServerEvent::Shutdown { reason });
    }

    /// The proxy's listening socket died while running.
    async fn handle_proxy_fatal(&self, reason: String) {
        let mut inner = self.inner.lock().await;
        if !self.current_status().is_running() {
            return;
        }
        error!("Proxy reported fatal failure: {reason}");
        inner.monitor_task = None;
        self.proxy.stop().await;
        self.group.destroy_group().await;
        self.group_tx.send_replace(None);
        self.set_status(RunningStatus::Error(FailureReason::Proxy(reason.clone())));
        let _ = self.events_tx.send(ServerEvent::Shutdown { reason });
    }
}

impl std::fmt::Debug for NetworkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkController")
            .field("status", &self.current_status())
            .field("group", &self.current_group())
            .finish()
    }
}
