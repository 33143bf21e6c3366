//! Proxy manager: listening socket, session dispatch, and shutdown.
//!
//! The manager owns the listening socket exclusively. Each accepted
//! connection becomes a session task gated behind a FIFO semaphore, so a
//! connection storm queues behind the ceiling instead of spawning without
//! bound. Stopping signals every in-flight session, waits out a bounded
//! grace period, and force-closes whatever remains.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use hotspan_core::{ClientRegistry, FixerPipeline};

use crate::error::{ProxyError, Result, SessionError};
use crate::session::ProxySession;

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_CEILING_CAP: usize = 32;

/// Consecutive accept failures before the listening socket is declared
/// unusable.
const MAX_ACCEPT_FAILURES: u32 = 3;

/// Session ceiling for this host: four sessions per core, capped at 32, so a
/// burst of joining devices cannot starve the rest of the system.
pub fn default_session_ceiling() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cores * 4).min(SESSION_CEILING_CAP)
}

/// Counters for the lifetime of one manager.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Connections accepted off the listener.
    pub accepted: AtomicU64,
    /// Sessions currently holding a pool slot.
    pub active: AtomicU64,
    /// Sessions that relayed to completion.
    pub completed: AtomicU64,
    /// Sessions rejected before relaying (malformed, blocked, unreachable).
    pub rejected: AtomicU64,
    /// Sessions that died mid-relay on an I/O error.
    pub failed: AtomicU64,
    /// Sessions terminated by shutdown while still relaying.
    pub forced_closed: AtomicU64,
}

impl ProxyStats {
    /// Takes a point-in-time copy of every counter.
    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            forced_closed: self.forced_closed.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProxyStatsSnapshot {
    /// Connections accepted off the listener.
    pub accepted: u64,
    /// Sessions currently holding a pool slot.
    pub active: u64,
    /// Sessions that relayed to completion.
    pub completed: u64,
    /// Sessions rejected before relaying.
    pub rejected: u64,
    /// Sessions that died mid-relay.
    pub failed: u64,
    /// Sessions terminated by shutdown.
    pub forced_closed: u64,
}

/// RAII guard for the active-session counter; decrements on drop so even an
/// aborted session task leaves the count right.
struct ActiveGuard {
    stats: Arc<ProxyStats>,
}

impl ActiveGuard {
    fn new(stats: Arc<ProxyStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

struct RunningProxy {
    requested: (IpAddr, u16),
    bound: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    accept_task: tokio::task::JoinHandle<()>,
}

/// Accepts client connections and runs each one as a bounded session.
pub struct ProxyManager {
    registry: ClientRegistry,
    fixers: Arc<FixerPipeline>,
    session_ceiling: usize,
    grace_period: Duration,
    connect_timeout: Duration,
    stats: Arc<ProxyStats>,
    fatal_tx: broadcast::Sender<String>,
    inner: Mutex<Option<RunningProxy>>,
}

impl ProxyManager {
    /// Creates a stopped manager sharing the given registry and fixers.
    pub fn new(registry: ClientRegistry, fixers: FixerPipeline) -> Self {
        let (fatal_tx, _) = broadcast::channel(4);
        Self {
            registry,
            fixers: Arc::new(fixers),
            session_ceiling: default_session_ceiling(),
            grace_period: DEFAULT_GRACE_PERIOD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stats: Arc::new(ProxyStats::default()),
            fatal_tx,
            inner: Mutex::new(None),
        }
    }

    /// Overrides the simultaneous-session ceiling.
    #[must_use]
    pub fn with_session_ceiling(mut self, ceiling: usize) -> Self {
        self.session_ceiling = ceiling.max(1);
        self
    }

    /// Overrides how long stop waits for sessions to drain.
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Overrides the upstream connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Binds the listener and starts accepting.
    ///
    /// Idempotent for a repeated start on the same address and port;
    /// returns [`ProxyError::AlreadyRunning`] for any other address while
    /// running, and [`ProxyError::Bind`] if the port is taken.
    pub async fn start(&self, ip: IpAddr, port: u16) -> Result<SocketAddr> {
        let mut inner = self.inner.lock().await;
        if let Some(running) = inner.as_ref() {
            if running.requested == (ip, port) {
                debug!("Proxy start ignored; already serving {}", running.bound);
                return Ok(running.bound);
            }
            return Err(ProxyError::AlreadyRunning(running.bound));
        }

        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ProxyError::Bind { addr, source })?;

        let (shutdown_tx, _) = broadcast::channel(16);
        let accept = AcceptLoop {
            listener,
            shutdown_tx: shutdown_tx.clone(),
            registry: self.registry.clone(),
            fixers: self.fixers.clone(),
            session_ceiling: self.session_ceiling,
            grace_period: self.grace_period,
            connect_timeout: self.connect_timeout,
            stats: self.stats.clone(),
            fatal_tx: self.fatal_tx.clone(),
        };
        let accept_task = tokio::spawn(accept.run());

        info!(
            "Proxy listening on {} (session ceiling {})",
            bound, self.session_ceiling
        );
        *inner = Some(RunningProxy {
            requested: (ip, port),
            bound,
            shutdown_tx,
            accept_task,
        });
        Ok(bound)
    }

    /// Stops accepting, signals every session, drains within the grace
    /// period, and force-closes the rest. Always lands stopped.
    pub async fn stop(&self) {
        let running = self.inner.lock().await.take();
        let Some(running) = running else {
            debug!("Proxy stop ignored; not running");
            return;
        };

        info!("Stopping proxy on {}", running.bound);
        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.accept_task.await {
            warn!("Accept loop ended abnormally: {e}");
        }
        info!("Proxy stopped");
    }

    /// Returns true while the listener is up.
    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// The address the listener is bound to, if running.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().await.as_ref().map(|r| r.bound)
    }

    /// Point-in-time session counters.
    pub fn stats(&self) -> ProxyStatsSnapshot {
        self.stats.snapshot()
    }

    /// Subscribe to fatal listener failures.
    ///
    /// A message on this channel means the listening socket became unusable
    /// and the manager shut itself down.
    pub fn subscribe_fatal(&self) -> broadcast::Receiver<String> {
        self.fatal_tx.subscribe()
    }
}

impl std::fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyManager")
            .field("session_ceiling", &self.session_ceiling)
            .field("grace_period", &self.grace_period)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

struct AcceptLoop {
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
    registry: ClientRegistry,
    fixers: Arc<FixerPipeline>,
    session_ceiling: usize,
    grace_period: Duration,
    connect_timeout: Duration,
    stats: Arc<ProxyStats>,
    fatal_tx: broadcast::Sender<String>,
}

impl AcceptLoop {
    async fn run(self) {
        let semaphore = Arc::new(Semaphore::new(self.session_ceiling));
        let mut sessions: JoinSet<()> = JoinSet::new();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut accept_failures = 0u32;

        let fatal: Option<String> = loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        accept_failures = 0;
                        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                        debug!("Accepted connection from {peer}");
                        self.spawn_session(&mut sessions, &semaphore, stream, peer);
                    }
                    Err(e) => {
                        accept_failures += 1;
                        warn!("Accept failed ({accept_failures}/{MAX_ACCEPT_FAILURES}): {e}");
                        if accept_failures >= MAX_ACCEPT_FAILURES {
                            break Some(e.to_string());
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_rx.recv() => break None,
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        };

        // No new connections past this point.
        drop(self.listener);

        if let Some(reason) = fatal {
            error!("Listening socket unusable: {reason}");
            let _ = self.shutdown_tx.send(());
            let _ = self.fatal_tx.send(reason);
        }

        let drain = async {
            while sessions.join_next().await.is_some() {}
        };
        if timeout(self.grace_period, drain).await.is_err() {
            warn!(
                "Forcing close of {} sessions after {:?} grace period",
                sessions.len(),
                self.grace_period
            );
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }
    }

    fn spawn_session(
        &self,
        sessions: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
    ) {
        let semaphore = Arc::clone(semaphore);
        let mut queue_shutdown = self.shutdown_tx.subscribe();
        let session_shutdown = self.shutdown_tx.subscribe();
        let registry = self.registry.clone();
        let fixers = self.fixers.clone();
        let connect_timeout = self.connect_timeout;
        let stats = self.stats.clone();

        sessions.spawn(async move {
            // Queue behind the ceiling; the semaphore hands out permits in
            // accept order.
            let _permit = tokio::select! {
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
                _ = queue_shutdown.recv() => return,
            };

            let _active = ActiveGuard::new(stats.clone());
            let session = ProxySession::new(
                stream,
                peer,
                registry,
                fixers,
                connect_timeout,
                session_shutdown,
            );
            match session.run().await {
                Ok(summary) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Session from {peer} relayed {} out / {} in",
                        summary.report.proxy_to_internet, summary.report.internet_to_proxy
                    );
                }
                Err(SessionError::Cancelled) => {
                    stats.forced_closed.fetch_add(1, Ordering::Relaxed);
                    warn!("Session from {peer} closed by proxy shutdown");
                }
                Err(err @ SessionError::ClientBlocked(_)) => {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                    info!("Rejected session from {peer}: {err}");
                }
                Err(err @ (SessionError::MalformedRequest(_)
                    | SessionError::UpstreamUnreachable { .. })) => {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!("Rejected session from {peer}: {err}");
                }
                Err(err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    debug!("Session from {peer} ended with error: {err}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::Notify;

    use hotspan_core::ByteTransferReport;
    use hotspan_core::ClientIdentity;

    const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

    fn test_manager() -> ProxyManager {
        ProxyManager::new(ClientRegistry::new(), FixerPipeline::standard())
            .with_grace_period(Duration::from_millis(500))
            .with_connect_timeout(Duration::from_secs(2))
    }

    /// Upstream that answers any request head with a fixed body and tracks
    /// concurrency.
    async fn spawn_upstream(
        body: &'static [u8],
    ) -> (SocketAddr, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let active_clone = active.clone();
        let peak_clone = peak.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let active = active_clone.clone();
                let peak = peak_clone.clone();
                tokio::spawn(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    // Read whatever arrives until the client closes, then
                    // answer and hang up.
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    let _ = stream.write_all(body).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        (addr, active, peak)
    }

    #[tokio::test]
    async fn start_binds_and_stop_releases() {
        let manager = test_manager();
        let bound = manager.start(LOCALHOST, 0).await.unwrap();
        assert!(manager.is_running().await);
        assert_eq!(manager.bound_addr().await, Some(bound));

        manager.stop().await;
        assert!(!manager.is_running().await);
        assert!(TcpStream::connect(bound).await.is_err());
    }

    #[tokio::test]
    async fn start_twice_same_addr_is_idempotent() {
        let manager = test_manager();
        let bound = manager.start(LOCALHOST, 0).await.unwrap();
        let again = manager.start(LOCALHOST, 0).await.unwrap();
        assert_eq!(bound, again);
        manager.stop().await;
    }

    #[tokio::test]
    async fn start_on_other_port_fails_already_running() {
        let manager = test_manager();
        let bound = manager.start(LOCALHOST, 0).await.unwrap();
        let err = manager.start(LOCALHOST, bound.port()).await.unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyRunning(addr) if addr == bound));
        manager.stop().await;
    }

    #[tokio::test]
    async fn start_on_taken_port_is_bind_error() {
        let occupied = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let manager = test_manager();
        let err = manager.start(LOCALHOST, port).await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert!(!manager.is_running().await);
    }

    #[tokio::test]
    async fn stop_then_start_can_reuse_port() {
        let manager = test_manager();
        let bound = manager.start(LOCALHOST, 0).await.unwrap();
        let port = bound.port();
        manager.stop().await;

        let again = manager.start(LOCALHOST, port).await.unwrap();
        assert_eq!(again.port(), port);
        manager.stop().await;
    }

    #[tokio::test]
    async fn connect_tunnel_records_byte_report() {
        let (upstream, _, _) = spawn_upstream(&[7u8; 30000]).await;
        let registry = ClientRegistry::new();
        let manager = ProxyManager::new(registry.clone(), FixerPipeline::standard())
            .with_grace_period(Duration::from_millis(500));
        let bound = manager.start(LOCALHOST, 0).await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        client
            .write_all(format!("CONNECT {upstream} HTTP/1.1\r\nHost: {upstream}\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut status = [0u8; 39];
        client.read_exact(&mut status).await.unwrap();
        assert!(status.starts_with(b"HTTP/1.1 200"));

        client.write_all(&[1u8; 1500]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut body = Vec::new();
        client.read_to_end(&mut body).await.unwrap();
        assert_eq!(body.len(), 30000);

        // The session records its report after the relay finishes.
        let identity = ClientIdentity::Ip(LOCALHOST);
        let mut recorded = None;
        for _ in 0..50 {
            if let Some(client) = registry.get(&identity) {
                recorded = Some(client);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let recorded = recorded.expect("session never recorded a report");
        assert_eq!(
            recorded.total_bytes,
            ByteTransferReport::new(30000, 1500)
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn blocked_client_gets_403_and_no_report() {
        let registry = ClientRegistry::new();
        registry.block(&ClientIdentity::Ip(LOCALHOST));
        let manager = ProxyManager::new(registry.clone(), FixerPipeline::standard());
        let bound = manager.start(LOCALHOST, 0).await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 403"));
        assert_eq!(registry.seen_count(), 0);

        manager.stop().await;
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let manager = test_manager();
        let bound = manager.start(LOCALHOST, 0).await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn unreachable_upstream_gets_502() {
        let manager = test_manager();
        let bound = manager.start(LOCALHOST, 0).await.unwrap();

        // A listener we immediately drop leaves a port nothing answers on.
        let dead = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let mut client = TcpStream::connect(bound).await.unwrap();
        client
            .write_all(format!("CONNECT {dead_addr} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 502"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn forwards_plain_http_request() {
        let (upstream, _, _) = spawn_upstream(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let registry = ClientRegistry::new();
        let manager = ProxyManager::new(registry.clone(), FixerPipeline::standard());
        let bound = manager.start(LOCALHOST, 0).await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        let request = format!(
            "GET http://{upstream}/status HTTP/1.1\r\nHost: {upstream}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 204"));

        manager.stop().await;
    }

    #[tokio::test]
    async fn session_ceiling_bounds_concurrent_relays() {
        let (upstream, _active, peak) = spawn_upstream(b"done").await;
        let hold = Arc::new(Notify::new());

        let manager = ProxyManager::new(ClientRegistry::new(), FixerPipeline::standard())
            .with_session_ceiling(2)
            .with_grace_period(Duration::from_millis(500));
        let bound = manager.start(LOCALHOST, 0).await.unwrap();

        // Four clients tunnel at once; only two may hold a pool slot.
        let mut clients = Vec::new();
        for _ in 0..4 {
            let hold = hold.clone();
            clients.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(bound).await.unwrap();
                client
                    .write_all(
                        format!("CONNECT {upstream} HTTP/1.1\r\n\r\n").as_bytes(),
                    )
                    .await
                    .unwrap();
                // Hold the tunnel open until the test releases everyone.
                hold.notified().await;
                client.shutdown().await.unwrap();
                let mut sink = Vec::new();
                let _ = client.read_to_end(&mut sink).await;
            }));
        }

        // Give the pool time to admit as many sessions as it ever will.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "ceiling exceeded: peak {}",
            peak.load(Ordering::SeqCst)
        );

        hold.notify_waiters();
        for client in clients {
            client.await.unwrap();
        }

        // Everyone is eventually served.
        let mut served = 0;
        for _ in 0..50 {
            served = manager.stats().completed + manager.stats().forced_closed;
            if served >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(served >= 4, "only {served} sessions finished");

        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_force_closes_stuck_sessions() {
        let (upstream, _, _) = spawn_upstream(b"never").await;
        let manager = ProxyManager::new(ClientRegistry::new(), FixerPipeline::standard())
            .with_grace_period(Duration::from_millis(200));
        let bound = manager.start(LOCALHOST, 0).await.unwrap();

        let mut client = TcpStream::connect(bound).await.unwrap();
        client
            .write_all(format!("CONNECT {upstream} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut status = [0u8; 39];
        client.read_exact(&mut status).await.unwrap();

        // Client keeps the tunnel open; stop must still complete.
        manager.stop().await;
        assert!(!manager.is_running().await);
        assert!(manager.stats().forced_closed >= 1);
    }

    #[test]
    fn default_ceiling_is_capped() {
        let ceiling = default_session_ceiling();
        assert!(ceiling >= 1);
        assert!(ceiling <= SESSION_CEILING_CAP);
    }

    #[test]
    fn stats_snapshot_serialization() {
        let stats = ProxyStats::default();
        stats.accepted.fetch_add(5, Ordering::Relaxed);
        stats.completed.fetch_add(3, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: ProxyStatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.accepted, 5);
        assert_eq!(back.completed, 3);
        assert_eq!(back.active, 0);
    }
}
