//! UDP forwarding plane
//!
//! Datagram traffic has no connections, so the forwarder tracks one
//! flow per remote peer: a dedicated upstream socket plus a response
//! pump feeding replies back through the listener socket. Flows that
//! stay silent past the inactivity threshold are garbage collected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::activity::ActivityClock;
use crate::config::ApplicationConfig;
use crate::lifecycle::LifecycleController;
use crate::tcp::is_quiet_io_error;

/// Largest possible UDP payload.
const DATAGRAM_BUF_SIZE: usize = 64 * 1024;

/// Per-peer forwarding state.
struct UdpFlow {
    peer: SocketAddr,
    upstream: UdpSocket,
    last_seen: Mutex<Instant>,
    cancel: CancellationToken,
}

impl UdpFlow {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

pub struct UdpForwarder {
    socket: Arc<UdpSocket>,
    target: String,
    controller: Arc<LifecycleController>,
    activity: Arc<ActivityClock>,
    inactive_after: Duration,
    check_interval: Duration,
    cancel: CancellationToken,
    flows: Arc<DashMap<SocketAddr, Arc<UdpFlow>>>,
}

impl UdpForwarder {
    /// Bind the listener socket. A bind failure is fatal for this
    /// engine only.
    pub async fn bind(
        config: &ApplicationConfig,
        controller: Arc<LifecycleController>,
        activity: Arc<ActivityClock>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.listen_port))
            .await
            .map_err(|e| {
                anyhow::anyhow!("failed to bind UDP port {}: {}", config.listen_port, e)
            })?;
        socket.set_broadcast(true)?;
        socket.set_ttl(255)?;

        info!(
            port = config.listen_port,
            upstream = %config.target(),
            "UDP proxy listening"
        );

        Ok(Self {
            socket: Arc::new(socket),
            target: config.target(),
            controller,
            activity,
            inactive_after: config.inactive_after,
            check_interval: config.check_interval,
            cancel,
            flows: Arc::new(DashMap::new()),
        })
    }

    /// Receive loop; runs until the engine is cancelled.
    pub async fn run(self) {
        self.spawn_flow_gc();

        let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(upstream = %self.target, "UDP receive loop stopped");
                    self.dispose_flows();
                    return;
                }
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, peer)) => {
                        self.activity.mark();

                        // Datagrams arriving during a wake are held only
                        // by this await; the OS buffers behind us.
                        if !self.controller.ensure_running(&self.cancel).await {
                            debug!(%peer, "dropping datagram, container group not available");
                            continue;
                        }

                        let flow = match self.flow_for(peer).await {
                            Ok(flow) => flow,
                            Err(e) => {
                                warn!(%peer, error = %e, "failed to open upstream flow");
                                continue;
                            }
                        };

                        flow.touch();
                        trace!(%peer, bytes = len, "forwarding datagram");
                        if let Err(e) = flow.upstream.send(&buf[..len]).await {
                            warn!(%peer, error = %e, "upstream send failed, discarding flow");
                            self.remove_flow(&peer);
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "udp receive error");
                    }
                }
            }
        }
    }

    /// Look up the peer's flow, creating it (and its response pump) on
    /// first contact.
    async fn flow_for(&self, peer: SocketAddr) -> anyhow::Result<Arc<UdpFlow>> {
        if let Some(flow) = self.flows.get(&peer) {
            return Ok(flow.clone());
        }

        let upstream = UdpSocket::bind(("0.0.0.0", 0)).await?;
        upstream.set_broadcast(true)?;
        upstream.set_ttl(255)?;
        upstream.connect(&self.target).await?;

        let flow = Arc::new(UdpFlow {
            peer,
            upstream,
            last_seen: Mutex::new(Instant::now()),
            cancel: self.cancel.child_token(),
        });
        self.flows.insert(peer, flow.clone());
        debug!(%peer, upstream = %self.target, "new udp flow");

        tokio::spawn(response_pump(
            flow.clone(),
            self.socket.clone(),
            self.activity.clone(),
        ));

        Ok(flow)
    }

    fn remove_flow(&self, peer: &SocketAddr) {
        if let Some((_, flow)) = self.flows.remove(peer) {
            flow.cancel.cancel();
        }
    }

    fn dispose_flows(&self) {
        for entry in self.flows.iter() {
            entry.value().cancel.cancel();
        }
        self.flows.clear();
    }

    /// Reap flows whose peers have gone silent.
    fn spawn_flow_gc(&self) {
        let flows = self.flows.clone();
        let cancel = self.cancel.clone();
        let check_interval = self.check_interval;
        let inactive_after = self.inactive_after;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(check_interval) => {}
                }

                let expired: Vec<SocketAddr> = flows
                    .iter()
                    .filter(|entry| entry.value().idle_for() > inactive_after)
                    .map(|entry| *entry.key())
                    .collect();

                for peer in expired {
                    if let Some((_, flow)) = flows.remove(&peer) {
                        debug!(%peer, "expiring idle udp flow");
                        flow.cancel.cancel();
                    }
                }
            }
        });
    }
}

/// One per flow: shuttle upstream responses back to the peer through
/// the listener socket. Ends when the flow is cancelled or the upstream
/// socket fails.
async fn response_pump(flow: Arc<UdpFlow>, listener: Arc<UdpSocket>, activity: Arc<ActivityClock>) {
    let mut buf = vec![0u8; DATAGRAM_BUF_SIZE];

    loop {
        tokio::select! {
            _ = flow.cancel.cancelled() => {
                trace!(peer = %flow.peer, "response pump stopped");
                return;
            }
            result = flow.upstream.recv(&mut buf) => match result {
                Ok(len) => {
                    trace!(peer = %flow.peer, bytes = len, "upstream response");
                    flow.touch();
                    activity.mark();
                    if let Err(e) = listener.send_to(&buf[..len], flow.peer).await {
                        if !is_quiet_io_error(&e) {
                            warn!(peer = %flow.peer, error = %e, "failed to relay response");
                        }
                        return;
                    }
                }
                Err(e) => {
                    if !is_quiet_io_error(&e) {
                        warn!(peer = %flow.peer, error = %e, "upstream receive failed");
                    }
                    return;
                }
            }
        }
    }
}
