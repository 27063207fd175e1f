//! TCP forwarding plane
//!
//! One accept loop per engine; each accepted connection wakes the
//! container group if needed, dials the target, and runs two copier
//! tasks until either direction finishes. Half-close is not propagated:
//! once one direction completes, both sockets are torn down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::activity::ActivityClock;
use crate::config::ApplicationConfig;
use crate::lifecycle::LifecycleController;

/// Copy buffer per direction.
const COPY_BUF_SIZE: usize = 8 * 1024;

/// Peer resets, aborts and cancellations are a normal end of a flow and
/// not worth a log line.
pub(crate) fn is_quiet_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}

pub struct TcpForwarder {
    listener: TcpListener,
    target: String,
    controller: Arc<LifecycleController>,
    activity: Arc<ActivityClock>,
    /// Doubles as the per-direction read timeout, so a wedged upstream
    /// cannot outlive the inactivity threshold.
    inactive_after: Duration,
    cancel: CancellationToken,
}

impl TcpForwarder {
    /// Bind the listener. A bind failure is fatal for this engine only.
    pub async fn bind(
        config: &ApplicationConfig,
        controller: Arc<LifecycleController>,
        activity: Arc<ActivityClock>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.listen_port))
            .await
            .map_err(|e| {
                anyhow::anyhow!("failed to bind TCP port {}: {}", config.listen_port, e)
            })?;

        info!(
            port = config.listen_port,
            upstream = %config.target(),
            "TCP proxy listening"
        );

        Ok(Self {
            listener,
            target: config.target(),
            controller,
            activity,
            inactive_after: config.inactive_after,
            cancel,
        })
    }

    /// Accept loop; runs until the engine is cancelled.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(upstream = %self.target, "TCP accept loop stopped");
                    return;
                }
                result = self.listener.accept() => match result {
                    Ok((inbound, peer)) => {
                        self.activity.mark();
                        trace!(%peer, "accepted connection");

                        let target = self.target.clone();
                        let controller = self.controller.clone();
                        let activity = self.activity.clone();
                        let cancel = self.cancel.clone();
                        let inactive_after = self.inactive_after;
                        tokio::spawn(async move {
                            handle_connection(
                                inbound,
                                peer,
                                target,
                                controller,
                                activity,
                                inactive_after,
                                cancel,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    inbound: TcpStream,
    peer: std::net::SocketAddr,
    target: String,
    controller: Arc<LifecycleController>,
    activity: Arc<ActivityClock>,
    inactive_after: Duration,
    cancel: CancellationToken,
) {
    // Wake happens-before the first forwarded byte. The inbound socket
    // is dropped (closed) on any failure along the way.
    if !controller.ensure_running(&cancel).await || cancel.is_cancelled() {
        debug!(%peer, "dropping connection, container group not available");
        return;
    }

    let upstream = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, upstream = %target, error = %e, "failed to dial target");
            return;
        }
    };

    let _ = inbound.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    let (inbound_read, inbound_write) = inbound.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut client_to_upstream = tokio::spawn(copy_with_marks(
        inbound_read,
        upstream_write,
        activity.clone(),
        inactive_after,
    ));
    let mut upstream_to_client = tokio::spawn(copy_with_marks(
        upstream_read,
        inbound_write,
        activity.clone(),
        inactive_after,
    ));

    // Either direction finishing ends the flow; aborting the sibling
    // drops its socket halves and closes both connections.
    let result = tokio::select! {
        _ = cancel.cancelled() => {
            client_to_upstream.abort();
            upstream_to_client.abort();
            Ok(Ok(()))
        }
        result = &mut client_to_upstream => {
            upstream_to_client.abort();
            result
        }
        result = &mut upstream_to_client => {
            client_to_upstream.abort();
            result
        }
    };

    match result {
        Ok(Ok(())) => trace!(%peer, "connection closed"),
        Ok(Err(e)) if is_quiet_io_error(&e) => trace!(%peer, error = %e, "connection ended"),
        Ok(Err(e)) => error!(%peer, error = %e, "forwarding error"),
        // JoinError: the task was aborted above.
        Err(_) => {}
    }

    activity.mark();
}

/// Copy one direction with an 8 KiB buffer, flushing and marking
/// activity after every write. Both the read and the write side are
/// bounded by `idle_timeout`, so neither a silent peer nor one that
/// stops draining its receive window can outlive the threshold.
async fn copy_with_marks<R, W>(
    mut reader: R,
    mut writer: W,
    activity: Arc<ActivityClock>,
    idle_timeout: Duration,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];

    loop {
        let n = match tokio::time::timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no traffic within the inactivity threshold",
                ))
            }
        };
        if n == 0 {
            return Ok(());
        }

        let write = async {
            writer.write_all(&buf[..n]).await?;
            writer.flush().await
        };
        match tokio::time::timeout(idle_timeout, write).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stopped draining within the inactivity threshold",
                ))
            }
        }
        trace!(bytes = n, "copied chunk");
        activity.mark();
    }
}
