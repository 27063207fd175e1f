//! Process-wide pool of container-runtime clients
//!
//! Clients are deduplicated by socket URI so that N applications sharing
//! a daemon share one client and exactly one event-stream subscription.
//! The monitor multiplexes every event to all registered handlers and
//! reconnects with jittered exponential backoff when the stream drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::docker::DockerRuntime;
use crate::runtime::{ContainerRuntime, RuntimeEvent};

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Callback invoked for every event seen on a client's stream.
///
/// Handlers must not block the dispatch task; anything that needs I/O
/// schedules its own task.
pub type EventHandler = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

/// Builds a runtime client for a socket URI. Swappable so tests and
/// non-Docker runtimes can plug in.
pub type RuntimeFactory =
    Box<dyn Fn(&str) -> anyhow::Result<Arc<dyn ContainerRuntime>> + Send + Sync>;

/// One pooled client plus its event monitor.
pub struct RuntimeHandle {
    runtime: Arc<dyn ContainerRuntime>,
    monitor: EventMonitor,
}

impl RuntimeHandle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cancel: CancellationToken) -> Arc<Self> {
        let monitor = EventMonitor::new(runtime.clone(), cancel);
        Arc::new(Self { runtime, monitor })
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    /// Register `handler` for every event on this client's stream.
    /// The first subscription starts the stream task.
    pub fn subscribe(&self, handler: EventHandler) {
        self.monitor.subscribe(handler);
    }
}

/// Deduplicates runtime clients per socket URI.
pub struct RuntimePool {
    clients: DashMap<String, Arc<RuntimeHandle>>,
    factory: RuntimeFactory,
    cancel: CancellationToken,
}

impl RuntimePool {
    /// Pool producing Docker clients.
    pub fn new() -> Self {
        Self::with_factory(Box::new(|uri| {
            Ok(Arc::new(DockerRuntime::connect(uri)?) as Arc<dyn ContainerRuntime>)
        }))
    }

    /// Pool with a custom client factory (tests, alternative runtimes).
    pub fn with_factory(factory: RuntimeFactory) -> Self {
        Self {
            clients: DashMap::new(),
            factory,
            cancel: CancellationToken::new(),
        }
    }

    /// Get or create the client for `socket_uri`. Idempotent; concurrent
    /// callers for the same URI receive the same handle.
    pub fn get_client(&self, socket_uri: &str) -> anyhow::Result<Arc<RuntimeHandle>> {
        if let Some(handle) = self.clients.get(socket_uri) {
            return Ok(handle.clone());
        }

        match self.clients.entry(socket_uri.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let runtime = (self.factory)(socket_uri)?;
                let handle = RuntimeHandle::new(runtime, self.cancel.child_token());
                entry.insert(handle.clone());
                debug!(uri = socket_uri, "created runtime client");
                Ok(handle)
            }
        }
    }

    /// Cancel every event task and drop every client.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.clients.clear();
    }
}

impl Default for RuntimePool {
    fn default() -> Self {
        Self::new()
    }
}

/// One long-lived event-stream task per client, fanned out to all
/// registered handlers.
struct EventMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    handlers: Arc<RwLock<Vec<EventHandler>>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl EventMonitor {
    fn new(runtime: Arc<dyn ContainerRuntime>, cancel: CancellationToken) -> Self {
        Self {
            runtime,
            handlers: Arc::new(RwLock::new(Vec::new())),
            started: AtomicBool::new(false),
            cancel,
        }
    }

    fn subscribe(&self, handler: EventHandler) {
        self.handlers.write().push(handler);
        if !self.started.swap(true, Ordering::SeqCst) {
            self.spawn_stream_task();
        }
    }

    fn spawn_stream_task(&self) {
        let runtime = self.runtime.clone();
        let handlers = self.handlers.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut backoff = BACKOFF_FLOOR;

            loop {
                let mut stream = runtime.monitor_events();
                let mut delivered = false;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("event stream task cancelled");
                            return;
                        }
                        item = stream.next() => match item {
                            Some(Ok(event)) => {
                                delivered = true;
                                let current: Vec<EventHandler> = handlers.read().clone();
                                for handler in &current {
                                    handler(&event);
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "runtime event stream error");
                                break;
                            }
                            None => {
                                warn!("runtime event stream ended");
                                break;
                            }
                        }
                    }
                }

                if delivered {
                    backoff = BACKOFF_FLOOR;
                }

                // Full jitter: sleep uniformly within the current window.
                let cap = backoff.as_millis() as u64;
                let jittered = Duration::from_millis(rand::thread_rng().gen_range(0..=cap));
                debug!(delay_ms = jittered.as_millis() as u64, "reconnecting event stream");

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(jittered) => {}
                }

                backoff = (backoff * 2).min(BACKOFF_CEILING);
            }
        });
    }
}
