//! Narrow container-runtime abstraction
//!
//! The engine depends on this trait only. The Docker adapter lives in
//! [`crate::docker`]; other runtimes (Podman, containerd behind a shim)
//! implement the same surface without touching the core.

use std::collections::HashMap;

use futures::stream::BoxStream;

/// Event type reported for container state changes.
pub const EVENT_KIND_CONTAINER: &str = "container";

/// One entry from a container listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    /// Runtime-reported names, each prefixed with `/`.
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// Inspected container state, reduced to what the lifecycle engine needs.
#[derive(Debug, Clone, Default)]
pub struct ContainerStateInfo {
    pub running: bool,
    pub paused: bool,
    /// Health status reported by the runtime, absent when the container
    /// defines no healthcheck.
    pub health_status: Option<String>,
}

impl ContainerStateInfo {
    /// A container is considered ready when it is running and its
    /// healthcheck (if any) reports healthy.
    pub fn is_ready(&self) -> bool {
        self.running
            && self
                .health_status
                .as_deref()
                .map_or(true, |status| status.is_empty() || status == "healthy")
    }
}

/// A single message from the runtime's event stream.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    /// Event category, e.g. `container`, `image`, `network`.
    pub kind: String,
    /// Id of the object the event refers to.
    pub id: String,
    /// Action string, e.g. `die`, `pause`, `health_status: healthy`.
    pub status: String,
}

/// The porting surface for a container runtime.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List containers; `all` includes stopped ones.
    async fn list_containers(&self, all: bool) -> anyhow::Result<Vec<ContainerSummary>>;

    /// Inspect a single container by id.
    async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerStateInfo>;

    async fn pause_container(&self, id: &str) -> anyhow::Result<()>;

    async fn unpause_container(&self, id: &str) -> anyhow::Result<()>;

    /// Returns false when the runtime reports the container was not started.
    async fn start_container(&self, id: &str) -> anyhow::Result<bool>;

    async fn stop_container(&self, id: &str) -> anyhow::Result<()>;

    /// Open the runtime's event stream. Every call opens a fresh stream;
    /// the caller owns reconnect policy.
    fn monitor_events(&self) -> BoxStream<'static, anyhow::Result<RuntimeEvent>>;
}
