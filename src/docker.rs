//! Docker adapter for the container-runtime abstraction

use std::collections::HashMap;

use anyhow::Context;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{EventMessage, EventMessageTypeEnum, HealthStatusEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::runtime::{ContainerRuntime, ContainerStateInfo, ContainerSummary, RuntimeEvent};

/// Container runtime backed by the Docker Engine API.
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon behind `socket_uri`.
    ///
    /// Accepts `unix:///path/to/docker.sock` or `tcp://host:port`
    /// (`http://` is treated like `tcp://`).
    pub fn connect(socket_uri: &str) -> anyhow::Result<Self> {
        let client = if let Some(path) = socket_uri.strip_prefix("unix://") {
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("cannot connect to Unix socket '{}'", path))?
        } else if socket_uri.starts_with("tcp://") || socket_uri.starts_with("http://") {
            Docker::connect_with_http(socket_uri, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("cannot connect to TCP endpoint '{}'", socket_uri))?
        } else {
            anyhow::bail!(
                "invalid socket uri '{}': expected 'unix:///path/to/socket' or 'tcp://host:port'",
                socket_uri
            )
        };

        debug!(uri = socket_uri, "created Docker client");
        Ok(Self { client })
    }
}

fn health_status(status: HealthStatusEnum) -> Option<String> {
    match status {
        HealthStatusEnum::EMPTY | HealthStatusEnum::NONE => None,
        HealthStatusEnum::STARTING => Some("starting".to_string()),
        HealthStatusEnum::HEALTHY => Some("healthy".to_string()),
        HealthStatusEnum::UNHEALTHY => Some("unhealthy".to_string()),
    }
}

fn event_from_message(message: EventMessage) -> RuntimeEvent {
    let kind = match message.typ {
        Some(EventMessageTypeEnum::CONTAINER) => crate::runtime::EVENT_KIND_CONTAINER.to_string(),
        Some(other) => format!("{:?}", other).to_lowercase(),
        None => String::new(),
    };
    RuntimeEvent {
        kind,
        id: message
            .actor
            .and_then(|actor| actor.id)
            .unwrap_or_default(),
        status: message.action.unwrap_or_default(),
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, all: bool) -> anyhow::Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        let containers = self.client.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                labels: c.labels.unwrap_or_else(HashMap::new),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerStateInfo> {
        let response = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerStateInfo {
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
            health_status: state
                .health
                .and_then(|health| health.status)
                .and_then(health_status),
        })
    }

    async fn pause_container(&self, id: &str) -> anyhow::Result<()> {
        self.client
            .pause_container(id)
            .await
            .with_context(|| format!("failed to pause container {}", id))
    }

    async fn unpause_container(&self, id: &str) -> anyhow::Result<()> {
        self.client
            .unpause_container(id)
            .await
            .with_context(|| format!("failed to unpause container {}", id))
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<bool> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(true),
            // 304: the container was already running
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(id, "container already started");
                Ok(true)
            }
            Err(e) => Err(anyhow::anyhow!("failed to start container {}: {}", id, e)),
        }
    }

    async fn stop_container(&self, id: &str) -> anyhow::Result<()> {
        match self.client.stop_container(id, None::<StopContainerOptions>).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(id, "container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(id, "container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("failed to stop container {}: {}", id, e)),
        }
    }

    fn monitor_events(&self) -> BoxStream<'static, anyhow::Result<RuntimeEvent>> {
        self.client
            .events(None::<EventsOptions<String>>)
            .map(|item| item.map(event_from_message).map_err(anyhow::Error::from))
            .boxed()
    }
}
