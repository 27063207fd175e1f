//! Expands a configured container name into the group of ids to act upon

use std::sync::Arc;

use tracing::{debug, warn};

use crate::runtime::ContainerRuntime;

/// Compose attaches this label to every container of a project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Resolves the configured container name to the ordered id list the
/// lifecycle controller suspends and wakes. The base container comes
/// first; when group-apply is enabled, every container sharing its
/// compose-project label follows.
pub struct GroupResolver {
    runtime: Arc<dyn ContainerRuntime>,
    container_name: String,
    apply_to_compose_group: bool,
}

impl GroupResolver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container_name: impl Into<String>,
        apply_to_compose_group: bool,
    ) -> Self {
        Self {
            runtime,
            container_name: container_name.into(),
            apply_to_compose_group,
        }
    }

    /// Resolve the current group. An empty result means no container
    /// matches the configured name right now.
    pub async fn resolve(&self) -> anyhow::Result<Vec<String>> {
        let containers = self.runtime.list_containers(true).await?;

        // Runtime names carry a leading slash.
        let needle = format!("/{}", self.container_name);
        let Some(base) = containers
            .iter()
            .find(|c| c.names.iter().any(|name| name.contains(&needle)))
        else {
            warn!(
                container = %self.container_name,
                "no container matches configured name"
            );
            return Ok(Vec::new());
        };

        let mut ids = vec![base.id.clone()];

        if self.apply_to_compose_group {
            if let Some(project) = base
                .labels
                .get(COMPOSE_PROJECT_LABEL)
                .filter(|project| !project.is_empty())
            {
                for container in &containers {
                    if container.id != base.id
                        && container.labels.get(COMPOSE_PROJECT_LABEL) == Some(project)
                    {
                        ids.push(container.id.clone());
                    }
                }
                debug!(
                    container = %self.container_name,
                    project = %project,
                    members = ids.len(),
                    "resolved compose group"
                );
            }
        }

        Ok(ids)
    }

    /// Whether `id` belongs to the engine's container group. Listing
    /// failures count as "not a member"; the next event retries.
    pub async fn contains(&self, id: &str) -> bool {
        match self.resolve().await {
            Ok(ids) => ids.iter().any(|candidate| candidate == id),
            Err(e) => {
                debug!(error = %e, "group resolution failed during membership check");
                false
            }
        }
    }
}
