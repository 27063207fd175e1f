//! Shared test harness: an in-memory container runtime plus small
//! network helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use snoozegate::activity::ActivityClock;
use snoozegate::app::Application;
use snoozegate::config::{ApplicationConfig, InactiveAction, Protocol};
use snoozegate::lifecycle::LifecycleController;
use snoozegate::pool::RuntimeHandle;
use snoozegate::resolver::{GroupResolver, COMPOSE_PROJECT_LABEL};
use snoozegate::runtime::{ContainerRuntime, ContainerStateInfo, ContainerSummary, RuntimeEvent};

/// One container known to the mock runtime.
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub paused: bool,
    pub health: Option<String>,
}

impl MockContainer {
    pub fn running(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            labels: HashMap::new(),
            running: true,
            paused: false,
            health: None,
        }
    }

    pub fn paused(id: &str, name: &str) -> Self {
        Self {
            paused: true,
            ..Self::running(id, name)
        }
    }

    pub fn stopped(id: &str, name: &str) -> Self {
        Self {
            running: false,
            ..Self::running(id, name)
        }
    }

    pub fn with_project(mut self, project: &str) -> Self {
        self.labels
            .insert(COMPOSE_PROJECT_LABEL.to_string(), project.to_string());
        self
    }

    pub fn with_health(mut self, status: &str) -> Self {
        self.health = Some(status.to_string());
        self
    }
}

/// In-memory runtime recording every lifecycle call.
pub struct MockRuntime {
    containers: Mutex<Vec<MockContainer>>,
    calls: Mutex<Vec<String>>,
    start_result: Mutex<bool>,
    unpause_delay: Mutex<Duration>,
    events_tx: broadcast::Sender<RuntimeEvent>,
}

impl MockRuntime {
    pub fn new(containers: Vec<MockContainer>) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            containers: Mutex::new(containers),
            calls: Mutex::new(Vec::new()),
            start_result: Mutex::new(true),
            unpause_delay: Mutex::new(Duration::ZERO),
            events_tx,
        })
    }

    /// Make `start_container` report "not started".
    pub fn decline_starts(&self) {
        *self.start_result.lock() = false;
    }

    /// Slow down `unpause_container` to widen coalescing windows.
    pub fn set_unpause_delay(&self, delay: Duration) {
        *self.unpause_delay.lock() = delay;
    }

    pub fn set_health(&self, id: &str, status: Option<&str>) {
        if let Some(c) = self.containers.lock().iter_mut().find(|c| c.id == id) {
            c.health = status.map(str::to_string);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    /// Push an event onto every open monitor stream.
    pub fn emit(&self, kind: &str, id: &str, status: &str) {
        let _ = self.events_tx.send(RuntimeEvent {
            kind: kind.to_string(),
            id: id.to_string(),
            status: status.to_string(),
        });
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self, _all: bool) -> anyhow::Result<Vec<ContainerSummary>> {
        self.record("list".to_string());
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> anyhow::Result<ContainerStateInfo> {
        self.record(format!("inspect:{}", id));
        let containers = self.containers.lock();
        let container = containers
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", id))?;
        Ok(ContainerStateInfo {
            running: container.running,
            paused: container.paused,
            health_status: container.health.clone(),
        })
    }

    async fn pause_container(&self, id: &str) -> anyhow::Result<()> {
        self.record(format!("pause:{}", id));
        let mut containers = self.containers.lock();
        let container = containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", id))?;
        container.paused = true;
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> anyhow::Result<()> {
        self.record(format!("unpause:{}", id));
        let delay = *self.unpause_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut containers = self.containers.lock();
        let container = containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", id))?;
        container.paused = false;
        container.running = true;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<bool> {
        self.record(format!("start:{}", id));
        let started = *self.start_result.lock();
        if started {
            let mut containers = self.containers.lock();
            if let Some(container) = containers.iter_mut().find(|c| c.id == id) {
                container.running = true;
                container.paused = false;
            }
        }
        Ok(started)
    }

    async fn stop_container(&self, id: &str) -> anyhow::Result<()> {
        self.record(format!("stop:{}", id));
        let mut containers = self.containers.lock();
        if let Some(container) = containers.iter_mut().find(|c| c.id == id) {
            container.running = false;
            container.paused = false;
        }
        Ok(())
    }

    fn monitor_events(&self) -> BoxStream<'static, anyhow::Result<RuntimeEvent>> {
        let rx = self.events_tx.subscribe();
        futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Application config with fast timings suitable for tests. The idle
/// threshold is long so forwarding tests never suspend by accident.
pub fn app_config(name: &str, protocol: Protocol, listen_port: u16, target_port: u16) -> ApplicationConfig {
    ApplicationConfig {
        socket_uri: "unix:///var/run/docker.sock".to_string(),
        container_name: name.to_string(),
        apply_to_compose_group: true,
        protocol,
        listen_port,
        target_address: "127.0.0.1".to_string(),
        target_port,
        inactive_after: Duration::from_secs(60),
        check_interval: Duration::from_millis(100),
        inactive_action: InactiveAction::Pause,
        startup_delay: Duration::from_millis(20),
        healthcheck_enabled: false,
        healthcheck_interval: Duration::from_millis(25),
    }
}

/// Controller plus its activity clock, without any listeners.
pub fn build_controller(
    runtime: Arc<MockRuntime>,
    config: &ApplicationConfig,
) -> (Arc<LifecycleController>, Arc<ActivityClock>) {
    let resolver = Arc::new(GroupResolver::new(
        runtime.clone() as Arc<dyn ContainerRuntime>,
        config.container_name.clone(),
        config.apply_to_compose_group,
    ));
    let activity = Arc::new(ActivityClock::new());
    let controller = Arc::new(LifecycleController::new(
        config,
        runtime,
        resolver,
        activity.clone(),
    ));
    (controller, activity)
}

/// Full engine wired to the mock runtime.
pub async fn start_engine(config: ApplicationConfig, runtime: Arc<MockRuntime>) -> Application {
    let handle = RuntimeHandle::new(
        runtime as Arc<dyn ContainerRuntime>,
        CancellationToken::new(),
    );
    Application::start(config, handle)
        .await
        .expect("engine starts")
}

/// TCP echo server on an ephemeral port.
pub async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}
