//! Application engine wiring
//!
//! One [`Application`] per configured entry: it builds the resolver,
//! activity clock and lifecycle controller, subscribes to the pooled
//! client's event stream, and spawns the listener plus the inactivity
//! timer under a shared cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::activity::ActivityClock;
use crate::config::{ApplicationConfig, Protocol};
use crate::events;
use crate::lifecycle::LifecycleController;
use crate::pool::RuntimeHandle;
use crate::resolver::GroupResolver;
use crate::tcp::TcpForwarder;
use crate::udp::UdpForwarder;

/// One running engine.
pub struct Application {
    container_name: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Application {
    /// Build and start the engine. Fails only on listener bind errors;
    /// runtime trouble is handled at the first wake instead.
    pub async fn start(
        config: ApplicationConfig,
        client: Arc<RuntimeHandle>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let runtime = client.runtime();
        let resolver = Arc::new(GroupResolver::new(
            runtime.clone(),
            config.container_name.clone(),
            config.apply_to_compose_group,
        ));
        let activity = Arc::new(ActivityClock::new());
        let controller = Arc::new(LifecycleController::new(
            &config,
            runtime,
            resolver,
            activity.clone(),
        ));

        // Bind first so a busy port fails the engine before any
        // background work starts.
        let mut tasks = Vec::new();
        match config.protocol {
            Protocol::Tcp => {
                let forwarder = TcpForwarder::bind(
                    &config,
                    controller.clone(),
                    activity.clone(),
                    cancel.child_token(),
                )
                .await?;
                tasks.push(tokio::spawn(forwarder.run()));
            }
            Protocol::Udp => {
                let forwarder = UdpForwarder::bind(
                    &config,
                    controller.clone(),
                    activity.clone(),
                    cancel.child_token(),
                )
                .await?;
                tasks.push(tokio::spawn(forwarder.run()));
            }
        }

        client.subscribe(events::subscription_handler(
            controller.clone(),
            cancel.child_token(),
        ));

        tasks.push(tokio::spawn(activity_check_loop(
            controller,
            config.check_interval,
            cancel.child_token(),
        )));

        info!(
            container = %config.container_name,
            protocol = %config.protocol,
            listen_port = config.listen_port,
            upstream = %config.target(),
            "application engine started"
        );

        Ok(Self {
            container_name: config.container_name,
            cancel,
            tasks,
        })
    }

    /// Cancel all engine tasks and wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(container = %self.container_name, "application engine stopped");
    }
}

async fn activity_check_loop(
    controller: Arc<LifecycleController>,
    check_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(check_interval) => {
                controller.do_activity_check().await;
            }
        }
    }
}
