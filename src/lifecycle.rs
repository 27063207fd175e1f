//! Container lifecycle controller
//!
//! Keeps the engine's `is_inactive` view aligned with observed traffic
//! and guarantees that at most one wake operation runs per engine.
//! Concurrent callers of [`LifecycleController::ensure_running`] join
//! the in-flight wake instead of issuing their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activity::ActivityClock;
use crate::config::{ApplicationConfig, InactiveAction};
use crate::resolver::GroupResolver;
use crate::runtime::{ContainerRuntime, RuntimeEvent};

/// Hard cap on how long a wake waits for the healthcheck to pass.
const HEALTHCHECK_WAIT_CAP: Duration = Duration::from_secs(5 * 60);

/// Per-engine lifecycle state, mutated under one lock so that the
/// single-flight install and clear are atomic with respect to each other.
struct EngineState {
    /// True while the engine believes the container group is suspended
    /// or not running.
    is_inactive: bool,
    /// Present while a wake cycle is in progress; waiters subscribe to
    /// receive the final outcome.
    wake_in_flight: Option<broadcast::Sender<bool>>,
}

pub struct LifecycleController {
    container_name: String,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<GroupResolver>,
    activity: Arc<ActivityClock>,
    inactive_after: Duration,
    inactive_action: InactiveAction,
    startup_delay: Duration,
    healthcheck_enabled: bool,
    healthcheck_interval: Duration,
    state: Mutex<EngineState>,
}

enum WakeRole {
    Master(broadcast::Sender<bool>),
    Waiter(broadcast::Receiver<bool>),
}

impl LifecycleController {
    pub fn new(
        config: &ApplicationConfig,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<GroupResolver>,
        activity: Arc<ActivityClock>,
    ) -> Self {
        Self {
            container_name: config.container_name.clone(),
            runtime,
            resolver,
            activity,
            inactive_after: config.inactive_after,
            inactive_action: config.inactive_action,
            startup_delay: config.startup_delay,
            healthcheck_enabled: config.healthcheck_enabled,
            healthcheck_interval: config.healthcheck_interval,
            state: Mutex::new(EngineState {
                // Until verified by the first wake, the group is treated
                // as suspended.
                is_inactive: true,
                wake_in_flight: None,
            }),
        }
    }

    /// Current belief about the container group.
    pub fn is_inactive(&self) -> bool {
        self.state.lock().is_inactive
    }

    /// Make sure the container group is live before forwarding.
    ///
    /// Returns true iff traffic may flow. The first caller of a wake
    /// cycle becomes its master and performs the runtime operations;
    /// everyone else awaits the master's outcome. A cancelled waiter
    /// stops waiting, but the master always completes the cycle for
    /// whoever is still interested.
    pub async fn ensure_running(&self, cancel: &CancellationToken) -> bool {
        let role = {
            let mut state = self.state.lock();
            if !state.is_inactive {
                return true;
            }
            match &state.wake_in_flight {
                Some(tx) => WakeRole::Waiter(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    state.wake_in_flight = Some(tx.clone());
                    WakeRole::Master(tx)
                }
            }
        };

        match role {
            WakeRole::Waiter(mut rx) => {
                tokio::select! {
                    _ = cancel.cancelled() => false,
                    result = rx.recv() => result.unwrap_or(false),
                }
            }
            WakeRole::Master(tx) => {
                info!(container = %self.container_name, "waking container group");
                let woke = self.wake().await;

                let mut state = self.state.lock();
                if woke {
                    state.is_inactive = false;
                }
                let _ = tx.send(woke);
                state.wake_in_flight = None;
                woke
            }
        }
    }

    /// Unpause or start every container of the group, wait out the
    /// startup delay, then optionally wait for the healthcheck.
    async fn wake(&self) -> bool {
        let ids = match self.resolver.resolve().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    container = %self.container_name,
                    error = %e,
                    "group resolution failed, wake aborted"
                );
                return false;
            }
        };
        if ids.is_empty() {
            warn!(container = %self.container_name, "no containers to wake");
            return false;
        }

        let mut acted = false;
        for id in &ids {
            let state = match self.runtime.inspect_container(id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        container = %self.container_name,
                        id = %id,
                        error = %e,
                        "inspect failed during wake"
                    );
                    return false;
                }
            };

            if state.paused {
                if let Err(e) = self.runtime.unpause_container(id).await {
                    warn!(container = %self.container_name, id = %id, error = %e, "unpause failed");
                    return false;
                }
                debug!(container = %self.container_name, id = %id, "unpaused container");
                acted = true;
            } else if !state.running {
                match self.runtime.start_container(id).await {
                    Ok(true) => {
                        debug!(container = %self.container_name, id = %id, "started container");
                        acted = true;
                    }
                    Ok(false) => {
                        warn!(
                            container = %self.container_name,
                            id = %id,
                            "runtime reports container not started"
                        );
                        return false;
                    }
                    Err(e) => {
                        warn!(container = %self.container_name, id = %id, error = %e, "start failed");
                        return false;
                    }
                }
            }
        }

        if acted {
            tokio::time::sleep(self.startup_delay).await;
        }

        if self.healthcheck_enabled && !self.await_healthy(&ids[0]).await {
            return false;
        }

        true
    }

    /// Poll the base container's inspect result until it is running and
    /// healthy, up to [`HEALTHCHECK_WAIT_CAP`].
    async fn await_healthy(&self, id: &str) -> bool {
        let deadline = Instant::now() + HEALTHCHECK_WAIT_CAP;

        loop {
            match self.runtime.inspect_container(id).await {
                Ok(state) if state.is_ready() => {
                    debug!(container = %self.container_name, "healthcheck passed");
                    return true;
                }
                Ok(state) => {
                    debug!(
                        container = %self.container_name,
                        status = ?state.health_status,
                        "waiting for container to become healthy"
                    );
                }
                Err(e) => {
                    debug!(container = %self.container_name, error = %e, "healthcheck inspect failed");
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    container = %self.container_name,
                    "container did not become healthy within the wait cap"
                );
                return false;
            }

            tokio::time::sleep(self.healthcheck_interval).await;
        }
    }

    /// Inactivity timer body, invoked every check interval.
    ///
    /// Suspends the group once no traffic has been seen for the
    /// configured threshold. The suspend is issued even when the group
    /// is already believed inactive, to reconcile against external
    /// actors restarting containers behind the proxy's back; restarting
    /// the activity clock bounds how often that re-assertion runs.
    pub async fn do_activity_check(&self) {
        if self.activity.elapsed() < self.inactive_after {
            return;
        }

        let ids = match self.resolver.resolve().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(
                    container = %self.container_name,
                    error = %e,
                    "group resolution failed, skipping suspend cycle"
                );
                return;
            }
        };

        let was_inactive = self.state.lock().is_inactive;
        if was_inactive {
            debug!(container = %self.container_name, "re-asserting suspended container group");
        } else {
            info!(
                container = %self.container_name,
                idle_secs = self.activity.elapsed().as_secs(),
                action = %self.inactive_action,
                "suspending idle container group"
            );
        }

        for id in &ids {
            let result = match self.inactive_action {
                InactiveAction::Pause => self.runtime.pause_container(id).await,
                InactiveAction::Stop => self.runtime.stop_container(id).await,
            };
            if let Err(e) = result {
                warn!(
                    container = %self.container_name,
                    id = %id,
                    error = %e,
                    "suspend action failed"
                );
            }
        }

        self.state.lock().is_inactive = true;
        self.activity.mark();
    }

    /// State effects of a container event that already passed the
    /// type filter. Membership in the engine's group is checked here.
    pub async fn handle_container_event(&self, event: &RuntimeEvent) {
        if !self.resolver.contains(&event.id).await {
            return;
        }

        let status = event.status.as_str();
        if matches!(status, "die" | "kill" | "stop" | "pause") {
            let mut state = self.state.lock();
            if !state.is_inactive {
                info!(
                    container = %self.container_name,
                    id = %event.id,
                    status,
                    "container went down externally"
                );
                state.is_inactive = true;
            }
        } else if status.starts_with("health_status") {
            if !self.healthcheck_enabled || self.is_inactive() {
                return;
            }
            match self.runtime.inspect_container(&event.id).await {
                Ok(state) if !state.is_ready() => {
                    warn!(
                        container = %self.container_name,
                        id = %event.id,
                        status = ?state.health_status,
                        "container became unhealthy"
                    );
                    self.state.lock().is_inactive = true;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        container = %self.container_name,
                        error = %e,
                        "inspect failed after health event"
                    );
                }
            }
        } else if matches!(status, "unpause" | "start" | "restart") {
            let mut state = self.state.lock();
            // An external start is not trusted; the group stays marked
            // inactive so the next forward verifies it with a fresh wake.
            if state.is_inactive && state.wake_in_flight.is_none() {
                debug!(
                    container = %self.container_name,
                    id = %event.id,
                    status,
                    "external start observed while suspended, will verify on next forward"
                );
                state.is_inactive = true;
            }
        }
    }
}
