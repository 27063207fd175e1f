//! Per-engine consumer of the runtime's event stream
//!
//! The pool's dispatch task calls the handler for every message on the
//! client's stream. The handler filters out non-container events and
//! hands the rest to the lifecycle controller on a fresh task, keeping
//! the dispatch thread free of I/O.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::lifecycle::LifecycleController;
use crate::pool::EventHandler;
use crate::runtime::{RuntimeEvent, EVENT_KIND_CONTAINER};

/// Build the event handler for one engine.
///
/// The handler goes quiet once `cancel` fires; subscriptions themselves
/// live as long as the pooled client.
pub fn subscription_handler(
    controller: Arc<LifecycleController>,
    cancel: CancellationToken,
) -> EventHandler {
    Arc::new(move |event: &RuntimeEvent| {
        if cancel.is_cancelled() {
            return;
        }
        if event.kind != EVENT_KIND_CONTAINER {
            return;
        }

        let controller = controller.clone();
        let event = event.clone();
        tokio::spawn(async move {
            controller.handle_container_event(&event).await;
        });
    })
}
