//! Event reconciliation loop.
//!
//! The reconciler:
//! - Subscribes to the engine's container and image events
//! - Filters and classifies each event
//! - Hands lifecycle transitions to every registered listener
//! - Resubscribes after a fixed delay when the stream fails
//!
//! Events emitted while the stream is down are not replayed.

use std::sync::Arc;
use std::time::Duration;

use ctnet_events::{
    classify, ClassifiedEvent, ContainerRef, ContainerTransition, EngineEvent, EventFilter,
    ImageTransition, SkipReason,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, EngineError, EventSubscription};
use crate::listener::{LifecycleListener, ListenerError};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay between a stream failure and the next subscription attempt.
    pub reconnect_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Event stream connection state.
///
/// A subscription only lives inside `Streaming`; leaving that state drops
/// it, which stops the stream's feeder task.
pub enum ConnectionState {
    /// About to subscribe.
    Subscribing,
    /// Reading events.
    Streaming(EventSubscription),
    /// Waiting before the next subscription attempt.
    Backoff,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Streaming(_) => "streaming",
            ConnectionState::Backoff => "backoff",
        }
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to every listener; `failures` of them returned an error.
    Delivered { failures: usize },
    Skipped(SkipReason),
    /// Logged only (`oom`, `exec_start`).
    Informational,
    Unhandled,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Drives lifecycle listeners from the engine event stream.
pub struct Reconciler {
    engine: Arc<dyn ContainerEngine>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    filter: EventFilter,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        filter: EventFilter,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            engine,
            listeners: Vec::new(),
            filter,
            config,
        }
    }

    /// Register a listener. Listeners are called in registration order.
    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listener_names(&self) -> Vec<&'static str> {
        self.listeners.iter().map(|l| l.name()).collect()
    }

    /// Run the event loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            listeners = ?self.listener_names(),
            reconnect_delay_secs = self.config.reconnect_delay.as_secs(),
            "Starting event reconciler"
        );

        let mut state = ConnectionState::Subscribing;
        loop {
            tokio::select! {
                _ = self.step(&mut state) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(state = state.name(), "Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Advance the connection state machine by one step.
    ///
    /// `state` is only replaced after an await completes, so cancelling a
    /// step leaves it unchanged.
    async fn step(&self, state: &mut ConnectionState) {
        match state {
            ConnectionState::Subscribing => match self.engine.subscribe().await {
                Ok(subscription) => {
                    info!(subscription = subscription.id(), "Event stream connected");
                    *state = ConnectionState::Streaming(subscription);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to subscribe to engine events");
                    *state = ConnectionState::Backoff;
                }
            },
            ConnectionState::Streaming(subscription) => match subscription.next().await {
                Ok(event) => {
                    self.dispatch(&event).await;
                }
                Err(e) => {
                    warn!(
                        subscription = subscription.id(),
                        error = %e,
                        retry_in_secs = self.config.reconnect_delay.as_secs(),
                        "Event stream failed"
                    );
                    *state = ConnectionState::Backoff;
                }
            },
            ConnectionState::Backoff => {
                tokio::time::sleep(self.config.reconnect_delay).await;
                *state = ConnectionState::Subscribing;
            }
        }
    }

    /// Filter, classify and deliver one event.
    pub async fn dispatch(&self, event: &EngineEvent) -> Dispatch {
        match classify(event) {
            ClassifiedEvent::Container {
                transition,
                container,
            } => {
                if let Some(reason) = self.filter.skip_reason(&container) {
                    debug!(
                        container_id = %container.short_id(),
                        container_name = %container.name,
                        action = %event.action,
                        reason = %reason,
                        "Skipping event"
                    );
                    return Dispatch::Skipped(reason);
                }
                debug!(
                    container_id = %container.short_id(),
                    container_name = %container.name,
                    transition = ?transition,
                    "Container transition"
                );
                let failures = self.deliver_container(transition, &container).await;
                Dispatch::Delivered { failures }
            }
            ClassifiedEvent::Image { transition, image } => {
                let mut failures = 0;
                for listener in &self.listeners {
                    let result = match transition {
                        ImageTransition::Pulled => listener.image_pulled(&image).await,
                        ImageTransition::Removed => listener.image_removed(&image).await,
                    };
                    if let Err(e) = result {
                        failures += 1;
                        warn!(listener = listener.name(), image = %image, error = %e, "Listener failed");
                    }
                }
                Dispatch::Delivered { failures }
            }
            ClassifiedEvent::Informational { kind, action, id } => {
                info!(
                    kind = %kind,
                    action = %action,
                    container_id = %ctnet_events::short_id(&id),
                    "Container event"
                );
                Dispatch::Informational
            }
            ClassifiedEvent::Unhandled { kind, action } => {
                debug!(kind = %kind, action = %action, "Ignoring event");
                Dispatch::Unhandled
            }
        }
    }

    async fn deliver_container(
        &self,
        transition: ContainerTransition,
        container: &ContainerRef,
    ) -> usize {
        let mut failures = 0;
        for listener in &self.listeners {
            let result = match transition {
                ContainerTransition::Created => listener.container_created(container).await,
                ContainerTransition::Started => listener.container_started(container).await,
                ContainerTransition::Stopped => listener.container_stopped(container).await,
                ContainerTransition::Destroyed => listener.container_destroyed(container).await,
            };
            if let Err(e) = result {
                failures += 1;
                log_listener_error(listener.as_ref(), transition, container, &e);
            }
        }
        failures
    }

    /// Hand every existing container to the listeners once. Returns how
    /// many containers were eligible.
    pub async fn discover(&self) -> Result<usize, EngineError> {
        let containers = self.engine.list_containers().await?;
        let mut eligible = 0;

        for summary in containers {
            let container = ContainerRef::new(summary.id, summary.name, summary.image);
            if let Some(reason) = self.filter.skip_reason(&container) {
                debug!(
                    container_id = %container.short_id(),
                    container_name = %container.name,
                    reason = %reason,
                    "Skipping existing container"
                );
                continue;
            }
            eligible += 1;
            for listener in &self.listeners {
                if let Err(e) = listener
                    .container_discovered(&container, summary.running)
                    .await
                {
                    warn!(
                        listener = listener.name(),
                        container_id = %container.short_id(),
                        container_name = %container.name,
                        error = %e,
                        "Listener failed on existing container"
                    );
                }
            }
        }

        info!(eligible, "Existing containers handed to listeners");
        Ok(eligible)
    }
}

fn log_listener_error(
    listener: &dyn LifecycleListener,
    transition: ContainerTransition,
    container: &ContainerRef,
    error: &ListenerError,
) {
    warn!(
        listener = listener.name(),
        transition = ?transition,
        container_id = %container.short_id(),
        container_name = %container.name,
        error = %error,
        "Listener failed"
    );
}
