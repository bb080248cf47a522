use super::types::DaemonEvent;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Synchronous subscriber.
///
/// Handlers run on the publisher's task, in registration order, before
/// `publish` returns. They must not block.
pub trait EventHandler: Send + Sync {
    /// Called once per published event.
    fn on_event(&self, event: &DaemonEvent);
}

/// Event bus with two delivery paths.
///
/// Registered [`EventHandler`]s are invoked synchronously in registration
/// order. Async consumers can also `subscribe()` to a `tokio::broadcast`
/// channel; slow receivers miss events (lagged) rather than blocking the
/// publisher.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DaemonEvent>,
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    /// Create a new EventBus with the given broadcast capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a synchronous handler. It sees every event published after
    /// this call.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    ///
    /// Runs every registered handler in order, then broadcasts. Returns the
    /// number of broadcast receivers that got the event.
    pub fn publish(&self, event: DaemonEvent) -> usize {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in &handlers {
            handler.on_event(&event);
        }
        // send() returns Err if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active broadcast receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of registered synchronous handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
