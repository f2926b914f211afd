//! Event delivery
//!
//! Events reach two audiences. Registered [`EventHandler`]s run in-line when an
//! event is published, in registration order; a handler that fails or panics
//! is logged and skipped. Afterwards the event is broadcast to subscribers,
//! which may lag and miss events but never slow publishers down.

use crate::types::Event;
use crate::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Reacts to published events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Handle one event; errors are logged by the bus
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Builds an [`EventBus`]
///
/// The broadcast sender exists before the bus so that handlers can emit
/// follow-up events to subscribers.
pub struct EventBusBuilder {
    handlers: Vec<Arc<dyn EventHandler>>,
    tx: broadcast::Sender<Event>,
}

impl EventBusBuilder {
    /// Broadcast channel holding up to `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            handlers: Vec::new(),
            tx,
        }
    }

    /// Sender of the broadcast channel the bus will use
    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.tx.clone()
    }

    /// Add a handler
    pub fn register(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Finish the bus
    pub fn build(self) -> EventBus {
        EventBus {
            handlers: self.handlers,
            tx: self.tx,
        }
    }
}

/// Synchronous handlers plus a broadcast channel
pub struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Bus without handlers
    pub fn new(capacity: usize) -> Self {
        EventBusBuilder::new(capacity).build()
    }

    /// Deliver to every handler, then broadcast
    pub async fn publish(&self, event: Event) {
        for handler in &self.handlers {
            match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(handler = handler.name(), error = %e, "event handler failed");
                }
                Err(_) => {
                    tracing::error!(handler = handler.name(), "event handler panicked");
                }
            }
        }

        self.emit(event);
    }

    /// Broadcast to subscribers only
    pub fn emit(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.tx.send(event).ok();
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// [`subscribe`](Self::subscribe) as a stream
    pub fn stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Clone of the broadcast sender
    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.tx.clone()
    }
}
