//! In-process supervisor bus and the logger that feeds it.

use sensor_ingest_ports::{
    BoxFuture, LogEvent, LogFields, LogLevel, LoggerPort, SupervisorBusPort, SupervisorEvent,
    SupervisorEventStream,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default number of events buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Supervisor bus backed by a `tokio` broadcast channel.
///
/// Publishing never blocks; slow subscribers observe a `Lagged` event instead
/// of stalling publishers.
#[derive(Debug, Clone)]
pub struct BroadcastSupervisorBus {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl BroadcastSupervisorBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastSupervisorBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl SupervisorBusPort for BroadcastSupervisorBus {
    fn publish(&self, event: SupervisorEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(event = event.name(), "supervisor event published without subscribers");
        }
    }

    fn subscribe(&self) -> Box<dyn SupervisorEventStream> {
        Box::new(BroadcastEventStream {
            receiver: self.sender.subscribe(),
        })
    }
}

struct BroadcastEventStream {
    receiver: broadcast::Receiver<SupervisorEvent>,
}

impl SupervisorEventStream for BroadcastEventStream {
    fn next_event(&mut self) -> BoxFuture<'_, Option<SupervisorEvent>> {
        Box::pin(async move {
            match self.receiver.recv().await {
                Ok(event) => Some(event),
                Err(RecvError::Lagged(skipped)) => Some(SupervisorEvent::Lagged { skipped }),
                Err(RecvError::Closed) => None,
            }
        })
    }
}

/// Logger decorator that publishes every error-level event to the bus.
#[derive(Clone)]
pub struct BusForwardingLogger {
    inner: Arc<dyn LoggerPort>,
    bus: Arc<dyn SupervisorBusPort>,
}

impl BusForwardingLogger {
    /// Wrap `inner`, forwarding its error events to `bus`.
    #[must_use]
    pub fn new(inner: Arc<dyn LoggerPort>, bus: Arc<dyn SupervisorBusPort>) -> Self {
        Self { inner, bus }
    }
}

impl LoggerPort for BusForwardingLogger {
    fn log(&self, event: LogEvent) {
        if event.level == LogLevel::Error {
            self.bus.publish(SupervisorEvent::LogError {
                event: event.event.clone(),
                message: event.message.clone(),
            });
        }
        self.inner.log(event);
    }

    fn child(&self, fields: LogFields) -> Box<dyn LoggerPort> {
        Box::new(Self {
            inner: Arc::from(self.inner.child(fields)),
            bus: Arc::clone(&self.bus),
        })
    }
}
