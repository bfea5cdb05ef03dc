//! Process-health bus boundary contract.

use crate::BoxFuture;

/// Process-health event published to the supervisor bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A panic was caught by the process hook.
    Exception {
        /// Panic message.
        message: Box<str>,
        /// `file:line:col` when known.
        location: Option<Box<str>>,
    },
    /// An error-level log event was emitted.
    LogError {
        /// Event name of the log line.
        event: Box<str>,
        /// Log message.
        message: Box<str>,
    },
    /// The broker session is retrying its connection.
    ReconnectAttempt {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Transport error text.
        reason: Box<str>,
    },
    /// The broker session ended.
    Closed {
        /// Why the session ended.
        reason: Box<str>,
    },
    /// The subscriber fell behind and missed events.
    Lagged {
        /// Number of events skipped.
        skipped: u64,
    },
}

impl SupervisorEvent {
    /// Stable event name suffix used in log lines.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Exception { .. } => "exception",
            Self::LogError { .. } => "log_error",
            Self::ReconnectAttempt { .. } => "reconnect",
            Self::Closed { .. } => "close",
            Self::Lagged { .. } => "lagged",
        }
    }
}

/// Receiving half of a bus subscription.
pub trait SupervisorEventStream: Send {
    /// Next event, or `None` once the bus is closed.
    fn next_event(&mut self) -> BoxFuture<'_, Option<SupervisorEvent>>;
}

/// Boundary contract for the supervisor bus.
pub trait SupervisorBusPort: Send + Sync {
    /// Publish an event to all current subscribers; never blocks.
    fn publish(&self, event: SupervisorEvent);

    /// Subscribe to events published from now on.
    fn subscribe(&self) -> Box<dyn SupervisorEventStream>;
}
