//! Pub/sub session boundary contract.

use crate::BoxFuture;
use sensor_ingest_shared::{RequestContext, Result};

/// One message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: Box<str>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

/// Session lifecycle and data events, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The broker acknowledged a (re)connect and the subscription was (re)issued.
    Connected {
        /// Broker kept state from a previous session.
        session_present: bool,
    },
    /// A published message arrived.
    Message(InboundMessage),
    /// The transport failed; the session will retry after `delay_ms`.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Transport error text.
        reason: Box<str>,
        /// Delay before the next attempt.
        delay_ms: u64,
    },
    /// The session ended and will not deliver further events.
    Closed {
        /// Why the session ended.
        reason: Box<str>,
    },
}

/// Boundary contract for a subscribed broker session.
///
/// Reconnection is the session's responsibility; callers just keep polling.
pub trait SubscriptionPort: Send {
    /// Wait for the next session event.
    fn next_event<'a>(&'a mut self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<SessionEvent>>;

    /// Disconnect from the broker.
    fn disconnect<'a>(&'a mut self, ctx: &'a RequestContext) -> BoxFuture<'a, Result<()>>;
}
