//! Request-scoped context and write concurrency primitives.
//!
//! - `RequestContext` carries a correlation id and a cancellation token across
//!   port boundaries. The service root context is cancelled on SIGINT/SIGTERM;
//!   each inbound message derives a `msg_*` context that shares it.
//! - `WriteLimiter` caps the number of in-flight store writes and tracks the
//!   spawned write tasks so shutdown can drain them.

use crate::{ErrorCode, ErrorEnvelope, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::task::TaskTracker;

pub use tokio_util::sync::CancellationToken;

/// A correlation identifier used for logging/telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Parse a correlation identifier from user input.
    ///
    /// The value is trimmed; empty values are rejected.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(ErrorEnvelope::expected(
                ErrorCode::invalid_input(),
                "correlationId must be non-empty",
            ));
        }
        Ok(Self(Arc::<str>::from(trimmed)))
    }

    /// Create a new request id, best-effort unique within this process.
    #[must_use]
    pub fn new_request_id() -> Self {
        next_scoped_id(&REQUEST_ID_COUNTER, "req_")
    }

    /// Create a new message id, best-effort unique within this process.
    #[must_use]
    pub fn new_message_id() -> Self {
        next_scoped_id(&MESSAGE_ID_COUNTER, "msg_")
    }

    /// Borrow the identifier as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_scoped_id(counter: &AtomicU64, prefix: &'static str) -> CorrelationId {
    let n = counter.fetch_add(1, Ordering::Relaxed);
    CorrelationId(Arc::<str>::from(format!("{prefix}{n}")))
}

/// Request-scoped context passed across boundaries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    correlation_id: CorrelationId,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Create a new request context with a fresh cancellation token.
    #[must_use]
    pub fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            cancellation: CancellationToken::new(),
        }
    }

    /// Convenience constructor: create a context with an auto-generated `req_*` id.
    #[must_use]
    pub fn new_request() -> Self {
        Self::new(CorrelationId::new_request_id())
    }

    /// Derive a per-message context that is cancelled together with `self`.
    #[must_use]
    pub fn for_message(&self) -> Self {
        Self {
            correlation_id: CorrelationId::new_message_id(),
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Return the correlation id.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Return a clone of the cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Returns true if the request was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Cancel this request.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Await cancellation.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Return a cancellation error if the request has been cancelled.
    pub fn ensure_not_cancelled(&self, operation: &'static str) -> Result<()> {
        if self.is_cancelled() {
            return Err(ErrorEnvelope::cancelled("operation cancelled")
                .with_metadata("operation", operation));
        }
        Ok(())
    }
}

/// Policy applied when every write slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaturationPolicy {
    /// Park the caller until a slot frees.
    #[default]
    Wait,
    /// Refuse the write immediately.
    Drop,
}

/// Outcome of a spawn attempt on the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The task was spawned.
    Spawned,
    /// The limiter was saturated and the policy is `Drop`.
    Dropped,
    /// The limiter was closed (shutdown in progress).
    Closed,
}

/// Outcome of draining in-flight tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every tracked task finished.
    Drained,
    /// The deadline elapsed with tasks still running.
    TimedOut {
        /// Tasks still running at the deadline.
        remaining: usize,
    },
}

/// Bounded spawner for background write tasks.
#[derive(Debug, Clone)]
pub struct WriteLimiter {
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    policy: SaturationPolicy,
}

impl WriteLimiter {
    /// Create a limiter allowing `max_in_flight` concurrent tasks.
    pub fn new(max_in_flight: usize, policy: SaturationPolicy) -> Result<Self> {
        if max_in_flight == 0 {
            return Err(ErrorEnvelope::expected(
                ErrorCode::invalid_input(),
                "max in-flight writes must be greater than zero",
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            tracker: TaskTracker::new(),
            policy,
        })
    }

    /// Returns the configured saturation policy.
    #[must_use]
    pub const fn policy(&self) -> SaturationPolicy {
        self.policy
    }

    /// Number of slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of spawned tasks that have not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Spawn `task` once a slot is available, per the saturation policy.
    ///
    /// The slot is held until the task completes.
    pub async fn spawn<F>(&self, task: F) -> Dispatch
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(permit) = self.acquire().await else {
            return match self.policy {
                SaturationPolicy::Drop if !self.semaphore.is_closed() => Dispatch::Dropped,
                _ => Dispatch::Closed,
            };
        };

        self.tracker.spawn(async move {
            task.await;
            drop(permit);
        });
        Dispatch::Spawned
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match self.policy {
            SaturationPolicy::Wait => Arc::clone(&self.semaphore).acquire_owned().await.ok(),
            SaturationPolicy::Drop => match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
            },
        }
    }

    /// Stop accepting new tasks and wait up to `timeout` for in-flight ones.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        self.semaphore.close();
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => DrainOutcome::TimedOut {
                remaining: self.tracker.len(),
            },
        }
    }
}
