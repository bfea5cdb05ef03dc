//! Timeout helpers with cancellation awareness.

use crate::{ErrorClass, ErrorCode, ErrorEnvelope, RequestContext, Result};
use std::future::Future;
use std::time::Duration;

/// Apply a timeout to a future, honoring request cancellation.
pub async fn timeout_with_context<T, F>(
    ctx: &RequestContext,
    timeout: Duration,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    ctx.ensure_not_cancelled(operation)?;

    tokio::select! {
        () = ctx.cancelled() => Err(cancelled_error(operation)),
        res = tokio::time::timeout(timeout, fut) => {
            res.unwrap_or_else(|_| Err(timeout_error(operation)))
        }
    }
}

fn timeout_error(operation: &'static str) -> ErrorEnvelope {
    ErrorEnvelope::unexpected(
        ErrorCode::timeout(),
        format!("operation timed out: {operation}"),
        ErrorClass::Retriable,
    )
    .with_metadata("operation", operation)
}

fn cancelled_error(operation: &'static str) -> ErrorEnvelope {
    ErrorEnvelope::cancelled("operation cancelled").with_metadata("operation", operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_operation_times_out() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let ctx = RequestContext::new_request();
        let fut = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ErrorEnvelope>(())
        };

        let result = timeout_with_context(&ctx, Duration::from_millis(10), "store.insert", fut).await;
        let error = result.err().ok_or("expected a timeout error")?;
        assert!(error.is_timeout());
        assert!(error.class.is_retriable());
        assert_eq!(
            error.metadata.get("operation").map(String::as_str),
            Some("store.insert")
        );
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_wins_over_timeout() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let ctx = RequestContext::new_request();
        let token = ctx.cancellation_token();
        let fut = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ErrorEnvelope>(())
        };

        let task = tokio::spawn(async move {
            timeout_with_context(&ctx, Duration::from_secs(5), "store.acquire", fut).await
        });

        tokio::task::yield_now().await;
        token.cancel();
        let result = task.await?;
        assert!(matches!(result, Err(ref error) if error.is_cancelled()));
        Ok(())
    }

    #[tokio::test]
    async fn fast_operation_passes_through() {
        let ctx = RequestContext::new_request();
        let value = timeout_with_context(&ctx, Duration::from_secs(1), "noop", async {
            Ok::<_, ErrorEnvelope>(7)
        })
        .await;
        assert!(matches!(value, Ok(7)));
    }
}
