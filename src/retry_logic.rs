use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::AgentError;

/// Cooperative cancellation flag, polled between steps and inside waits.
pub type CancelFlag = Arc<AtomicBool>;

pub fn new_cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

pub fn is_cancelled(flag: &CancelFlag) -> bool {
    flag.load(Ordering::Relaxed)
}

/// Sleep in 100ms slices, re-checking the cancellation flag each slice.
/// Returns false when the sleep was interrupted by cancellation.
pub async fn sleep_cancellable(ms: u64, cancel: &CancelFlag) -> bool {
    let mut remaining = ms;
    while remaining > 0 {
        if is_cancelled(cancel) {
            return false;
        }
        let slice = remaining.min(100);
        sleep(Duration::from_millis(slice)).await;
        remaining -= slice;
    }
    !is_cancelled(cancel)
}

/// Coarse classification of external-call failures, for logging and for
/// deciding whether another attempt is worthwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Timeout,
    RateLimit,
    StaleElement,
    NotFound,
    Other,
}

pub fn classify_failure(message: &str) -> FailureKind {
    let msg = message.to_lowercase();
    if msg.contains("rate limit") || msg.contains("429") || msg.contains("too many requests") {
        return FailureKind::RateLimit;
    }
    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
        return FailureKind::Timeout;
    }
    if msg.contains("stale") || msg.contains("detached") {
        return FailureKind::StaleElement;
    }
    if msg.contains("not found") || msg.contains("no such element") {
        return FailureKind::NotFound;
    }
    if msg.contains("connection") || msg.contains("network") || msg.contains("dns") {
        return FailureKind::Network;
    }
    FailureKind::Other
}

/// Run `op` up to `1 + retries` times with a fixed delay between attempts.
/// Fatal (configuration) errors and cancellation are surfaced immediately.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    retries: u64,
    delay_ms: u64,
    cancel: &CancelFlag,
    mut op: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let mut attempt = 0u64;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                if attempt > retries || is_cancelled(cancel) {
                    return Err(e);
                }
                let kind = classify_failure(&e.to_string());
                warn!(
                    "⚠️ [Retry] {} failed [{:?}] (attempt {}/{}): {}",
                    label,
                    kind,
                    attempt,
                    retries + 1,
                    e
                );
                if !sleep_cancellable(delay_ms, cancel).await {
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_with_retry_recovers_after_transient_failure() {
        let cancel = new_cancel_flag();
        let calls = AtomicU32::new(0);
        let result = with_retry("op", 2, 1, &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AgentError::Driver("connection refused".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_config_errors() {
        let cancel = new_cancel_flag();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry("op", 3, 1, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AgentError::Config("bad label".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sleep_cancellable_stops_early() {
        let cancel = new_cancel_flag();
        cancel.store(true, Ordering::Relaxed);
        assert!(!sleep_cancellable(5000, &cancel).await);
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure("element not found on screen"), FailureKind::NotFound);
        assert_eq!(classify_failure("request timed out"), FailureKind::Timeout);
        assert_eq!(classify_failure("stale element handle"), FailureKind::StaleElement);
    }
}
