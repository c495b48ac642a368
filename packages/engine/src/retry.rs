//! Transient-error classification and exponential backoff for the two
//! backing services.
//!
//! Both wrappers share the same shape: run a callable; on failure, classify
//! the error; if transient, sleep `2^(attempt-1)` seconds and retry, up to
//! [`StoreConfig::retry_max_attempts`](crate::config::StoreConfig::retry_max_attempts);
//! otherwise fail immediately. Exhaustion is surfaced as
//! [`StoreError::BackendTransient`]; a non-transient failure is
//! [`StoreError::BackendFatal`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use latchkv_core::error::StoreError;
use tokio::sync::Notify;
use tracing::warn;

/// DataStore status-code prefixes treated as transient.
///
/// 503 is included even though it is documented as a "key not found"
/// response upstream -- carried forward as-is from the source system
/// rather than silently corrected; see the Open Questions in SPEC_FULL.md.
const DATA_STORE_TRANSIENT_CODES: &[u32] = &[301, 302, 303, 304, 305, 306, 500, 501, 502, 503, 504, 505];

/// Coordination-map error substrings treated as transient.
const COORDINATION_TRANSIENT_SUBSTRINGS: &[&str] = &[
    "TotalRequestsOverLimit",
    "InternalError",
    "RequestThrottled",
    "PartitionRequestsOverLimit",
    "Throttled",
    "Timeout",
];

/// Extracts a leading numeric DataStore status-code prefix from an error's
/// display string, if present (e.g. an error rendered as `"503: ..."`).
fn extract_status_code(err: &anyhow::Error) -> Option<u32> {
    let text = err.to_string();
    let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Classifies a `DataStore` error as transient or not.
#[must_use]
pub fn classify_data_store_error(err: &anyhow::Error) -> bool {
    extract_status_code(err).is_some_and(|code| DATA_STORE_TRANSIENT_CODES.contains(&code))
}

/// Classifies a `CoordinationMap` error as transient or not.
#[must_use]
pub fn classify_coordination_error(err: &anyhow::Error) -> bool {
    let text = err.to_string();
    COORDINATION_TRANSIENT_SUBSTRINGS.iter().any(|s| text.contains(s))
}

/// A cooperative cancellation handle for an in-flight retry loop.
///
/// Cloning shares the same underlying flag; `cancel()` from any clone stops
/// every retry loop holding a clone, including one currently asleep in a
/// backoff delay -- the sleep races against a `Notify` so cancellation
/// interrupts it immediately rather than waiting out the full backoff.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    /// Creates a fresh, not-yet-cancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every retry loop sharing this handle as cancelled and wakes
    /// any of them currently asleep in a backoff delay.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether `cancel()` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. A `cancel()` racing ahead
    /// of this call (before anyone is waiting on the `Notify`) is missed;
    /// callers must race this against a bounded sleep and re-check
    /// `is_cancelled()` rather than awaiting it alone.
    pub(crate) async fn cancelled(&self) {
        self.notify.notified().await;
    }
}

/// Retries `f` against the failure-classifying + backoff policy described
/// at module level. `max_attempts` is the total number of attempts
/// (including the first), normally [`StoreConfig::retry_max_attempts`](crate::config::StoreConfig::retry_max_attempts).
async fn retry_with<T, Fut>(
    mut f: impl FnMut() -> Fut,
    classify_transient: impl Fn(&anyhow::Error) -> bool,
    max_attempts: u32,
    cancel: Option<&CancelHandle>,
    op_name: &str,
) -> Result<T, StoreError>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        if cancel.is_some_and(CancelHandle::is_cancelled) {
            return Err(StoreError::BackendFatal(anyhow::anyhow!(
                "{op_name} cancelled before attempt {attempt}"
            )));
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let transient = classify_transient(&err);
                if !transient {
                    return Err(StoreError::BackendFatal(err));
                }
                if attempt >= max_attempts {
                    return Err(StoreError::BackendTransient(err.context(format!(
                        "{op_name} exhausted {max_attempts} attempts"
                    ))));
                }
                let backoff = Duration::from_secs(1u64 << (attempt - 1));
                warn!(
                    op_name,
                    attempt,
                    max_attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %err,
                    "transient backend error, retrying"
                );
                match cancel {
                    Some(cancel) => {
                        tokio::select! {
                            () = tokio::time::sleep(backoff) => {}
                            () = cancel.cancelled() => {}
                        }
                        if cancel.is_cancelled() {
                            return Err(StoreError::BackendFatal(anyhow::anyhow!(
                                "{op_name} cancelled during backoff before attempt {}",
                                attempt + 1
                            )));
                        }
                    }
                    None => tokio::time::sleep(backoff).await,
                }
                attempt += 1;
            }
        }
    }
}

/// Retries a `DataStore` call using DataStore error classification.
pub async fn retry_data_store<T, Fut>(
    op_name: &str,
    max_attempts: u32,
    f: impl FnMut() -> Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    retry_with(f, classify_data_store_error, max_attempts, None, op_name).await
}

/// Retries a `CoordinationMap` call using coordination-map error
/// classification, honoring `cancel` if given.
pub async fn retry_coordination<T, Fut>(
    op_name: &str,
    max_attempts: u32,
    cancel: Option<&CancelHandle>,
    f: impl FnMut() -> Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    retry_with(f, classify_coordination_error, max_attempts, cancel, op_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn classifies_data_store_transient_codes() {
        assert!(classify_data_store_error(&anyhow::anyhow!("503: key not found")));
        assert!(classify_data_store_error(&anyhow::anyhow!("301: moved")));
        assert!(!classify_data_store_error(&anyhow::anyhow!("400: bad request")));
        assert!(!classify_data_store_error(&anyhow::anyhow!("not a status code")));
    }

    #[test]
    fn classifies_coordination_transient_substrings() {
        assert!(classify_coordination_error(&anyhow::anyhow!("RequestThrottled: slow down")));
        assert!(classify_coordination_error(&anyhow::anyhow!("operation Timeout")));
        assert!(!classify_coordination_error(&anyhow::anyhow!("AccessDenied")));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_up_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), StoreError> = retry_data_store("test-op", 3, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("503: transient"))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::BackendTransient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_fail_immediately_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), StoreError> = retry_data_store("test-op", 5, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("400: bad request"))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::BackendFatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_then_ok() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_data_store("test-op", 5, move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(anyhow::anyhow!("500: transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_handle_short_circuits_coordination_retries() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        let result: Result<(), StoreError> =
            retry_coordination("test-op", 5, Some(&cancel), || async { Ok(()) }).await;
        assert!(result.is_err());
    }
}
