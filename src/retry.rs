//! Retry controller: predicate-driven retry with pluggable backoff.
//!
//! The controller drives a non-blocking attempt function and delivers the
//! terminal result on a one-shot sink. Neither the predicate nor the backoff
//! may block; waiting happens on the timer, racing sink closure so a
//! cancelled invoke abandons within one backoff interval.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::anomaly::Outcome;

/// Decides whether an attempt result warrants another try.
pub type Retriable = Arc<dyn Fn(&Outcome) -> bool + Send + Sync>;

/// Maps the attempt count (0-based) to a delay in milliseconds, or `None` to
/// give up.
pub type Backoff = Arc<dyn Fn(u32) -> Option<u64> + Send + Sync>;

/// Retries anomalies with category busy, interrupted, or unavailable.
pub fn default_retriable() -> Retriable {
    Arc::new(|outcome| match outcome {
        Ok(_) => false,
        Err(anomaly) => anomaly.is_retriable(),
    })
}

/// Capped exponential backoff: `min(20_000, 100 * 2^attempts)` for the first
/// three attempts, then give up.
pub fn default_backoff() -> Backoff {
    capped_exponential_backoff(100, 20_000, 3)
}

pub fn capped_exponential_backoff(base_ms: u64, cap_ms: u64, max_retries: u32) -> Backoff {
    Arc::new(move |attempts| {
        if attempts < max_retries {
            Some(cap_ms.min(base_ms.saturating_mul(1u64 << attempts.min(63))))
        } else {
            None
        }
    })
}

/// Drives `attempt` until the predicate rejects or the backoff gives up, then
/// delivers the last result on `sink`. Delivery onto a dropped receiver is a
/// silent no-op.
pub async fn with_retry<F, Fut>(
    mut attempt: F,
    mut sink: oneshot::Sender<Outcome>,
    retriable: Retriable,
    backoff: Backoff,
) where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Outcome> + Send,
{
    let mut attempts: u32 = 0;
    loop {
        let result = attempt().await;
        if !retriable(&result) {
            let _ = sink.send(result);
            return;
        }
        match backoff(attempts) {
            None => {
                let _ = sink.send(result);
                return;
            }
            Some(delay_ms) => {
                debug!(attempts, delay_ms, "retrying");
                tokio::select! {
                    _ = sink.closed() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {}
                }
            }
        }
        attempts += 1;
    }
}
