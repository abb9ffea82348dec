//! Bounded fixed-interval polling
//!
//! The only retry construct in the engine. Every eventually-consistent check
//! (machine addresses, deletion confirmation) goes through [`poll_until`]
//! with an attempt budget and a fixed sleep between attempts; there is no
//! exponential backoff. Exhausting the budget is not an error: the caller
//! receives `Ok(None)` and decides what that means. An elapsed run deadline
//! is an error, reported before the helper would sleep past it.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::context::Deadline;
use crate::error::StyraResult;

/// Attempt budget and sleep interval for one polling loop
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollOptions {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Upper bound on time spent sleeping in the loop
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(5),
        }
    }
}

/// Poll `probe` until it yields a value, the attempt budget is exhausted, or
/// the deadline elapses.
///
/// `probe` returning `Ok(Some(v))` ends the loop with `Ok(Some(v))`;
/// `Ok(None)` consumes an attempt; `Err` propagates immediately (the probe
/// itself decides which of its failures are worth another attempt).
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    opts: &PollOptions,
    deadline: Option<Deadline>,
    mut probe: F,
) -> StyraResult<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StyraResult<Option<T>>>,
{
    for attempt in 1..=opts.attempts {
        if let Some(d) = deadline {
            if d.expired() {
                return Err(d.error(operation));
            }
        }

        if let Some(value) = probe().await? {
            return Ok(Some(value));
        }

        if attempt < opts.attempts {
            if let Some(d) = deadline {
                // Sleeping the full interval would overrun the run deadline;
                // fail fast instead of waking up past it.
                if !d.allows(opts.interval) {
                    return Err(d.error(operation));
                }
            }
            debug!(
                "{}: not ready (attempt {}/{}), sleeping {:?}",
                operation, attempt, opts.attempts, opts.interval
            );
            tokio::time::sleep(opts.interval).await;
        }
    }

    debug!(
        "{}: attempt budget ({}) exhausted",
        operation, opts.attempts
    );
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StyraError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_value_on_first_success() {
        let opts = PollOptions::new(3, Duration::from_millis(10));
        let result = poll_until("test", &opts, None, || async { Ok(Some(7)) })
            .await
            .unwrap();
        assert_eq!(result, Some(7));
    }

    #[tokio::test]
    async fn retries_until_ready() {
        let opts = PollOptions::new(5, Duration::from_millis(5));
        let counter = Arc::new(AtomicU32::new(0));
        let probe_counter = counter.clone();

        let result = poll_until("test", &opts, None, move || {
            let n = probe_counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n >= 2 { Some(n) } else { None }) }
        })
        .await
        .unwrap();

        assert_eq!(result, Some(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_is_none_not_an_error() {
        let opts = PollOptions::new(3, Duration::from_millis(1));
        let counter = Arc::new(AtomicU32::new(0));
        let probe_counter = counter.clone();

        let result: Option<u32> = poll_until("test", &opts, None, move || {
            probe_counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .unwrap();

        assert_eq!(result, None);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_sleeps_past_the_budget() {
        let opts = PollOptions::new(4, Duration::from_millis(10));
        let start = tokio::time::Instant::now();

        let _: Option<u32> = poll_until("test", &opts, None, || async { Ok(None) })
            .await
            .unwrap();

        // 4 attempts sleep 3 intervals; allow generous scheduling slack but
        // stay well under budget + one extra interval.
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(start.elapsed() < opts.budget() + Duration::from_millis(50));
    }

    #[tokio::test]
    async fn probe_errors_propagate_immediately() {
        let opts = PollOptions::new(5, Duration::from_millis(5));
        let counter = Arc::new(AtomicU32::new(0));
        let probe_counter = counter.clone();

        let err = poll_until("test", &opts, None, move || {
            probe_counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<Option<u32>, _>(StyraError::Api {
                    operation: "get_machine".to_string(),
                    details: "boom".to_string(),
                })
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StyraError::Api { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn elapsed_deadline_fails_fast() {
        let opts = PollOptions::new(10, Duration::from_millis(50));
        let deadline = Deadline::after(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = poll_until("confirm-deleted", &opts, Some(deadline), || async {
            Ok(None::<u32>)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StyraError::Timeout { .. }));
    }

    #[tokio::test]
    async fn deadline_cuts_loop_before_overrunning_sleep() {
        let opts = PollOptions::new(10, Duration::from_secs(5));
        let deadline = Deadline::after(Duration::from_millis(20));

        let start = tokio::time::Instant::now();
        let err = poll_until("wait-address", &opts, Some(deadline), || async {
            Ok(None::<u32>)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StyraError::Timeout { .. }));
        // Failed fast instead of sleeping a full 5s interval.
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
