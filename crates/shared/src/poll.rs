//! Bounded polling for eventually-consistent external state
//!
//! Used wherever a caller has to wait for state that some other producer will
//! write "soon" (for example a webhook landing after a successful payment).
//! The wait is bounded by a fixed delay schedule; when the schedule runs out the
//! caller gets the last observed value instead of an error.
//!
//! Polling runs inside the caller's future. Dropping that future stops the
//! loop; nothing is spawned, so no background work outlives the caller.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio_retry::Retry;

/// Delays between consecutive probes
///
/// The first probe runs immediately, so a schedule with `n` delays probes at
/// most `n + 1` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    delays: Vec<Duration>,
}

impl PollSchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Linearly increasing delays: `initial`, `initial + step`, `initial + 2*step`, ...
    pub fn increasing(retries: usize, initial: Duration, step: Duration) -> Self {
        let delays = (0..retries)
            .map(|i| initial + step * i as u32)
            .collect();
        Self { delays }
    }

    /// Probe exactly once, never wait
    pub fn immediate() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn max_probes(&self) -> usize {
        self.delays.len() + 1
    }

    /// Upper bound on time spent sleeping between probes
    pub fn total_wait(&self) -> Duration {
        self.delays.iter().sum()
    }
}

impl Default for PollSchedule {
    /// Five retries at 1s, 2s, 3s, 4s, 5s (15s of waiting at most)
    fn default() -> Self {
        Self::increasing(5, Duration::from_secs(1), Duration::from_secs(1))
    }
}

/// Result of a bounded poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The readiness predicate held
    Converged(T),
    /// Schedule exhausted; carries the last value observed
    Exhausted(T),
}

impl<T> PollOutcome<T> {
    pub fn is_converged(&self) -> bool {
        matches!(self, PollOutcome::Converged(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            PollOutcome::Converged(value) | PollOutcome::Exhausted(value) => value,
        }
    }
}

enum Attempt<T, E> {
    NotReady(T),
    Failed(E),
}

/// Probe until `is_ready` holds or the schedule is exhausted
///
/// Probe errors are retried like "not ready" results. An error is returned only
/// when the final probe fails and no earlier probe produced a value.
pub async fn poll_until<T, E, F, Fut, P>(
    schedule: &PollSchedule,
    mut probe: F,
    is_ready: P,
) -> Result<PollOutcome<T>, E>
where
    T: Clone,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
{
    let last_seen: Mutex<Option<T>> = Mutex::new(None);
    let mut attempt = 0usize;

    let result = Retry::spawn(schedule.delays.clone(), || {
        attempt += 1;
        let current = attempt;
        let pending = probe();
        let last_seen = &last_seen;
        let is_ready = &is_ready;
        async move {
            match pending.await {
                Ok(value) if is_ready(&value) => Ok(value),
                Ok(value) => {
                    tracing::debug!(attempt = current, "Poll probe not ready yet");
                    let mut slot = last_seen.lock().unwrap_or_else(|p| p.into_inner());
                    *slot = Some(value.clone());
                    Err(Attempt::NotReady(value))
                }
                Err(e) => {
                    tracing::debug!(attempt = current, "Poll probe failed");
                    Err(Attempt::Failed(e))
                }
            }
        }
    })
    .await;

    match result {
        Ok(value) => Ok(PollOutcome::Converged(value)),
        Err(Attempt::NotReady(value)) => {
            tracing::info!(
                probes = schedule.max_probes(),
                "Poll schedule exhausted, returning last observed value"
            );
            Ok(PollOutcome::Exhausted(value))
        }
        Err(Attempt::Failed(e)) => {
            match last_seen.into_inner().unwrap_or_else(|p| p.into_inner()) {
                Some(value) => {
                    tracing::warn!("Final poll probe failed, returning last observed value");
                    Ok(PollOutcome::Exhausted(value))
                }
                None => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_schedule(retries: usize) -> PollSchedule {
        PollSchedule::increasing(retries, Duration::from_millis(1), Duration::from_millis(1))
    }

    #[test]
    fn test_increasing_schedule() {
        let schedule =
            PollSchedule::increasing(3, Duration::from_millis(500), Duration::from_millis(250));
        assert_eq!(
            schedule.delays(),
            &[
                Duration::from_millis(500),
                Duration::from_millis(750),
                Duration::from_millis(1000)
            ]
        );
        assert_eq!(schedule.max_probes(), 4);
        assert_eq!(schedule.total_wait(), Duration::from_millis(2250));
    }

    #[test]
    fn test_default_schedule_is_bounded() {
        let schedule = PollSchedule::default();
        assert_eq!(schedule.max_probes(), 6);
        assert_eq!(schedule.total_wait(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_converges_when_ready() {
        let calls = AtomicUsize::new(0);
        let outcome: Result<_, ()> = poll_until(
            &fast_schedule(5),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n) }
            },
            |n| *n >= 3,
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Converged(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_value() {
        let calls = AtomicUsize::new(0);
        let outcome: Result<_, ()> = poll_until(
            &fast_schedule(2),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n) }
            },
            |_| false,
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Exhausted(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_error_after_value_keeps_best_known() {
        let calls = AtomicUsize::new(0);
        let outcome = poll_until(
            &fast_schedule(1),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok("free")
                    } else {
                        Err("store unavailable")
                    }
                }
            },
            |tier| *tier == "premium",
        )
        .await;

        assert_eq!(outcome, Ok(PollOutcome::Exhausted("free")));
    }

    #[tokio::test]
    async fn test_error_without_any_value_is_returned() {
        let outcome: Result<PollOutcome<u32>, &str> =
            poll_until(&fast_schedule(1), || async { Err("down") }, |_| true).await;
        assert_eq!(outcome, Err("down"));
    }

    #[tokio::test]
    async fn test_immediate_schedule_probes_once() {
        let calls = AtomicUsize::new(0);
        let outcome: Result<_, ()> = poll_until(
            &PollSchedule::immediate(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(0u8) }
            },
            |_| false,
        )
        .await;

        assert!(!outcome.unwrap().is_converged());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
