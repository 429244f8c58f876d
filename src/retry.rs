//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The connection worker
//! uses [`RetrySchedule`] to pace reconnects and the request correlator uses
//! [`with_timeout`] to bound the wait for a correlated response.

use std::future::Future;
use std::time::Duration;

/// Default reconnect delays in milliseconds.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 7] = [500, 1_000, 2_000, 5_000, 10_000, 20_000, 30_000];

/// Fixed, ordered sequence of reconnect delays.
///
/// Once the sequence is exhausted the last delay repeats. The schedule is
/// indexed by a retry counter owned by the connection worker: the counter
/// grows once per unsolicited closure and resets on every received message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
    max_attempts: Option<usize>,
}

impl RetrySchedule {
    /// Builds a schedule from explicit delays.
    ///
    /// An empty list is treated as a single zero delay so indexing never
    /// fails.
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        let mut delays: Vec<Duration> = delays.into_iter().collect();
        if delays.is_empty() {
            delays.push(Duration::ZERO);
        }
        Self {
            delays,
            max_attempts: None,
        }
    }

    /// Builds a schedule from millisecond delays.
    pub fn from_millis(delays_ms: &[u64]) -> Self {
        Self::new(delays_ms.iter().copied().map(Duration::from_millis))
    }

    /// Caps the number of consecutive reconnect attempts.
    ///
    /// `None` (the default) retries forever at the last delay.
    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the delay for the given retry counter value.
    pub fn delay_for(&self, retry_count: usize) -> Duration {
        let index = retry_count.min(self.delays.len() - 1);
        self.delays[index]
    }

    /// Returns `true` when another attempt is allowed after `retry_count`
    /// consecutive failures.
    pub fn allows_attempt(&self, retry_count: usize) -> bool {
        self.max_attempts
            .map_or(true, |max_attempts| retry_count < max_attempts)
    }

    /// Configured attempt cap, if any.
    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    /// Delays in schedule order.
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_RETRY_DELAYS_MS)
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, RetrySchedule};

    #[test]
    fn default_schedule_starts_at_half_second() {
        let schedule = RetrySchedule::default();
        assert_eq!(schedule.delay_for(0), Duration::from_millis(500));
        assert_eq!(schedule.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(schedule.delay_for(6), Duration::from_millis(30_000));
    }

    #[test]
    fn last_delay_repeats_once_exhausted() {
        let schedule = RetrySchedule::from_millis(&[10, 20]);
        assert_eq!(schedule.delay_for(2), Duration::from_millis(20));
        assert_eq!(schedule.delay_for(500), Duration::from_millis(20));
    }

    #[test]
    fn empty_schedule_yields_zero_delay() {
        let schedule = RetrySchedule::new(Vec::new());
        assert_eq!(schedule.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn unlimited_by_default() {
        let schedule = RetrySchedule::default();
        assert!(schedule.allows_attempt(usize::MAX - 1));
    }

    #[test]
    fn max_attempts_stops_retrying() {
        let schedule = RetrySchedule::default().with_max_attempts(Some(2));
        assert!(schedule.allows_attempt(0));
        assert!(schedule.allows_attempt(1));
        assert!(!schedule.allows_attempt(2));
    }

    #[test]
    fn timeout_elapses_for_pending_future() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let result = with_timeout(
                Duration::from_millis(5),
                std::future::pending::<()>(),
            )
            .await;
            assert!(result.is_err());
        });
    }
}
