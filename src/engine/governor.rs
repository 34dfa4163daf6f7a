use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::debug;

/// Account-wide pacing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateState {
    pub min_delay: Duration,
    pub backoff_until: Option<Instant>,
}

/// Paces dispatch attempts: a fixed minimum spacing plus any flood-wait
/// window the server imposed. It only waits; retrying is the caller's job.
#[derive(Debug)]
pub struct RateGovernor {
    state: RateState,
    last_dispatch: Option<Instant>,
}

impl RateGovernor {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            state: RateState {
                min_delay,
                backoff_until: None,
            },
            last_dispatch: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> RateState {
        self.state
    }

    /// Earliest instant the next attempt may start
    pub fn ready_at(&self) -> Option<Instant> {
        let spaced = self.last_dispatch.map(|last| last + self.state.min_delay);
        match (spaced, self.state.backoff_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Wait until both the minimum delay and any backoff have elapsed, then
    /// count the caller's attempt as started.
    pub async fn gate(&mut self) {
        if let Some(ready_at) = self.ready_at() {
            if ready_at > Instant::now() {
                sleep_until(ready_at).await;
            }
        }

        let now = Instant::now();
        if self.state.backoff_until.is_some_and(|until| until <= now) {
            debug!("Flood wait elapsed");
            self.state.backoff_until = None;
        }
        self.last_dispatch = Some(now);
    }

    /// Extend the backoff window to `now + retry_after`; never shortens it
    pub fn record_throttle(&mut self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        match self.state.backoff_until {
            Some(current) if current >= until => {}
            _ => self.state.backoff_until = Some(until),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = Instant::now() - start;
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "elapsed {:?}, expected {:?}",
            elapsed,
            expected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_gate_is_immediate() {
        let mut governor = RateGovernor::new(Duration::from_secs(1));
        let start = Instant::now();
        governor.gate().await;
        assert_elapsed(start, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_spaces_attempts() {
        let mut governor = RateGovernor::new(Duration::from_millis(1500));
        let start = Instant::now();
        governor.gate().await;
        governor.gate().await;
        governor.gate().await;
        assert_elapsed(start, Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_never_shortens_backoff() {
        let mut governor = RateGovernor::new(Duration::from_secs(1));
        let start = Instant::now();
        governor.record_throttle(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(1)).await;
        governor.record_throttle(Duration::from_secs(3));
        assert_eq!(
            governor.state().backoff_until,
            Some(start + Duration::from_secs(10))
        );

        governor.record_throttle(Duration::from_secs(20));
        assert_eq!(
            governor.state().backoff_until,
            Some(start + Duration::from_secs(21))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_waits_for_backoff_then_clears_it() {
        let mut governor = RateGovernor::new(Duration::from_secs(1));
        let start = Instant::now();
        governor.gate().await;
        governor.record_throttle(Duration::from_secs(10));
        governor.gate().await;
        assert_elapsed(start, Duration::from_secs(10));
        assert_eq!(governor.state().backoff_until, None);

        governor.gate().await;
        assert_elapsed(start, Duration::from_secs(11));
    }
}
