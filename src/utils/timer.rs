//! Deadline timer driven by an injectable `Clock`.

use std::sync::Arc;
use std::time::SystemTime;

use crate::lease::Clock;
use crate::utils::LeaseError;

use tokio::time::Duration;

/// Timer utility for signalling after a given timeout. Supports restarting
/// with a different duration.
///
/// The deadline is absolute on the clock, so `timeout()` may be dropped and
/// re-awaited (e.g., as a `tokio::select!` branch re-created every loop
/// iteration) without losing progress.
#[derive(Debug)]
pub struct Timer {
    clock: Arc<dyn Clock>,

    /// Absolute deadline of the current kick-off.
    deadline: SystemTime,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Timer {
    /// Creates a new timer that is immediately due.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let deadline = clock.now();
        Timer {
            clock,
            deadline,
            last_dur: Duration::ZERO,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Restarts the timer with the given duration from the current time.
    pub fn restart(&mut self, dur: Duration) -> Result<(), LeaseError> {
        let deadline = match self.clock.now().checked_add(dur) {
            Some(deadline) if !dur.is_zero() => deadline,
            _ => {
                return Err(LeaseError::msg(format!(
                    "invalid timeout duration {} ns",
                    dur.as_nanos()
                )));
            }
        };

        self.last_dur = dur;
        self.deadline = deadline;
        Ok(())
    }

    /// Returns true if the deadline has passed.
    pub fn is_due(&self) -> bool {
        self.clock.now() >= self.deadline
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&self) {
        self.clock.sleep_until(self.deadline).await
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use crate::lease::ManualClock;
    use tokio::time;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new_is_due() {
        let timer = Timer::new(Arc::new(ManualClock::default()));
        assert!(timer.get_dur().is_zero());
        assert!(timer.is_due());
        timer.timeout().await; // completes immediately
    }

    #[test]
    fn timer_invalid_restart() {
        let mut timer = Timer::new(Arc::new(ManualClock::default()));
        assert!(timer.restart(Duration::ZERO).is_err());
        assert!(timer.restart(Duration::MAX).is_err());
        // a rejected restart keeps the previous deadline
        assert!(timer.is_due());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), LeaseError> {
        let clock = ManualClock::default();
        let mut timer = Timer::new(Arc::new(clock.clone()));
        timer.restart(Duration::from_secs(1))?;
        assert!(!timer.is_due());
        assert_eq!(timer.get_dur(), Duration::from_secs(1));

        // dropping the waiting future must not lose the deadline
        assert!(time::timeout(Duration::from_millis(50), timer.timeout())
            .await
            .is_err());
        clock.advance(Duration::from_millis(999));
        assert!(!timer.is_due());
        clock.advance(Duration::from_millis(1));
        assert!(timer.is_due());
        time::timeout(Duration::from_secs(1), timer.timeout())
            .await
            .map_err(LeaseError::msg)?;

        // restart with a longer backoff
        timer.restart(timer.get_dur() + Duration::from_secs(1))?;
        assert_eq!(timer.get_dur(), Duration::from_secs(2));
        assert!(!timer.is_due());
        Ok(())
    }
}
