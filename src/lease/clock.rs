//! Injectable time source for lease start/expiry stamps and coordinator
//! timers.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Source of current time and timer wake-ups.
///
/// Lease records carry wall-clock `SystemTime` stamps because they are shared
/// with other processes through the store; timers are expressed as absolute
/// deadlines on the same clock so that a manual clock can drive them.
#[async_trait]
pub trait Clock: fmt::Debug + Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> SystemTime;

    /// Completes once `now() >= deadline`.
    async fn sleep_until(&self, deadline: SystemTime);
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct WallClock;

#[async_trait]
impl Clock for WallClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep_until(&self, deadline: SystemTime) {
        // a deadline already in the past yields an error here
        if let Ok(dur) = deadline.duration_since(SystemTime::now()) {
            time::sleep(dur).await;
        }
    }
}

/// Manually advanced clock for deterministic tests and simulations. Clones
/// share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    tx_now: Arc<watch::Sender<SystemTime>>,
}

impl ManualClock {
    /// Creates a manual clock starting at `start`.
    pub fn new(start: SystemTime) -> Self {
        let (tx_now, _) = watch::channel(start);
        ManualClock {
            tx_now: Arc::new(tx_now),
        }
    }

    /// Moves time forward by `dur`, waking every sleeper whose deadline has
    /// now passed.
    pub fn advance(&self, dur: Duration) {
        self.tx_now.send_modify(|now| *now += dur);
    }

    /// Jumps to time `t` if it is later than the current time; earlier
    /// values are ignored so that time never runs backwards.
    pub fn set(&self, t: SystemTime) {
        self.tx_now.send_if_modified(|now| {
            if t > *now {
                *now = t;
                true
            } else {
                false
            }
        });
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // any fixed point works; a round number keeps test output readable
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000))
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.tx_now.borrow()
    }

    async fn sleep_until(&self, deadline: SystemTime) {
        let mut rx_now = self.tx_now.subscribe();
        loop {
            let now = *rx_now.borrow_and_update();
            if now >= deadline {
                return;
            }
            if rx_now.changed().await.is_err() {
                // sender lives as long as any clone of self does
                return;
            }
        }
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    #[test]
    fn manual_advance() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now(), t0 + Duration::from_secs(30));
        let shared = clock.clone();
        shared.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), t0 + Duration::from_secs(31));
    }

    #[test]
    fn manual_set_never_backwards() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        clock.set(t0 - Duration::from_secs(5));
        assert_eq!(clock.now(), t0);
        clock.set(t0 + Duration::from_secs(5));
        assert_eq!(clock.now(), t0 + Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manual_sleep_wakes_on_advance() {
        let clock = ManualClock::default();
        let deadline = clock.now() + Duration::from_secs(10);
        let sleeper = clock.clone();
        let handle =
            tokio::spawn(async move { sleeper.sleep_until(deadline).await });

        clock.advance(Duration::from_secs(5));
        time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        clock.advance(Duration::from_secs(5));
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sleeper should wake")
            .expect("sleeper task should not panic");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn wall_past_deadline() {
        let clock = WallClock;
        let start = time::Instant::now();
        clock
            .sleep_until(SystemTime::now() - Duration::from_secs(1))
            .await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
