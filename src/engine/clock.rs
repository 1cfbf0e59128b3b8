//! Time source for the execution driver
//!
//! The driver never calls `Utc::now()` or `tokio::time::sleep` directly; it
//! goes through a [`Clock`] so retry backoff can be observed in tests without
//! waiting on the wall clock. [`MockClock`] keeps virtual time: sleeping
//! advances it instantly and records the requested delay.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Real time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("Cannot move clock backwards: current time is {current}, target is {target}")]
    CannotGoBackwards {
        current: DateTime<Utc>,
        target: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct ClockState {
    virtual_time: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

/// Virtual clock; clones share the same state
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<RwLock<ClockState>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClock {
    /// Start virtual time at the current real time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(time: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ClockState {
                virtual_time: time,
                sleeps: Vec::new(),
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ClockState) -> T) -> T {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Advance the clock by a duration
    pub fn forward(&self, duration: Duration) {
        self.with_state(|s| s.virtual_time = advance(s.virtual_time, duration));
    }

    /// Advance the clock to a specific time
    pub fn forward_until(&self, target: DateTime<Utc>) -> Result<(), ClockError> {
        self.with_state(|s| {
            if target < s.virtual_time {
                return Err(ClockError::CannotGoBackwards {
                    current: s.virtual_time,
                    target,
                });
            }
            s.virtual_time = target;
            Ok(())
        })
    }

    /// Every delay requested through `sleep`, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.with_state(|s| s.sleeps.clone())
    }

    pub fn total_slept(&self) -> Duration {
        self.with_state(|s| s.sleeps.iter().sum())
    }
}

fn advance(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| time.checked_add_signed(d))
        .unwrap_or(time)
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.with_state(|s| s.virtual_time)
    }

    async fn sleep(&self, duration: Duration) {
        self.with_state(|s| {
            s.sleeps.push(duration);
            s.virtual_time = advance(s.virtual_time, duration);
        });
        tokio::task::yield_now().await;
    }
}
