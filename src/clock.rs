use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Wall-clock time and the waits between ticks.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);

    /// Sleep until the wall-clock `deadline`, returning immediately when it has already passed.
    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let remaining = (deadline - self.now()).to_std().unwrap_or_default();
        self.sleep(remaining).await;
    }
}

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

/// Clock driven by the tokio timer, so that paused tests can fast-forward it.
///
/// Every requested sleep is recorded.
#[cfg(test)]
pub struct PausedClock {
    origin: DateTime<Utc>,
    started_at: tokio::time::Instant,
    sleeps: std::sync::Mutex<Vec<Duration>>,
}

#[cfg(test)]
impl PausedClock {
    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self { origin, started_at: tokio::time::Instant::now(), sleeps: std::sync::Mutex::default() }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + chrono::TimeDelta::from_std(self.started_at.elapsed()).unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        tokio::time::sleep(duration).await;
    }
}
