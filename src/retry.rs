use std::{future::Future, time::Duration};

use crate::{clock::Clock, device::DeviceClient, error::FetchError, prelude::*};

/// Bounded exponential backoff around a single gateway fetch.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts spent on network failures, including the first one.
    pub max_attempts: u32,

    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `n_failures`-th failed attempt.
    pub fn backoff(&self, n_failures: u32) -> Duration {
        let exponent = i32::try_from(n_failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let seconds = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if seconds.is_finite() && seconds < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(seconds)
        } else {
            self.max_delay
        }
    }

    /// Run `fetch` until it succeeds or the policy gives up.
    ///
    /// - [`FetchError::Network`] consumes an attempt and backs off.
    /// - [`FetchError::Auth`] re-authenticates once and retries outside the attempt budget;
    ///   a repeated rejection is returned as is.
    /// - [`FetchError::Parse`] is returned immediately.
    pub async fn run<T, F, Fut>(
        &self,
        clock: &dyn Clock,
        device: &dyn DeviceClient,
        mut fetch: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut n_failures = 0;
        let mut has_reauthenticated = false;

        loop {
            match fetch().await {
                Ok(value) => {
                    if n_failures != 0 {
                        info!(n_failures, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(FetchError::Auth(reason)) if !has_reauthenticated => {
                    warn!(reason, "the gateway has rejected the session, re-authenticating…");
                    has_reauthenticated = true;
                    device.authenticate().await?;
                }
                Err(FetchError::Network(reason)) => {
                    n_failures += 1;
                    if n_failures >= self.max_attempts {
                        return Err(FetchError::Network(reason));
                    }
                    let delay = self.backoff(n_failures);
                    warn!(reason, n_failures, max_attempts = self.max_attempts, ?delay, "retrying…");
                    clock.sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
