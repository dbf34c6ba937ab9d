use std::time::Duration;

use crate::config::CacheOptions;
use crate::error::TransportError;

/// Bounded retry with a fixed pause between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per call, the first one included.
    pub max_retries: u32,
    pub interval: Duration,
    retryable: fn(&TransportError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            retryable: TransportError::is_retryable,
        }
    }

    pub fn from_options(options: &CacheOptions) -> Self {
        Self::new(options.max_retries, options.retry_interval())
    }

    /// Replaces the default classification of retryable errors.
    pub fn with_predicate(mut self, retryable: fn(&TransportError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Whether a failure on `attempt` (counting from 1) is final.
    pub fn should_raise(&self, attempt: u32, err: &TransportError) -> bool {
        attempt >= self.max_retries.max(1) || !(self.retryable)(err)
    }

    /// Runs `op` until it succeeds or the policy gives up, returning the last
    /// error in that case.
    pub fn execute<T, F>(&self, name: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Result<T, TransportError>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match op() {
                Ok(value) => return Ok(value),
                Err(err) if self.should_raise(attempt, &err) => return Err(err),
                Err(err) => {
                    tracing::debug!(call = name, attempt, %err, "cache call failed, retrying");
                    std::thread::sleep(self.interval);
                }
            }
        }
    }
}
