//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 5, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt.min(30) as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Retries every error until `max_retries` is exhausted.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_async_if(cfg, op, |_| true).await
}

/// Like [`retry_async`], but errors for which `should_retry` is false are
/// returned immediately.
pub async fn retry_async_if<F, Fut, T, E, P>(cfg: &RetryConfig, mut op: F, should_retry: P) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries || !should_retry(&e) => return Err(e),
            Err(_) => tokio::time::sleep(cfg.delay_for(attempt)).await,
        }
        attempt += 1;
    }
}
