use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

/// Exponential backoff with optional jitter for calls to collaborators.
///
/// Setting `base_delay_ms == max_delay_ms` gives a fixed delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base_delay_ms = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, 1, 1, 0.0)
    }

    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self::new(max_attempts, ms, ms, 0.0)
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        if self.jitter_pct <= 0.0 {
            return Duration::from_millis(delay);
        }
        let spread = (delay as f64 * self.jitter_pct) as i64;
        let delta = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(delay.saturating_add_signed(delta))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.next_delay(attempt - 1);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 200, 2_000, 0.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn new_clamps_input_parameters() {
        let policy = RetryPolicy::new(0, 0, 0, 2.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.max_delay_ms, 1);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[test]
    fn next_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 500, 0.0);
        let delays: Vec<_> = (0..5).map(|attempt| policy.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500)); // capped
    }

    #[test]
    fn fixed_policy_never_grows() {
        let policy = RetryPolicy::fixed(4, Duration::from_millis(50));
        assert_eq!(policy.next_delay(0), Duration::from_millis(50));
        assert_eq!(policy.next_delay(3), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let policy = RetryPolicy::new(3, 10, 10, 0.0);
        let attempts = Arc::new(AtomicUsize::new(0));

        let result: Result<&'static str, &str> = policy
            .retry_if(
                |attempt| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        if attempt < 2 { Err("boom") } else { Ok("ok") }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let policy = RetryPolicy::new(2, 5, 5, 0.0);
        let attempts = AtomicUsize::new(0);

        let result: Result<(), &str> = policy
            .retry_if(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("nope") }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Err("nope"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, 1, 1, 0.0);
        let attempts = AtomicUsize::new(0);

        let result: Result<(), &str> = policy
            .retry_if(
                |_| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("permanent") }
                },
                |err| *err != "permanent",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
