use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Jittered exponential backoff for transient failures in async operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration, jitter_pct: f64) -> Self {
        let base = base_delay.max(Duration::from_millis(1));
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: base,
            max_delay: max_delay.max(base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Defaults tuned for flaky network calls: 3 attempts, 500ms base, 5s cap.
    pub fn network() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(5), 0.2)
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = 2u32.saturating_pow(attempt as u32);
        let mut delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter_pct > 0.0 {
            let spread = (delay.as_millis() as f64 * self.jitter_pct) as i64;
            if spread > 0 {
                let delta = rand::thread_rng().gen_range(-spread..=spread);
                let ms = (delay.as_millis() as i64 + delta).max(0) as u64;
                delay = Duration::from_millis(ms);
            }
        }
        delay
    }

    /// Runs `op` until it succeeds or `max_attempts` is exhausted, sleeping
    /// between attempts. The closure receives the zero-based attempt number.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::network()
    }
}
