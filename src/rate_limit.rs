use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Spaces out requests to one API endpoint
pub struct RateLimiter {
    rate_limit_rps: f64,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(rate_limit_rps: f64) -> Self {
        Self {
            rate_limit_rps,
            last_request: Mutex::new(None),
        }
    }

    /// Wait until the next request is allowed. A non-positive rate disables limiting.
    pub async fn acquire(&self) {
        if self.rate_limit_rps <= 0.0 {
            return;
        }

        let min_interval = Duration::from_secs_f64(1.0 / self.rate_limit_rps);
        let mut last_request = self.last_request.lock().await;

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }

        *last_request = Some(Instant::now());
    }
}
