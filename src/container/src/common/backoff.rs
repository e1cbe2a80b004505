use std::time::Duration;

/// Exponential backoff between bounded retry attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            current_delay: initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Delay before the next attempt; doubles up to `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.current_delay = Duration::from_secs_f64(
            (self.current_delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()),
        );
        delay
    }
}
