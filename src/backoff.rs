/// Exponential backoff calculator for LLM call retries.
///
/// Tracks the current delay and the number of delays handed out. The
/// delay is multiplied after each call to `next_delay()`, capped at
/// `max_delay`.
use std::time::Duration;

pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Number of delays handed out so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            current_delay: initial_delay.min(max_delay),
            attempt: 0,
        }
    }

    /// Returns the current delay and advances the state.
    /// The delay is multiplied (up to `max_delay`) for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt += 1;
        self.current_delay = self
            .current_delay
            .saturating_mul(self.multiplier)
            .min(self.max_delay);
        delay
    }
}
