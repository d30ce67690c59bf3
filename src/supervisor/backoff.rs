use std::time::Duration;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_FACTOR: u32 = 2;

/// Capped exponential delay between relaunches of a failing program.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    tries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            tries: 0,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl Backoff {
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor;
        self
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    pub fn reset(&mut self) {
        self.tries = 0;
    }

    /// Delay to wait before the next attempt. Advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = exponential(self.tries, self.initial_delay, self.factor, self.max_delay);
        self.tries = self.tries.saturating_add(1);
        delay
    }
}

/// `initial_delay * factor^tries`, saturating at `max_delay`.
pub fn exponential(tries: u32, initial_delay: Duration, factor: u32, max_delay: Duration) -> Duration {
    factor
        .checked_pow(tries)
        .and_then(|multiplier| initial_delay.checked_mul(multiplier))
        .map_or(max_delay, |delay| delay.min(max_delay))
}
