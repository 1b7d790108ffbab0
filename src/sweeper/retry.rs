use std::time::Duration;

/// Linear backoff: delay = base_delay_ms * attempt_number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinearBackoff {
    pub base_delay_ms: u64,
}

impl LinearBackoff {
    pub fn new(base_delay_ms: u64) -> Self {
        Self { base_delay_ms }
    }

    /// `attempt_number` is one-based; zero yields no delay.
    pub fn calculate_delay_ms(&self, attempt_number: u32) -> u64 {
        if attempt_number == 0 {
            return 0;
        }
        self.base_delay_ms.saturating_mul(u64::from(attempt_number))
    }

    pub fn delay(&self, attempt_number: u32) -> Duration {
        Duration::from_millis(self.calculate_delay_ms(attempt_number))
    }
}
