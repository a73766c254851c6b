use rand_core::{OsRng, RngCore};

/// Backoff schedule for failed delivery attempts: exponential with full
/// jitter, capped. A retriable failure re-schedules the entry at
/// `now + uniform(0, min(cap, base << retry_count))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub base_secs: u64,
    pub cap_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 10, base_secs: 60, cap_secs: 86_400 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u8, base_secs: u64, cap_secs: u64) -> Self {
        Self { max_retries, base_secs, cap_secs }
    }

    /// Ceiling of the delay for the given attempt number.
    pub fn max_delay_secs(&self, retry_count: u8) -> u64 {
        let exp = u32::from(retry_count.min(63));
        let factor = 1u64 << exp.min(63);
        self.base_secs
            .checked_mul(factor)
            .map_or(self.cap_secs, |delay| delay.min(self.cap_secs))
    }

    /// Jittered delay for the given attempt number.
    pub fn delay_secs(&self, retry_count: u8) -> u64 {
        let ceiling = self.max_delay_secs(retry_count);
        if ceiling == 0 {
            return 0;
        }
        OsRng.next_u64() % (ceiling + 1)
    }

    pub fn exhausted(&self, retry_count: u8) -> bool {
        retry_count >= self.max_retries
    }
}
