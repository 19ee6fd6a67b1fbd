// Retry delay strategies

use std::time::Duration;

use rand::Rng;

/// How long to wait before retry attempt N
#[derive(Debug, Clone)]
pub enum DelayStrategy {
    Fixed(Duration),
    Linear {
        base: Duration,
        increment: Duration,
        max: Duration,
    },
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl DelayStrategy {
    /// The SSH dial schedule: sleep = (attempt + 1) x 1s
    pub fn dial() -> Self {
        DelayStrategy::Linear {
            base: Duration::from_secs(1),
            increment: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Calculate the delay for a retry attempt (0-based)
pub fn calculate_delay(strategy: &DelayStrategy, attempt: u32) -> Duration {
    match strategy {
        DelayStrategy::Fixed(duration) => *duration,
        DelayStrategy::Linear {
            base,
            increment,
            max,
        } => {
            let delay_ms =
                base.as_millis() as u64 + increment.as_millis() as u64 * attempt as u64;
            Duration::from_millis(delay_ms.min(max.as_millis() as u64))
        }
        DelayStrategy::Exponential { base, max, jitter } => {
            let multiplier = 2u64.saturating_pow(attempt);
            let delay_ms = (base.as_millis() as u64)
                .saturating_mul(multiplier)
                .min(max.as_millis() as u64);
            let delay = Duration::from_millis(delay_ms);

            if *jitter {
                // 0-25% jitter to spread out simultaneous retries
                let jitter_ms = rand::thread_rng().gen_range(0..=(delay_ms / 4).max(1));
                delay + Duration::from_millis(jitter_ms)
            } else {
                delay
            }
        }
    }
}
