use std::time::Duration;

use rand::Rng;

/// Exponential retry delay for remote calls that failed as unavailable.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn remote_default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(10), true)
    }

    /// Never sleeps; keeps retry loops fast in tests.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let ceiling = base_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(max_ms);
        if self.jitter && ceiling > 0 {
            // Keep at least half the ceiling so retries never collapse to zero.
            Duration::from_millis(rng.gen_range(ceiling / 2..=ceiling))
        } else {
            Duration::from_millis(ceiling)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn doubles_until_capped() {
        let backoff = Backoff::new(
            Duration::from_millis(250),
            Duration::from_secs(1),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 1000, 1000]);
    }

    #[test]
    fn jitter_stays_within_upper_half() {
        let backoff = Backoff::remote_default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            let ceiling = Duration::from_millis(250 * (1 << attempt)).min(Duration::from_secs(10));
            assert!(delay <= ceiling);
            assert!(delay >= ceiling / 2);
        }
    }

    #[test]
    fn immediate_never_waits() {
        assert_eq!(Backoff::immediate().delay(5), Duration::ZERO);
    }
}
