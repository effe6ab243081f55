use rand::Rng;
use std::time::Duration;

/// Quadratic backoff: `attempt² × unit` plus up to one `unit` of jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    unit: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(unit: Duration, jitter: bool) -> Self {
        Self { unit, jitter }
    }

    pub fn unit(&self) -> Duration {
        self.unit
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let unit_ms = self.unit.as_millis().min(u128::from(u64::MAX)) as u64;
        let squared = u64::from(attempt).saturating_mul(u64::from(attempt));
        let base_ms = unit_ms.saturating_mul(squared);
        let jitter_ms = if self.jitter && unit_ms > 0 {
            rng.gen_range(0..unit_ms)
        } else {
            0
        };
        Duration::from_millis(base_ms.saturating_add(jitter_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn backoff_without_jitter_is_quadratic() {
        let backoff = Backoff::new(Duration::from_millis(100), false);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(backoff.delay_with_rng(0, &mut rng), Duration::ZERO);
        assert_eq!(
            backoff.delay_with_rng(1, &mut rng),
            Duration::from_millis(100)
        );
        assert_eq!(
            backoff.delay_with_rng(2, &mut rng),
            Duration::from_millis(400)
        );
        assert_eq!(
            backoff.delay_with_rng(3, &mut rng),
            Duration::from_millis(900)
        );
    }

    #[test]
    fn jitter_stays_below_one_unit() {
        let backoff = Backoff::new(Duration::from_millis(100), true);
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..20 {
            let delay = backoff.delay_with_rng(attempt, &mut rng);
            let base = Duration::from_millis(100 * u64::from(attempt * attempt));
            assert!(delay >= base);
            assert!(delay < base + Duration::from_millis(100));
        }
    }

    #[test]
    fn jittered_delays_never_decrease() {
        let backoff = Backoff::new(Duration::from_millis(250), true);
        let mut rng = StdRng::seed_from_u64(7);
        let delays: Vec<_> = (1..30)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng))
            .collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::new(Duration::from_secs(1), false);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(backoff.delay_with_rng(u32::MAX, &mut rng) > Duration::from_secs(1_000_000));
    }
}
