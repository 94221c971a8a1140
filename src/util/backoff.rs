use std::cmp::min;
use std::marker::PhantomData;
use std::time::Duration;

use crate::util::random::{Random, RngRandom};

/// Computes the delays between consecutive reconnect attempts: starting at an initial delay, each
///  attempt multiplies the delay by a factor (in eighths) up to a maximum. Every delay is jittered
///  downwards by up to 25%.
pub struct ExponentialBackoff<R: Random = RngRandom> {
    attempts: u32,
    next_delay: Duration,

    config_max_delay: Duration,
    config_factor_eighths: u32,

    _random: PhantomData<R>,
}

impl ExponentialBackoff<RngRandom> {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::new_with_random(initial_delay, max_delay)
    }
}

impl <R: Random> ExponentialBackoff<R> {
    pub fn new_with_random(initial_delay: Duration, max_delay: Duration) -> Self {
        let result = ExponentialBackoff {
            attempts: 0,
            next_delay: min(initial_delay, max_delay),
            config_max_delay: max_delay,
            config_factor_eighths: 8*2,
            _random: PhantomData,
        };

        assert!(result.config_factor_eighths >= 8);

        result
    }

    /// number of delays handed out since creation
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let raw = self.next_delay;

        self.attempts = self.attempts.saturating_add(1);
        self.next_delay = (raw * self.config_factor_eighths / 8)
            .min(self.config_max_delay);

        let jitter = R::gen_f64_range(0.75..1.0);
        Duration::from_nanos((raw.as_nanos() as f64 * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use super::*;

    #[rstest]
    #[case::first(50, 2000, 1, vec![50])]
    #[case::doubling(50, 2000, 4, vec![50, 100, 200, 400])]
    #[case::capped(50, 300, 5, vec![50, 100, 200, 300, 300])]
    #[case::initial_above_max(500, 300, 2, vec![300, 300])]
    fn test_next_delay(
        #[case] initial_millis: u64,
        #[case] max_millis: u64,
        #[case] num_attempts: usize,
        #[case] expected_millis: Vec<u64>,
    ) {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect()
            .returning(|_| 1.0);

        let mut backoff = ExponentialBackoff::<MockRandom>::new_with_random(Duration::from_millis(initial_millis), Duration::from_millis(max_millis));

        let actual = (0..num_attempts)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect::<Vec<_>>();
        assert_eq!(actual, expected_millis);
        assert_eq!(backoff.attempts(), num_attempts as u32);
    }

    #[test]
    fn test_jitter() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx = MockRandom::gen_f64_range_context();
        ctx.expect()
            .withf(|range| range.start == 0.75 && range.end == 1.0)
            .returning(|_| 0.75);

        let mut backoff = ExponentialBackoff::<MockRandom>::new_with_random(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(75));
        assert_eq!(backoff.next_delay(), Duration::from_millis(150));
    }
}
