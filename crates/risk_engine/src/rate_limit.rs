use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Admits at most `limit` requests in any rolling window. Excess requests
/// are refused outright, never queued.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    admitted: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn per_second(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = limit.max(1) as usize;
        Self {
            limit,
            window,
            admitted: VecDeque::with_capacity(limit),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.admitted.front() {
            if now.saturating_duration_since(*front) >= self.window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        if self.admitted.len() < self.limit {
            self.admitted.push_back(now);
            return true;
        }

        metrics::counter!("risk.throttled").increment(1);
        false
    }

    pub fn in_window(&self) -> usize {
        self.admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fifteen_requests_in_200ms_admit_ten() {
        let mut limiter = SlidingWindowLimiter::per_second(10);
        let start = Instant::now();
        let admitted = (0..15)
            .map(|i| start + Duration::from_millis(i * 13))
            .filter(|at| limiter.try_acquire_at(*at))
            .count();
        assert_eq!(admitted, 10);
        assert_eq!(limiter.in_window(), 10);
    }

    #[test]
    fn window_slides() {
        let mut limiter = SlidingWindowLimiter::per_second(2);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(500)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_millis(999)));
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(1_000)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_millis(1_200)));
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(1_500)));
    }

    #[test]
    fn zero_limit_still_admits_one() {
        let mut limiter = SlidingWindowLimiter::per_second(0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(!limiter.try_acquire_at(t0));
    }

    proptest! {
        #[test]
        fn never_exceeds_limit_in_any_rolling_second(
            limit in 1u32..20,
            gaps in proptest::collection::vec(0u64..400, 1..200),
        ) {
            let mut limiter = SlidingWindowLimiter::per_second(limit);
            let t0 = Instant::now();
            let mut offset = 0u64;
            let mut admitted = Vec::new();
            for gap in gaps {
                offset += gap;
                if limiter.try_acquire_at(t0 + Duration::from_millis(offset)) {
                    admitted.push(offset);
                }
            }
            for (i, start) in admitted.iter().enumerate() {
                let in_second = admitted[i..].iter().take_while(|t| **t < start + 1_000).count();
                prop_assert!(in_second <= limit as usize);
            }
        }
    }
}
