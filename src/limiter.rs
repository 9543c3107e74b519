//! Frame limiter
//!
//! Paces a periodic operation to a target rate on a monotonic clock. The
//! internal mark advances by exactly one period per on-time tick, so sleep
//! granularity error in one tick is compensated in the next and the long-run
//! average rate stays locked to the target. A caller that falls behind
//! schedule is not punished twice: the mark resets to "now" and pacing
//! resumes from there instead of skipping waits to catch up.

use std::time::{Duration, Instant};

pub struct FrameLimiter {
    period: Duration,
    /// None until the first tick; the clock anchors at first real use.
    mark: Option<Instant>,
}

impl FrameLimiter {
    /// A target of 0 (or anything non-positive/non-finite) disables pacing.
    pub fn new(fps: f64) -> Self {
        let period = if fps.is_finite() && fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        Self { period, mark: None }
    }

    pub fn is_disabled(&self) -> bool {
        self.period.is_zero()
    }

    /// Account one tick and return how long the caller must sleep to stay on
    /// schedule. The very first tick anchors the clock and never sleeps.
    ///
    /// Separated from [`wait`](Self::wait) so a caller holding a lock around
    /// the limiter can release it before sleeping.
    pub fn tick(&mut self) -> Duration {
        if self.period.is_zero() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let Some(mark) = self.mark else {
            self.mark = Some(now);
            return Duration::ZERO;
        };

        match self.period.checked_sub(now.duration_since(mark)) {
            Some(sleep) if !sleep.is_zero() => {
                // Advance by the full interval, not the post-sleep clock
                // reading; oversleep surfaces as a shorter next tick.
                self.mark = Some(now + sleep);
                sleep
            }
            _ => {
                // Running behind schedule: reset, don't burst.
                self.mark = Some(now);
                Duration::ZERO
            }
        }
    }

    /// Block the calling thread until the next scheduled tick.
    pub fn wait(&mut self) {
        let sleep = self.tick();
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_never_sleeps() {
        let mut limiter = FrameLimiter::new(0.0);
        assert!(limiter.is_disabled());
        for _ in 0..100 {
            assert_eq!(limiter.tick(), Duration::ZERO);
        }

        assert!(FrameLimiter::new(-5.0).is_disabled());
        assert!(FrameLimiter::new(f64::NAN).is_disabled());
        assert!(FrameLimiter::new(f64::INFINITY).is_disabled());
    }

    #[test]
    fn test_first_tick_anchors_without_sleeping() {
        let mut limiter = FrameLimiter::new(50.0);
        assert_eq!(limiter.tick(), Duration::ZERO);
        // The second tick is on the schedule established by the first.
        assert!(limiter.tick() > Duration::ZERO);
    }

    #[test]
    fn test_average_rate_converges_to_target() {
        // 100 Hz, 30 paced ticks with negligible work between them.
        let fps = 100.0;
        let ticks = 30u32;
        let mut limiter = FrameLimiter::new(fps);

        limiter.wait(); // anchor
        let start = Instant::now();
        for _ in 0..ticks {
            limiter.wait();
        }
        let elapsed = start.elapsed();

        let period = Duration::from_secs_f64(1.0 / fps);
        let expected = period * ticks;
        // Carry-forward correction bounds total error by roughly one tick of
        // scheduling jitter; allow generous slack for loaded CI machines.
        assert!(
            elapsed >= expected - period,
            "ran fast: {elapsed:?} < {expected:?}"
        );
        assert!(
            elapsed <= expected + Duration::from_millis(150),
            "drifted: {elapsed:?} > {expected:?}"
        );
    }

    #[test]
    fn test_slow_caller_is_not_penalized_twice() {
        let mut limiter = FrameLimiter::new(100.0);
        limiter.wait(); // anchor
        // Simulate a slow frame: blow well past the 10ms period.
        std::thread::sleep(Duration::from_millis(30));
        // Already behind schedule, so the tick must not sleep...
        assert_eq!(limiter.tick(), Duration::ZERO);
        // ...and must not skip future waits to catch up either.
        assert!(limiter.tick() > Duration::ZERO);
    }

    #[test]
    fn test_replacement_reanchors() {
        // A rate change discards the limiter; the replacement's first tick
        // must never sleep, and subsequent ticks follow the new period.
        let mut limiter = FrameLimiter::new(30.0);
        limiter.wait();
        limiter.wait();

        limiter = FrameLimiter::new(200.0);
        assert_eq!(limiter.tick(), Duration::ZERO);
        let sleep = limiter.tick();
        assert!(sleep > Duration::ZERO);
        assert!(sleep <= Duration::from_secs_f64(1.0 / 200.0));
    }
}
