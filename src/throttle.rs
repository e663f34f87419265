//! Lane-local pacing from recorded timestamps

use std::time::{Duration, Instant, SystemTime};

/// Scales recorded gaps between operations on one lane.
///
/// A speed of 2.0 replays twice as fast as captured, 0.5 half as fast. Zero
/// or infinity removes pacing entirely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedThrottle {
    speed: f64,
}

impl SpeedThrottle {
    /// Sentinel speed meaning "as fast as the target accepts work"
    pub const UNTHROTTLED: f64 = f64::INFINITY;

    /// Create a throttle; negative or NaN speeds are treated as unthrottled
    #[must_use]
    pub fn new(speed: f64) -> Self {
        Self { speed }
    }

    /// Throttle that never delays
    #[must_use]
    pub fn unthrottled() -> Self {
        Self::new(Self::UNTHROTTLED)
    }

    /// Configured speed factor
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Whether pacing is disabled
    #[must_use]
    pub fn is_unthrottled(&self) -> bool {
        !(self.speed.is_finite() && self.speed > 0.0)
    }

    /// Delay between issuing the operation captured at `last` and the one
    /// captured at `next`. Out-of-order timestamps yield zero.
    #[must_use]
    pub fn delay_before_next(&self, last: SystemTime, next: SystemTime) -> Duration {
        if self.is_unthrottled() {
            return Duration::ZERO;
        }

        let Ok(gap) = next.duration_since(last) else {
            return Duration::ZERO;
        };

        Duration::try_from_secs_f64(gap.as_secs_f64() / self.speed).unwrap_or(Duration::MAX)
    }
}

impl Default for SpeedThrottle {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Per-lane pacing state
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneClock {
    last_captured: Option<SystemTime>,
    last_issued: Option<Instant>,
}

impl LaneClock {
    /// Fresh clock; the first operation on a lane is never delayed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How long to wait at `now` before issuing an operation captured at
    /// `next`. Time already spent since the previous issue counts toward the
    /// recorded gap.
    #[must_use]
    pub fn wait_before(&self, throttle: &SpeedThrottle, next: SystemTime, now: Instant) -> Duration {
        let (Some(last_captured), Some(last_issued)) = (self.last_captured, self.last_issued) else {
            return Duration::ZERO;
        };

        let delay = throttle.delay_before_next(last_captured, next);
        delay.saturating_sub(now.saturating_duration_since(last_issued))
    }

    /// Note that an operation captured at `captured` was issued at `at`
    pub fn issued(&mut self, captured: SystemTime, at: Instant) {
        self.last_captured = Some(captured);
        self.last_issued = Some(at);
    }

    /// Capture timestamp of the last issued operation
    #[must_use]
    pub fn last_captured(&self) -> Option<SystemTime> {
        self.last_captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(ms)
    }

    #[test]
    fn test_delay_scales_with_speed() {
        let throttle = SpeedThrottle::new(2.0);
        assert_eq!(
            throttle.delay_before_next(at(1000), at(2000)),
            Duration::from_millis(500)
        );

        let slow = SpeedThrottle::new(0.5);
        assert_eq!(
            slow.delay_before_next(at(1000), at(2000)),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn test_non_monotonic_timestamps_issue_immediately() {
        let throttle = SpeedThrottle::new(1.0);
        assert_eq!(throttle.delay_before_next(at(2000), at(1000)), Duration::ZERO);
        assert_eq!(throttle.delay_before_next(at(2000), at(2000)), Duration::ZERO);
    }

    #[test]
    fn test_zero_and_sentinel_are_unthrottled() {
        for speed in [0.0, SpeedThrottle::UNTHROTTLED, -1.0, f64::NAN] {
            let throttle = SpeedThrottle::new(speed);
            assert!(throttle.is_unthrottled());
            assert_eq!(
                throttle.delay_before_next(at(0), at(3_600_000)),
                Duration::ZERO
            );
        }
    }

    #[test]
    fn test_tiny_speed_saturates() {
        let throttle = SpeedThrottle::new(f64::MIN_POSITIVE);
        assert_eq!(
            throttle.delay_before_next(at(0), at(3_600_000)),
            Duration::MAX
        );
    }

    #[test]
    fn test_lane_clock_subtracts_elapsed() {
        let throttle = SpeedThrottle::new(1.0);
        let mut clock = LaneClock::new();
        let start = Instant::now();

        assert_eq!(clock.wait_before(&throttle, at(0), start), Duration::ZERO);

        clock.issued(at(0), start);
        assert_eq!(clock.last_captured(), Some(at(0)));
        assert_eq!(
            clock.wait_before(&throttle, at(500), start + Duration::from_millis(200)),
            Duration::from_millis(300)
        );
        assert_eq!(
            clock.wait_before(&throttle, at(500), start + Duration::from_millis(900)),
            Duration::ZERO
        );
    }
}
