use crate::route_point::{velocity, RoutePoint};
use crate::window_buffer::WindowBuffer;

/// Hysteresis trigger: `run_length` consecutive velocities on one side of a
/// threshold, confirmed by the velocity across the whole run.
#[derive(Debug, Clone)]
pub struct MarkovChain {
    velocity_threshold: f64,
    cumulative_threshold: f64,
    run_length: usize,
    buffer: WindowBuffer,
    consecutive: usize,
}

impl MarkovChain {
    pub fn new(
        velocity_threshold: f64,
        cumulative_threshold: f64,
        run_length: usize,
        seed: RoutePoint,
    ) -> Self {
        let mut chain = MarkovChain {
            velocity_threshold,
            cumulative_threshold,
            run_length,
            buffer: WindowBuffer::new(run_length + 1),
            consecutive: 0,
        };
        chain.buffer.add(seed);
        chain
    }

    /// Reseed with a single point, dropping any partial run
    pub fn refresh(&mut self, seed: RoutePoint) {
        self.flush();
        self.buffer.add(seed);
    }

    /// Start detection: velocities above the threshold
    pub fn check_min_trigger(&mut self, distance: f64, dt_ms: i64, point: RoutePoint) -> bool {
        let passed = velocity(distance, dt_ms).map_or(false, |v| v > self.velocity_threshold);
        self.step(passed, point);
        self.run_complete()
            && self
                .cumulative_velocity()
                .map_or(false, |v| v > self.cumulative_threshold)
    }

    /// Stop detection: velocities below the threshold
    pub fn check_max_trigger(&mut self, distance: f64, dt_ms: i64, point: RoutePoint) -> bool {
        let passed = velocity(distance, dt_ms).map_or(false, |v| v < self.velocity_threshold);
        self.step(passed, point);
        self.run_complete()
            && self
                .cumulative_velocity()
                .map_or(false, |v| v < self.cumulative_threshold)
    }

    /// Current number of consecutive passing velocities (clamped at the run length)
    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    pub fn run_length(&self) -> usize {
        self.run_length
    }

    fn step(&mut self, passed: bool, point: RoutePoint) {
        if passed {
            self.consecutive = (self.consecutive + 1).min(self.run_length);
        } else {
            // The failing point may open the next run, so it is still pushed
            self.flush();
        }
        self.buffer.add(point);
    }

    fn run_complete(&self) -> bool {
        self.consecutive >= self.run_length
    }

    fn flush(&mut self) {
        self.buffer.clear();
        self.consecutive = 0;
    }

    fn cumulative_velocity(&self) -> Option<f64> {
        // A complete run always holds run_length + 1 points
        let oldest = self.buffer.get(self.run_length);
        let newest = self.buffer.get(0);
        oldest.velocity_to(&newest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP_MS: i64 = 2_000;
    // ~11.1 m per 0.0001 degree of latitude
    const DEG_PER_STEP: f64 = 0.0001;

    fn north(i: i64) -> RoutePoint {
        RoutePoint::new(i as f64 * DEG_PER_STEP, 14.0, i * STEP_MS)
    }

    fn feed_min(chain: &mut MarkovChain, prev: RoutePoint, next: RoutePoint) -> bool {
        chain.check_min_trigger(prev.distance_to(&next), prev.millis_until(&next), next)
    }

    fn feed_max(chain: &mut MarkovChain, prev: RoutePoint, next: RoutePoint) -> bool {
        chain.check_max_trigger(prev.distance_to(&next), prev.millis_until(&next), next)
    }

    #[test]
    fn test_min_trigger_fires_on_completing_call() {
        let run = 4;
        let mut chain = MarkovChain::new(1.0, 1.0, run, north(0));
        for i in 1..=run as i64 {
            let fired = feed_min(&mut chain, north(i - 1), north(i));
            assert_eq!(fired, i == run as i64, "call {}", i);
        }
        // Still moving: stays triggered
        assert!(feed_min(&mut chain, north(run as i64), north(run as i64 + 1)));
    }

    #[test]
    fn test_min_trigger_reset_by_slow_sample() {
        let mut chain = MarkovChain::new(1.0, 1.0, 3, north(0));
        assert!(!feed_min(&mut chain, north(0), north(1)));
        assert!(!feed_min(&mut chain, north(1), north(2)));
        // Stationary step
        let still = RoutePoint::new(north(2).latitude, 14.0, 3 * STEP_MS);
        assert!(!feed_min(&mut chain, north(2), still));
        assert_eq!(chain.consecutive(), 0);

        let mut prev = still;
        for i in 1..=3 {
            let next = RoutePoint::new(still.latitude + i as f64 * DEG_PER_STEP, 14.0, (3 + i) * STEP_MS);
            let fired = feed_min(&mut chain, prev, next);
            assert_eq!(fired, i == 3);
            prev = next;
        }
    }

    #[test]
    fn test_cumulative_check_blocks_jitter() {
        // Each step fast, but the run returns to where it started
        let mut chain = MarkovChain::new(1.0, 1.0, 2, north(0));
        let a = north(0);
        let b = RoutePoint::new(north(1).latitude, 14.0, STEP_MS);
        let c = RoutePoint::new(a.latitude, 14.0, 2 * STEP_MS);
        assert!(!feed_min(&mut chain, a, b));
        assert!(!feed_min(&mut chain, b, c));
        assert_eq!(chain.consecutive(), 2);
    }

    #[test]
    fn test_max_trigger_on_stationary_run() {
        let base = north(0);
        let mut chain = MarkovChain::new(1.0, 1.0, 3, base);
        let mut prev = base;
        for i in 1..=3 {
            let next = RoutePoint::new(base.latitude, base.longitude, i * STEP_MS);
            assert_eq!(feed_max(&mut chain, prev, next), i == 3);
            prev = next;
        }
    }

    #[test]
    fn test_zero_interval_fails_threshold() {
        let mut chain = MarkovChain::new(1.0, 1.0, 1, north(0));
        let same_time = RoutePoint::new(north(5).latitude, 14.0, 0);
        assert!(!chain.check_min_trigger(north(0).distance_to(&same_time), 0, same_time));
        assert_eq!(chain.consecutive(), 0);
        assert!(!chain.check_max_trigger(0.0, 0, same_time));
        assert_eq!(chain.consecutive(), 0);
    }

    #[test]
    fn test_refresh_resets_run() {
        let mut chain = MarkovChain::new(1.0, 1.0, 3, north(0));
        feed_min(&mut chain, north(0), north(1));
        feed_min(&mut chain, north(1), north(2));
        chain.refresh(north(2));
        assert_eq!(chain.consecutive(), 0);
        assert!(!feed_min(&mut chain, north(2), north(3)));
    }
}
