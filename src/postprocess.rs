use crate::config::PostProcessSettings;
use crate::journey::Journey;
use crate::route_point::RoutePoint;

/// Segments averaged when estimating a journey's arrival speed
pub const AVERAGE_SIZE: usize = 6;

/// Batch clean-up over a list of recorded journeys, oldest first
pub struct PostProcessor {
    journeys: Vec<Journey>,
}

impl PostProcessor {
    pub fn new(journeys: Vec<Journey>) -> Self {
        PostProcessor { journeys }
    }

    pub fn journeys(&self) -> &[Journey] {
        &self.journeys
    }

    pub fn into_journeys(self) -> Vec<Journey> {
        self.journeys
    }

    /// Full pass in the fixed order: near threshold, join, far threshold, trim
    pub fn apply(&mut self, params: &PostProcessSettings) {
        let before = self.journeys.len();
        self.threshold_distance(params.near_distance);
        self.join_journeys(params.join_gap_ms, params.join_velocity_factor);
        self.threshold_distance(params.far_distance);
        self.trim_ends(params.trim_max_points, params.trim_velocity);
        log::info!(
            "[PP] {} journeys in, {} out",
            before,
            self.journeys.len()
        );
    }

    /// Drop journeys whose bounding-box diagonal is below `min_span` metres
    pub fn threshold_distance(&mut self, min_span: f64) {
        self.journeys.retain(|j| {
            let span = j.diagonal_span();
            let keep = span >= min_span;
            if !keep {
                log::debug!("[PP] journey {} dropped (span {:.1} m)", j.id, span);
            }
            keep
        });
    }

    /// Merge each journey into its predecessor when the gap is short in time
    /// and plausible for the predecessor's arrival speed
    pub fn join_journeys(&mut self, max_gap_ms: i64, velocity_factor: f64) {
        if self.journeys.len() < 2 {
            return;
        }
        for i in (0..self.journeys.len() - 1).rev() {
            let (end, start) = match (self.journeys[i].last(), self.journeys[i + 1].first()) {
                (Some(end), Some(start)) => (*end, *start),
                _ => continue,
            };
            let gap = end.millis_until(&start);
            if gap.abs() > max_gap_ms {
                continue;
            }
            let (Some(arrival), Some(bridge)) =
                (arrival_velocity(&self.journeys[i]), end.velocity_to(&start))
            else {
                continue;
            };
            if bridge > velocity_factor * arrival {
                continue;
            }
            let next = self.journeys.remove(i + 1);
            let next_id = next.id;
            match self.journeys[i].append(next) {
                Ok(()) => log::debug!(
                    "[PP] joined {} into {} (gap {} ms, {:.1} m/s)",
                    next_id,
                    self.journeys[i].id,
                    gap,
                    bridge
                ),
                Err(next) => {
                    log::warn!(
                        "[PP] {} not joined into {}: termination code full",
                        next_id,
                        self.journeys[i].id
                    );
                    self.journeys.insert(i + 1, next);
                }
            }
        }
    }

    /// Remove up to `max_trim` jump points from each end of every journey
    pub fn trim_ends(&mut self, max_trim: usize, velocity_threshold: f64) {
        for journey in &mut self.journeys {
            let mut trimmed = 0;
            while trimmed < max_trim && journey.len() > 1 {
                let pts = journey.points();
                if !exceeds(&pts[0], &pts[1], velocity_threshold) {
                    break;
                }
                journey.remove_point(0);
                trimmed += 1;
            }

            trimmed = 0;
            while trimmed < max_trim && journey.len() > 1 {
                let pts = journey.points();
                let n = pts.len();
                if !exceeds(&pts[n - 2], &pts[n - 1], velocity_threshold) {
                    break;
                }
                journey.remove_point(n - 1);
                trimmed += 1;
            }
        }
    }
}

fn exceeds(a: &RoutePoint, b: &RoutePoint, threshold: f64) -> bool {
    a.velocity_to(b).map_or(false, |v| v > threshold)
}

/// Mean speed over the last `AVERAGE_SIZE` segments (fewer on short journeys)
fn arrival_velocity(journey: &Journey) -> Option<f64> {
    let pts = journey.points();
    let segments = (pts.len().checked_sub(1)?).min(AVERAGE_SIZE);
    if segments == 0 {
        return None;
    }
    let tail = &pts[pts.len() - segments - 1..];
    let speeds: Vec<f64> = tail
        .windows(2)
        .filter_map(|w| w[0].velocity_to(&w[1]))
        .collect();
    if speeds.is_empty() {
        return None;
    }
    Some(speeds.iter().sum::<f64>() / speeds.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journey::TerminationReason;

    const T0: i64 = 1_600_000_000_000;
    // metres of latitude per degree on the haversine sphere
    const M_PER_DEG: f64 = 111_195.08;

    fn line(id: i64, start_m: f64, t0: i64, n: usize, step_m: f64, step_ms: i64) -> Journey {
        let mut j = Journey::new(id);
        for i in 0..n {
            let metres = start_m + i as f64 * step_m;
            j.add_point(RoutePoint::new(metres / M_PER_DEG, 0.0, t0 + i as i64 * step_ms));
        }
        j.finish(TerminationReason::NoMotion);
        j
    }

    #[test]
    fn test_join_short_gap() {
        // 5 m/s for 20 points, then a 60 s gap covering 250 m (4.2 m/s)
        let a = line(1, 0.0, T0, 20, 10.0, 2_000);
        let end_a = 190.0;
        let t_end_a = T0 + 19 * 2_000;
        let mut b = line(2, end_a + 250.0, t_end_a + 60_000, 15, 10.0, 2_000);
        b.finish(TerminationReason::UserStop);

        let mut pp = PostProcessor::new(vec![a, b]);
        pp.join_journeys(120_000, 1.2);
        let out = pp.into_journeys();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 35);
        assert_eq!(out[0].id, 1);
        assert_eq!(
            out[0].reason.reasons(),
            vec![TerminationReason::NoMotion, TerminationReason::UserStop]
        );
    }

    #[test]
    fn test_no_join_after_ten_minutes() {
        let a = line(1, 0.0, T0, 20, 10.0, 2_000);
        let b = line(2, 200.0, T0 + 19 * 2_000 + 600_000, 15, 10.0, 2_000);
        let mut pp = PostProcessor::new(vec![a, b]);
        pp.join_journeys(120_000, 1.2);
        assert_eq!(pp.journeys().len(), 2);
    }

    #[test]
    fn test_no_join_on_implausible_jump() {
        // 60 s gap but 2 km away: 33 m/s after arriving at 5 m/s
        let a = line(1, 0.0, T0, 20, 10.0, 2_000);
        let b = line(2, 2_190.0, T0 + 19 * 2_000 + 60_000, 15, 10.0, 2_000);
        let mut pp = PostProcessor::new(vec![a, b]);
        pp.join_journeys(120_000, 1.2);
        assert_eq!(pp.journeys().len(), 2);
    }

    #[test]
    fn test_join_chains_backwards() {
        let a = line(1, 0.0, T0, 10, 10.0, 2_000);
        let b = line(2, 100.0, T0 + 20_000, 10, 10.0, 2_000);
        let c = line(3, 200.0, T0 + 40_000, 10, 10.0, 2_000);
        let mut pp = PostProcessor::new(vec![a, b, c]);
        pp.join_journeys(120_000, 1.2);
        let out = pp.into_journeys();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 30);
        assert_eq!(out[0].reason.0, 0o222);
    }

    #[test]
    fn test_join_stops_when_code_is_full() {
        // Twelve touching legs: ten reasons fill an i32, so one seam is left unjoined
        let legs: Vec<Journey> = (0..12)
            .map(|k| line(k, k as f64 * 100.0, T0 + k * 20_000, 10, 10.0, 2_000))
            .collect();
        let mut pp = PostProcessor::new(legs);
        pp.join_journeys(120_000, 1.2);
        let out = pp.into_journeys();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, 0);
        assert_eq!(out[0].len(), 20);
        assert_eq!(out[0].reason.0, 0o22);
        assert_eq!(out[1].id, 2);
        assert_eq!(out[1].len(), 100);
        assert_eq!(out[1].reason.0, 0o2222222222);
        assert_eq!(out[1].reason.reasons(), vec![TerminationReason::NoMotion; 10]);
        assert!(out[0].last().unwrap().timestamp < out[1].first().unwrap().timestamp);
    }

    #[test]
    fn test_threshold_boundary_kept() {
        let j = line(1, 0.0, T0, 2, 50.0, 10_000);
        let span = j.diagonal_span();
        let mut pp = PostProcessor::new(vec![j]);
        pp.threshold_distance(span);
        assert_eq!(pp.journeys().len(), 1);
        pp.threshold_distance(span + 1e-6);
        assert!(pp.journeys().is_empty());
    }

    #[test]
    fn test_trim_removes_jumps() {
        let mut j = Journey::new(1);
        // Startup jump of 500 m in 2 s, then walking, then a 300 m spike
        j.add_point(RoutePoint::new(-500.0 / M_PER_DEG, 0.0, T0));
        for i in 1..=10 {
            j.add_point(RoutePoint::new((i as f64 * 2.0) / M_PER_DEG, 0.0, T0 + i * 2_000));
        }
        j.add_point(RoutePoint::new(320.0 / M_PER_DEG, 0.0, T0 + 22_000));
        let mut pp = PostProcessor::new(vec![j]);
        pp.trim_ends(3, 20.0);
        let out = pp.into_journeys();
        assert_eq!(out[0].len(), 10);
        assert_eq!(out[0].first().unwrap().timestamp, T0 + 2_000);
        assert_eq!(out[0].last().unwrap().timestamp, T0 + 20_000);
    }

    #[test]
    fn test_trim_bounded_by_count() {
        let mut j = Journey::new(1);
        // Every segment is too fast
        for i in 0..10 {
            j.add_point(RoutePoint::new((i as f64 * 100.0) / M_PER_DEG, 0.0, T0 + i * 1_000));
        }
        let mut pp = PostProcessor::new(vec![j]);
        pp.trim_ends(3, 20.0);
        assert_eq!(pp.journeys()[0].len(), 4);
    }

    #[test]
    fn test_apply_drops_short_hops() {
        let hop = line(1, 0.0, T0, 5, 2.0, 2_000);
        let trip = line(2, 0.0, T0 + 3_600_000, 200, 10.0, 2_000);
        let mut pp = PostProcessor::new(vec![hop, trip]);
        pp.apply(&PostProcessSettings::default());
        let out = pp.into_journeys();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, 2);
    }
}
