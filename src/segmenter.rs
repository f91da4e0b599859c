//! Online trip segmentation.
//!
//! Detection runs on downsampled windows while every raw fix is kept in a
//! second ring, so journey boundaries are found on smoothed data but the
//! stored points are never smoothed.
//!
//! Age arithmetic: with downsample rate `R` and `p` points in the current
//! partial window, window `k` covers raw ages `k*R + p ..= (k+1)*R - 1 + p`.

use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};

use crate::config::GpsSettings;
use crate::downsampler::Downsampler;
use crate::error::{TrackerError, TrackerResult};
use crate::journey::{Journey, TerminationReason};
use crate::markov::MarkovChain;
use crate::route_point::RoutePoint;
use crate::window_buffer::WindowBuffer;

/// Destination for finished journeys
pub trait JourneySink {
    fn persist(&mut self, journey: Journey) -> TrackerResult<()>;
}

impl JourneySink for Vec<Journey> {
    fn persist(&mut self, journey: Journey) -> TrackerResult<()> {
        self.push(journey);
        Ok(())
    }
}

impl JourneySink for Sender<Journey> {
    fn persist(&mut self, journey: Journey) -> TrackerResult<()> {
        self.send(journey)
            .map_err(|e| TrackerError::Storage(format!("journey writer gone: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SegmenterState {
    Invalid,
    Idle,
    Searching,
    Found,
    Logging,
}

/// Which stop to report when several stationary runs are present
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopScan {
    /// Oldest confirmed stop
    Earliest,
    /// Newest stop not followed by renewed motion
    Latest,
}

pub struct TripSegmenter<S: JourneySink> {
    settings: GpsSettings,
    state: SegmenterState,
    downsampler: Downsampler,
    windows: WindowBuffer,
    points: WindowBuffer,
    start_search: Option<MarkovChain>,
    /// Raw age of the journey's first point, saturating at the ring's end
    start_age: Option<usize>,
    /// Raw age of the oldest point not yet copied into the journey
    pending_from: Option<usize>,
    /// Raw age of the newest point already written to a journey
    stored_age: Option<usize>,
    journey: Option<Journey>,
    last_id: i64,
    sink: S,
}

impl<S: JourneySink> TripSegmenter<S> {
    pub fn new(settings: GpsSettings, sink: S) -> Self {
        let raw_capacity = settings.window_size * settings.downsample_rate;
        TripSegmenter {
            state: SegmenterState::Invalid,
            downsampler: Downsampler::new(settings.downsample_rate),
            windows: WindowBuffer::new(settings.window_size),
            points: WindowBuffer::new(raw_capacity),
            start_search: None,
            start_age: None,
            pending_from: None,
            stored_age: None,
            journey: None,
            last_id: 0,
            settings,
            sink,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    /// A journey is being recorded
    pub fn is_active(&self) -> bool {
        self.state >= SegmenterState::Found
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn on_start(&mut self) -> TrackerResult<()> {
        if self.state != SegmenterState::Invalid {
            log::warn!("[SEG] start while {:?}", self.state);
            return Err(TrackerError::AlreadyRunning);
        }
        self.reset_buffers();
        self.state = SegmenterState::Idle;
        log::debug!("[SEG] started");
        Ok(())
    }

    /// Feed one raw fix
    pub fn on_location(&mut self, point: RoutePoint) -> TrackerResult<()> {
        if self.state == SegmenterState::Invalid {
            return Err(TrackerError::NotRunning);
        }
        self.store_pending(point);
        if let Some(window) = self.downsampler.add_point(point) {
            self.on_downsample(window);
        }
        Ok(())
    }

    /// Extended GPS outage: close any journey and wait for fresh windows
    pub fn on_signal_loss(&mut self) {
        log::debug!("[SEG] signal loss in {:?}", self.state);
        if self.is_active() {
            let reason = match self.recover_stop() {
                true => TerminationReason::SignalLossWithFallback,
                false => TerminationReason::SignalLoss,
            };
            self.persist_journey(reason);
        }
        self.reset_buffers();
        if self.state != SegmenterState::Invalid {
            self.state = SegmenterState::Idle;
        }
    }

    /// Tear down, persisting whatever journey is in progress
    pub fn on_stop(&mut self, by_user: bool) {
        log::debug!("[SEG] stop (user={}) in {:?}", by_user, self.state);
        if self.is_active() {
            self.recover_stop();
            let reason = if by_user {
                TerminationReason::UserStop
            } else {
                TerminationReason::OsStop
            };
            self.persist_journey(reason);
        }
        self.reset_buffers();
        self.start_search = None;
        self.state = SegmenterState::Invalid;
    }

    fn reset_buffers(&mut self) {
        self.windows.clear();
        self.points.clear();
        self.downsampler.flush();
        self.clear_start();
        self.stored_age = None;
        self.journey = None;
    }

    fn on_downsample(&mut self, window: RoutePoint) {
        self.windows.add(window);
        let next = match self.state {
            SegmenterState::Invalid => SegmenterState::Invalid,
            SegmenterState::Idle => {
                if self.windows.filled_at_least(2) {
                    log::debug!("[SEG] two windows, searching");
                    self.start_search = Some(MarkovChain::new(
                        self.settings.start_velocity,
                        self.settings.start_cumulative_velocity,
                        self.settings.start_run_length,
                        self.windows.get(1),
                    ));
                    self.clear_start();
                    self.search_step()
                } else {
                    SegmenterState::Idle
                }
            }
            SegmenterState::Searching => self.search_step(),
            SegmenterState::Found => match self.start_window() {
                Some(w) if w + 1 >= self.settings.term_windows => {
                    log::debug!("[SEG] history accumulated, logging");
                    SegmenterState::Logging
                }
                _ => SegmenterState::Found,
            },
            SegmenterState::Logging => self.logging_step(),
        };
        self.state = next;
    }

    fn search_step(&mut self) -> SegmenterState {
        let (dist, dt, newest) = window_step(&self.windows, 1);
        let triggered = match self.start_search.as_mut() {
            Some(chain) => chain.check_min_trigger(dist, dt, newest),
            None => false,
        };
        if !triggered {
            return SegmenterState::Searching;
        }
        let start = self.settings.start_run_length;
        log::info!("[SEG] journey start at window {}", start);
        self.flush_start(start);
        let id = self.next_id(start);
        self.journey = Some(Journey::new(id));
        SegmenterState::Found
    }

    fn logging_step(&mut self) -> SegmenterState {
        let term = self.settings.term_windows - 1;
        let moved = self.windows.get(term).distance_to(&self.windows.get(0));
        if moved >= self.settings.term_distance {
            return SegmenterState::Logging;
        }

        let mut restart = None;
        let next = match self.find_stop(term, StopScan::Earliest) {
            Some(stop) => {
                log::info!("[SEG] stop at window {}", stop);
                self.store_through(self.window_newest_age(stop));
                match self.find_start(stop - 1) {
                    Some(start) => {
                        log::info!("[SEG] next journey starts at window {}", start);
                        self.flush_start(start);
                        restart = Some(start);
                        SegmenterState::Found
                    }
                    None => {
                        // Keep the start chain: it may hold a partial run
                        self.clear_start();
                        SegmenterState::Searching
                    }
                }
            }
            None => {
                log::info!("[SEG] displacement low but no stop trigger, closing journey");
                self.store_through(0);
                self.clear_start();
                let newest = self.windows.get(0);
                if let Some(chain) = self.start_search.as_mut() {
                    chain.refresh(newest);
                }
                SegmenterState::Searching
            }
        };

        self.persist_journey(TerminationReason::NoMotion);
        if let Some(start) = restart {
            let id = self.next_id(start);
            self.journey = Some(Journey::new(id));
        }
        next
    }

    /// Store up to the best stop found in the journey's history.
    /// Returns whether a stop point was found.
    fn recover_stop(&mut self) -> bool {
        let stop = self
            .start_window()
            .and_then(|from| self.find_stop(from, StopScan::Latest));
        match stop {
            Some(w) => {
                log::info!("[SEG] recovered stop at window {}", w);
                self.store_through(self.window_newest_age(w));
                true
            }
            None => {
                self.store_through(0);
                false
            }
        }
    }

    fn persist_journey(&mut self, reason: TerminationReason) {
        let Some(mut journey) = self.journey.take() else {
            return;
        };
        if journey.is_empty() {
            log::warn!("[SEG] dropping empty journey {}", journey.id);
            return;
        }
        journey.finish(reason);
        log::info!(
            "[SEG] journey {} closed: {} points, {:?}",
            journey.id,
            journey.len(),
            reason
        );
        if let Err(e) = self.sink.persist(journey) {
            log::error!("[SEG] failed to persist journey: {}", e);
        }
    }

    // ---------------------------------------------------------------
    // Raw point bookkeeping
    // ---------------------------------------------------------------

    fn raw_capacity(&self) -> usize {
        self.points.capacity()
    }

    /// Push a raw fix, first saving the pending point it would overwrite
    fn store_pending(&mut self, point: RoutePoint) {
        let last = self.raw_capacity() - 1;
        if self.pending_from == Some(last) && self.points.filled_at_least(last + 1) {
            let oldest = self.points.get(last);
            if let Some(j) = self.journey.as_mut() {
                j.add_point(oldest);
            }
            self.pending_from = last.checked_sub(1);
        }

        self.points.add(point);
        self.stored_age = self.stored_age.and_then(|a| (a < last).then_some(a + 1));

        if let Some(start) = self.start_age {
            self.start_age = Some((start + 1).min(last));
            self.pending_from = Some(self.pending_from.map_or(0, |a| (a + 1).min(last)));
        }
    }

    /// Journey starts at the oldest raw point of `window`, never at a point
    /// an earlier journey already holds
    fn flush_start(&mut self, window: usize) {
        let mut age =
            (window + 1) * self.downsampler.rate() - 1 + self.downsampler.processed_count();
        assert!(
            self.points.filled_at_least(age + 1),
            "start age {} beyond raw buffer ({})",
            age,
            self.points.len()
        );
        match self.stored_age {
            Some(0) => {
                // Nothing unstored yet: the next fix is the first point
                self.start_age = Some(0);
                self.pending_from = None;
                return;
            }
            Some(stored) => age = age.min(stored - 1),
            None => {}
        }
        self.start_age = Some(age);
        self.pending_from = Some(age);
    }

    fn clear_start(&mut self) {
        self.start_age = None;
        self.pending_from = None;
    }

    /// Copy pending raw points, oldest first, down to `end_age` inclusive
    fn store_through(&mut self, end_age: usize) {
        let Some(pending) = self.pending_from else {
            return;
        };
        if pending < end_age {
            return;
        }
        if let Some(j) = self.journey.as_mut() {
            for age in (end_age..=pending).rev() {
                j.add_point(self.points.get(age));
            }
            self.stored_age = Some(end_age);
        }
        self.pending_from = end_age.checked_sub(1);
    }

    fn window_newest_age(&self, window: usize) -> usize {
        window * self.downsampler.rate() + self.downsampler.processed_count()
    }

    /// Oldest window lying entirely inside the journey
    fn start_window(&self) -> Option<usize> {
        let rate = self.downsampler.rate();
        let p = self.downsampler.processed_count();
        let span = self.start_age? + 1;
        if span < p + rate {
            return None;
        }
        Some((span - p) / rate - 1)
    }

    // ---------------------------------------------------------------
    // Backward scans over the window history
    // ---------------------------------------------------------------

    /// Window where a stationary run begins, scanning from `from` towards the present
    fn find_stop(&self, from: usize, scan: StopScan) -> Option<usize> {
        let mut chain = MarkovChain::new(
            self.settings.stop_velocity,
            self.settings.stop_cumulative_velocity,
            self.settings.stop_run_length,
            self.windows.get(from),
        );
        let mut origin = from;
        let mut found = None;
        for i in (1..=from).rev() {
            let before = chain.consecutive();
            let (dist, dt, newer) = window_step(&self.windows, i);
            let triggered = chain.check_max_trigger(dist, dt, newer);
            if chain.consecutive() > 0 && before == 0 {
                origin = i;
            }
            match scan {
                StopScan::Earliest if triggered => return Some(origin),
                StopScan::Latest if triggered && found.is_none() => found = Some(origin),
                StopScan::Latest if chain.consecutive() == 0 => found = None,
                _ => {}
            }
        }
        found
    }

    /// Window where a new moving run begins, scanning from `from` with the member chain
    fn find_start(&mut self, from: usize) -> Option<usize> {
        let seed = self.windows.get(from);
        let settings = &self.settings;
        let chain = self.start_search.get_or_insert_with(|| {
            MarkovChain::new(
                settings.start_velocity,
                settings.start_cumulative_velocity,
                settings.start_run_length,
                seed,
            )
        });
        chain.refresh(seed);

        let mut origin = from;
        for i in (1..=from).rev() {
            let before = chain.consecutive();
            let (dist, dt, newer) = window_step(&self.windows, i);
            let triggered = chain.check_min_trigger(dist, dt, newer);
            if chain.consecutive() > 0 && before == 0 {
                origin = i;
            }
            if triggered {
                return Some(origin);
            }
        }
        None
    }

    /// Journey id from the start window's timestamp, strictly increasing
    fn next_id(&mut self, window: usize) -> i64 {
        let id = self.windows.get(window).timestamp.max(self.last_id + 1);
        self.last_id = id;
        id
    }
}

/// Distance, interval and newer point between windows `older` and `older - 1`
fn window_step(windows: &WindowBuffer, older: usize) -> (f64, i64, RoutePoint) {
    let a = windows.get(older);
    let b = windows.get(older - 1);
    (a.distance_to(&b), a.millis_until(&b), b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE_T: i64 = 1_600_000_000_000;
    const STEP_MS: i64 = 2_000;
    // 10 m of latitude
    const TEN_M_DEG: f64 = 10.0 / 111_195.0;

    fn test_settings() -> GpsSettings {
        GpsSettings {
            window_size: 30,
            downsample_rate: 1,
            start_run_length: 3,
            stop_run_length: 3,
            term_windows: 8,
            term_distance: 30.0,
            ..GpsSettings::default()
        }
    }

    fn at(k: i64, metres_north: f64) -> RoutePoint {
        RoutePoint::new(35.9 + metres_north / 10.0 * TEN_M_DEG, 14.5, BASE_T + k * STEP_MS)
    }

    /// 20 stationary, 10 moving at 5 m/s, then stationary
    fn trip_trace(tail: i64) -> Vec<RoutePoint> {
        (0..30 + tail)
            .map(|k| {
                let metres = match k {
                    0..=19 => 0.0,
                    20..=29 => (k - 19) as f64 * 10.0,
                    _ => 100.0,
                };
                at(k, metres)
            })
            .collect()
    }

    fn run(settings: GpsSettings, trace: &[RoutePoint]) -> TripSegmenter<Vec<Journey>> {
        let mut seg = TripSegmenter::new(settings, Vec::new());
        seg.on_start().unwrap();
        for p in trace {
            seg.on_location(*p).unwrap();
        }
        seg
    }

    #[test]
    fn test_single_trip_between_rests() {
        let trace = trip_trace(20);
        let seg = run(test_settings(), &trace);
        assert_eq!(seg.state(), SegmenterState::Searching);

        let journeys = seg.into_sink();
        assert_eq!(journeys.len(), 1);
        let j = &journeys[0];
        assert_eq!(j.reason.reasons(), vec![TerminationReason::NoMotion]);
        // Last resting fix before motion through the arrival fix
        assert_eq!(j.points(), &trace[19..=29]);
        assert_eq!(j.id, trace[19].timestamp);
    }

    #[test]
    fn test_no_journey_when_stationary() {
        let trace: Vec<RoutePoint> = (0..60).map(|k| at(k, 0.0)).collect();
        let mut seg = run(test_settings(), &trace);
        seg.on_stop(true);
        assert!(seg.into_sink().is_empty());
    }

    #[test]
    fn test_state_progression() {
        let trace = trip_trace(0);
        let mut seg = TripSegmenter::new(test_settings(), Vec::new());
        assert_eq!(seg.state(), SegmenterState::Invalid);
        assert_eq!(seg.on_location(trace[0]), Err(TrackerError::NotRunning));
        seg.on_start().unwrap();
        assert_eq!(seg.on_start(), Err(TrackerError::AlreadyRunning));

        for p in &trace[..=21] {
            seg.on_location(*p).unwrap();
        }
        assert_eq!(seg.state(), SegmenterState::Searching);
        seg.on_location(trace[22]).unwrap();
        assert_eq!(seg.state(), SegmenterState::Found);
        assert!(seg.is_active());
        for p in &trace[23..=26] {
            seg.on_location(*p).unwrap();
        }
        assert_eq!(seg.state(), SegmenterState::Logging);
    }

    #[test]
    fn test_user_stop_mid_journey() {
        // Still moving when the user stops tracking
        let trace: Vec<RoutePoint> = (0..28)
            .map(|k| at(k, if k < 20 { 0.0 } else { (k - 19) as f64 * 10.0 }))
            .collect();
        let mut seg = run(test_settings(), &trace);
        seg.on_stop(true);
        assert_eq!(seg.state(), SegmenterState::Invalid);

        let journeys = seg.into_sink();
        assert_eq!(journeys.len(), 1);
        assert_eq!(journeys[0].reason.reasons(), vec![TerminationReason::UserStop]);
        assert_eq!(journeys[0].points(), &trace[19..]);
    }

    #[test]
    fn test_signal_loss_recovers_stop_point() {
        // Arrives and rests briefly, then the signal drops before termination
        let trace = trip_trace(4);
        let mut seg = run(test_settings(), &trace);
        assert!(seg.is_active());
        seg.on_signal_loss();
        assert_eq!(seg.state(), SegmenterState::Idle);

        let journeys = seg.into_sink();
        assert_eq!(journeys.len(), 1);
        assert_eq!(
            journeys[0].reason.reasons(),
            vec![TerminationReason::SignalLossWithFallback]
        );
        assert_eq!(journeys[0].points(), &trace[19..=29]);
    }

    #[test]
    fn test_signal_loss_while_moving_keeps_everything() {
        let trace: Vec<RoutePoint> = (0..27)
            .map(|k| at(k, if k < 20 { 0.0 } else { (k - 19) as f64 * 10.0 }))
            .collect();
        let mut seg = run(test_settings(), &trace);
        seg.on_signal_loss();
        let journeys = seg.into_sink();
        assert_eq!(journeys[0].reason.reasons(), vec![TerminationReason::SignalLoss]);
        assert_eq!(journeys[0].points(), &trace[19..]);
    }

    /// Raw indices of each journey's points, asserting each run is contiguous
    fn index_ranges(trace: &[RoutePoint], journeys: &[Journey]) -> Vec<(usize, usize)> {
        journeys
            .iter()
            .map(|j| {
                let first = trace
                    .iter()
                    .position(|p| *p == j.points()[0])
                    .expect("journey point not in trace");
                let last = first + j.len() - 1;
                assert_eq!(j.points(), &trace[first..=last], "journey {} not contiguous", j.id);
                (first, last)
            })
            .collect()
    }

    fn assert_disjoint(ranges: &[(usize, usize)]) {
        for pair in ranges.windows(2) {
            assert!(pair[0].1 < pair[1].0, "overlapping journeys {:?}", pair);
        }
    }

    #[test]
    fn test_stop_then_immediate_restart() {
        // Arrive, rest three fixes, then leave at 3 m/s before the search resumes
        let trace: Vec<RoutePoint> = (0..73)
            .map(|k| {
                let metres = match k {
                    0..=19 => 0.0,
                    20..=29 => (k - 19) as f64 * 10.0,
                    30..=32 => 100.0,
                    33..=52 => 100.0 + (k - 32) as f64 * 6.0,
                    _ => 220.0,
                };
                at(k, metres)
            })
            .collect();
        let seg = run(test_settings(), &trace);
        assert_eq!(seg.state(), SegmenterState::Searching);

        let journeys = seg.into_sink();
        assert_eq!(journeys.len(), 2);
        for j in &journeys {
            assert_eq!(j.reason.reasons(), vec![TerminationReason::NoMotion]);
        }
        let ranges = index_ranges(&trace, &journeys);
        assert_eq!(ranges, vec![(19, 29), (32, 52)]);
        assert_disjoint(&ranges);
        assert_eq!(journeys[0].id, trace[19].timestamp);
        assert_eq!(journeys[1].id, trace[32].timestamp);
    }

    #[test]
    fn test_closing_without_stop_shares_no_fixes() {
        // Parked with 8 m of GPS jitter: displacement stays low but no stop run confirms
        let trace: Vec<RoutePoint> = (0..85)
            .map(|k| {
                let metres = match k {
                    0..=19 => 0.0,
                    20..=29 => (k - 19) as f64 * 10.0,
                    30..=49 if k % 2 == 0 => 100.0,
                    30..=49 => 108.0,
                    50..=64 => 100.0 + (k - 49) as f64 * 10.0,
                    _ => 250.0,
                };
                at(k, metres)
            })
            .collect();
        let seg = run(test_settings(), &trace);
        assert_eq!(seg.state(), SegmenterState::Searching);

        let journeys = seg.into_sink();
        let ranges = index_ranges(&trace, &journeys);
        assert_eq!(ranges, vec![(19, 34), (35, 43), (44, 52), (53, 64)]);
        assert_disjoint(&ranges);

        let ids: Vec<i64> = journeys.iter().map(|j| j.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {:?}", ids);
    }

    #[test]
    fn test_ids_follow_window_time() {
        let mut seg = TripSegmenter::new(test_settings(), Vec::new());
        seg.on_start().unwrap();
        for k in 0..3 {
            seg.on_location(at(k, 0.0)).unwrap();
        }
        assert_eq!(seg.next_id(1), trace_time(1));
        // Same window again still yields a fresh id
        assert_eq!(seg.next_id(1), trace_time(1) + 1);
        assert_eq!(seg.next_id(2), trace_time(1) + 2);
        assert_eq!(seg.next_id(0), trace_time(2));
    }

    fn trace_time(k: i64) -> i64 {
        BASE_T + k * STEP_MS
    }

    #[test]
    fn test_long_journey_survives_raw_wraparound() {
        // Raw ring of 10 x 2 points, journey far longer than the ring
        let settings = GpsSettings {
            window_size: 10,
            downsample_rate: 2,
            term_windows: 6,
            ..test_settings()
        };
        let moving = 60;
        let trace: Vec<RoutePoint> = (0..20 + moving + 30)
            .map(|k| {
                let metres = match k {
                    0..=19 => 0.0,
                    k if k < 20 + moving => (k - 19) as f64 * 10.0,
                    _ => moving as f64 * 10.0,
                };
                at(k, metres)
            })
            .collect();
        let seg = run(settings, &trace);
        let journeys = seg.into_sink();
        assert_eq!(journeys.len(), 1);
        let pts = journeys[0].points();
        // Contiguous, ordered and loss-less
        for pair in pts.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, STEP_MS);
        }
        let first = pts[0].timestamp;
        let last = pts[pts.len() - 1].timestamp;
        assert!(first <= trace[20].timestamp);
        assert!(last >= trace[20 + moving as usize - 1].timestamp);
    }
}
