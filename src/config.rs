use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};

/// GPS segmentation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsSettings {
    /// Requested interval between location fixes (ms)
    pub sample_interval_ms: u64,
    /// Number of downsampled windows kept in history
    pub window_size: usize,
    /// Raw fixes averaged into one window
    pub downsample_rate: usize,
    /// Per-window velocity that counts as moving (m/s)
    pub start_velocity: f64,
    /// Velocity across the whole start run (m/s)
    pub start_cumulative_velocity: f64,
    /// Consecutive moving windows needed to start a journey
    pub start_run_length: usize,
    /// Windows of history checked for termination
    pub term_windows: usize,
    /// Displacement over `term_windows` below which a stop is searched (m)
    pub term_distance: f64,
    /// Per-window velocity that counts as stationary (m/s)
    pub stop_velocity: f64,
    /// Velocity across the whole stop run (m/s)
    pub stop_cumulative_velocity: f64,
    /// Consecutive stationary windows needed to stop a journey
    pub stop_run_length: usize,
    /// Satellites in fix required to keep the GPS watchdog alive
    pub min_satellites: u32,
}

impl Default for GpsSettings {
    fn default() -> Self {
        GpsSettings {
            sample_interval_ms: 2000,
            window_size: 30,
            downsample_rate: 3,
            start_velocity: 1.0,
            start_cumulative_velocity: 1.0,
            start_run_length: 3,
            term_windows: 25,
            term_distance: 30.0,
            stop_velocity: 1.0,
            stop_cumulative_velocity: 1.0,
            stop_run_length: 3,
            min_satellites: 5,
        }
    }
}

/// Accelerometer gate parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelSettings {
    /// Period between accelerometer motion checks while GPS is off (ms)
    pub check_interval_ms: i64,
    /// Samples arriving faster than this are ignored (ms)
    pub min_sample_interval_ms: i64,
    pub quick_sample_size: usize,
    pub extra_sample_size: usize,
    /// Mean squared deviation from gravity, (m/s²)²
    pub quick_threshold: f64,
    /// Mean squared deviation from gravity, (m/s²)²
    pub extra_threshold: f64,
    pub gravity: f64,
}

impl Default for AccelSettings {
    fn default() -> Self {
        AccelSettings {
            check_interval_ms: 500,
            min_sample_interval_ms: 190,
            quick_sample_size: 7,
            extra_sample_size: 8,
            quick_threshold: 0.185 / 7.0,
            extra_threshold: 4.212 / 8.0,
            gravity: 9.81,
        }
    }
}

/// Watchdog durations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// No usable satellite fix for this long counts as signal loss (ms)
    pub no_satellite_ms: i64,
    /// No active journey for this long switches to the accelerometer (ms)
    pub journey_idle_ms: i64,
    /// Watchdog handles are allocated above this value
    pub watchdog_offset: u32,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        TimeoutSettings {
            no_satellite_ms: 40_000,
            journey_idle_ms: 300_000,
            watchdog_offset: 10,
        }
    }
}

/// Post-processing parameters, applied in the order they are listed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessSettings {
    pub near_distance: f64,
    pub join_gap_ms: i64,
    pub join_velocity_factor: f64,
    pub far_distance: f64,
    pub trim_max_points: usize,
    /// Boundary velocity treated as a GPS jump (m/s)
    pub trim_velocity: f64,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        PostProcessSettings {
            near_distance: 50.0,
            join_gap_ms: 120_000,
            join_velocity_factor: 1.2,
            far_distance: 500.0,
            trim_max_points: 3,
            trim_velocity: 20.0,
        }
    }
}

/// Complete tracker configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gps: GpsSettings,
    pub accel: AccelSettings,
    pub timeouts: TimeoutSettings,
    pub postprocess: PostProcessSettings,
}

impl Settings {
    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> TrackerResult<Self> {
        let raw = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        let gps = &self.gps;
        if gps.window_size < 2 || gps.downsample_rate == 0 {
            return Err(invalid("window_size must be >= 2 and downsample_rate >= 1"));
        }
        if gps.start_run_length == 0 || gps.stop_run_length == 0 {
            return Err(invalid("run lengths must be positive"));
        }
        if gps.start_run_length >= gps.window_size || gps.stop_run_length >= gps.window_size {
            return Err(invalid("run lengths must be shorter than window_size"));
        }
        if gps.term_windows < 2 || gps.term_windows > gps.window_size {
            return Err(invalid("term_windows must lie in [2, window_size]"));
        }
        let thresholds = [
            gps.start_velocity,
            gps.start_cumulative_velocity,
            gps.term_distance,
            gps.stop_velocity,
            gps.stop_cumulative_velocity,
            self.accel.quick_threshold,
            self.accel.extra_threshold,
            self.postprocess.near_distance,
            self.postprocess.far_distance,
            self.postprocess.join_velocity_factor,
            self.postprocess.trim_velocity,
        ];
        if thresholds.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(invalid("thresholds must be finite and non-negative"));
        }
        if self.accel.quick_sample_size == 0 || self.accel.extra_sample_size == 0 {
            return Err(invalid("accelerometer sample sizes must be positive"));
        }
        let t = &self.timeouts;
        if t.no_satellite_ms <= 0 || t.journey_idle_ms <= 0 || self.accel.check_interval_ms <= 0 {
            return Err(invalid("timeouts must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> TrackerError {
    TrackerError::InvalidParameters(msg.to_string())
}
