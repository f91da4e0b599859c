use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::error::TrackerResult;
use crate::route_point::RoutePoint;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceFix {
    /// Seconds since the epoch
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub satellites: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceAccel {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One sample of a recorded sensor log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceReading {
    /// Seconds since the epoch
    pub timestamp: f64,
    #[serde(default)]
    pub accel: Option<TraceAccel>,
    #[serde(default)]
    pub gps: Option<TraceFix>,
}

impl TraceReading {
    pub fn millis(&self) -> i64 {
        seconds_to_millis(self.timestamp)
    }

    pub fn location(&self) -> Option<RoutePoint> {
        self.gps
            .map(|g| RoutePoint::new(g.latitude, g.longitude, seconds_to_millis(g.timestamp)))
    }

    pub fn acceleration(&self) -> Option<[f64; 3]> {
        self.accel.map(|a| [a.x, a.y, a.z])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceLog {
    pub readings: Vec<TraceReading>,
}

impl TraceLog {
    /// Read a `.json` or gzipped `.json.gz` log
    pub fn load(path: &Path) -> TrackerResult<Self> {
        let file = File::open(path)?;
        if path.extension().map(|e| e == "gz").unwrap_or(false) {
            Self::from_reader(GzDecoder::new(file))
        } else {
            Self::from_reader(file)
        }
    }

    pub fn from_reader<R: Read>(reader: R) -> TrackerResult<Self> {
        let mut log: TraceLog = serde_json::from_reader(BufReader::new(reader))?;
        log.readings
            .sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Ok(log)
    }
}

pub fn seconds_to_millis(seconds: f64) -> i64 {
    (seconds * 1000.0).round() as i64
}
