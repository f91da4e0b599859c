use std::ops::{Add, AddAssign, Mul};

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

/// A single timestamped fix
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl RoutePoint {
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        RoutePoint {
            latitude,
            longitude,
            timestamp,
        }
    }

    pub fn to_point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Great-circle distance in metres
    pub fn distance_to(&self, other: &RoutePoint) -> f64 {
        self.to_point().haversine_distance(&other.to_point())
    }

    /// Milliseconds from `self` to `later`
    pub fn millis_until(&self, later: &RoutePoint) -> i64 {
        later.timestamp - self.timestamp
    }

    /// Average speed from `self` to `later` in m/s, `None` when undefined
    pub fn velocity_to(&self, later: &RoutePoint) -> Option<f64> {
        velocity(self.distance_to(later), self.millis_until(later))
    }
}

/// Speed in m/s for `distance` metres covered in `dt_ms`.
///
/// Zero or negative intervals and non-finite results yield `None`, which every
/// threshold comparison treats as a failed check.
pub fn velocity(distance: f64, dt_ms: i64) -> Option<f64> {
    if dt_ms <= 0 {
        return None;
    }
    let v = distance / (dt_ms as f64 / 1000.0);
    v.is_finite().then_some(v)
}

impl Add for RoutePoint {
    type Output = RoutePoint;

    fn add(self, rhs: RoutePoint) -> RoutePoint {
        RoutePoint {
            latitude: self.latitude + rhs.latitude,
            longitude: self.longitude + rhs.longitude,
            timestamp: self.timestamp + rhs.timestamp,
        }
    }
}

impl AddAssign for RoutePoint {
    fn add_assign(&mut self, rhs: RoutePoint) {
        *self = *self + rhs;
    }
}

impl Mul<f64> for RoutePoint {
    type Output = RoutePoint;

    fn mul(self, scale: f64) -> RoutePoint {
        RoutePoint {
            latitude: self.latitude * scale,
            longitude: self.longitude * scale,
            timestamp: (self.timestamp as f64 * scale).round() as i64,
        }
    }
}
