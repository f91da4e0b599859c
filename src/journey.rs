use std::fmt;
use std::io::{self, Read, Write};

use chrono::{TimeZone, Utc};
use geo::{BoundingRect, MultiPoint, Rect};
use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};
use crate::route_point::RoutePoint;

/// Why a journey stopped being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    Unspecified = 0,
    /// Joined with the following journey
    Continues = 1,
    /// No significant motion
    NoMotion = 2,
    /// Extended loss of GPS signal
    SignalLoss = 3,
    /// Signal lost, but a stop point was recovered from history
    SignalLossWithFallback = 4,
    UserStop = 5,
    /// Stopped by the platform or an error
    OsStop = 6,
}

impl TerminationReason {
    pub fn from_digit(digit: i32) -> Option<Self> {
        match digit {
            0 => Some(TerminationReason::Unspecified),
            1 => Some(TerminationReason::Continues),
            2 => Some(TerminationReason::NoMotion),
            3 => Some(TerminationReason::SignalLoss),
            4 => Some(TerminationReason::SignalLossWithFallback),
            5 => Some(TerminationReason::UserStop),
            6 => Some(TerminationReason::OsStop),
            _ => None,
        }
    }
}

/// Termination code as stored on disk.
///
/// Joined journeys keep every original reason as one octal digit each, the
/// earliest journey in the most significant digit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationCode(pub i32);

impl TerminationCode {
    /// Pack `later` after `self`; `None` when the digits no longer fit an `i32`
    pub fn combine(self, later: TerminationCode) -> Option<TerminationCode> {
        let mut packed = self.0;
        let mut rest = later.0;
        while rest > 0 {
            rest /= 8;
            packed = packed.checked_mul(8)?;
        }
        packed.checked_add(later.0).map(TerminationCode)
    }

    /// Reasons in chronological order; empty for an unspecified code
    pub fn reasons(&self) -> Vec<TerminationReason> {
        let mut digits = Vec::new();
        let mut rest = self.0;
        while rest > 0 {
            if let Some(reason) = TerminationReason::from_digit(rest % 8) {
                digits.push(reason);
            }
            rest /= 8;
        }
        digits.reverse();
        digits
    }
}

impl From<TerminationReason> for TerminationCode {
    fn from(reason: TerminationReason) -> Self {
        TerminationCode(reason as i32)
    }
}

/// Transport modes used during a journey (bitmask)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportModes(pub i32);

impl TransportModes {
    pub const CAR_DRIVER: i32 = 1;
    pub const CAR_PASSENGER: i32 = 2;
    pub const BUS: i32 = 4;
    pub const COACH: i32 = 8;
    pub const MOTORBIKE: i32 = 16;
    pub const ON_FOOT: i32 = 32;
    pub const BICYCLE: i32 = 64;
    pub const FERRY: i32 = 128;
    pub const TAXI: i32 = 256;
    pub const OTHER: i32 = 512;

    const LABELS: [(i32, &'static str); 10] = [
        (Self::CAR_DRIVER, "Car Driver"),
        (Self::CAR_PASSENGER, "Car Passenger"),
        (Self::BUS, "Bus (Public Transport)"),
        (Self::COACH, "Coach/Minibus"),
        (Self::MOTORBIKE, "Motorbike"),
        (Self::ON_FOOT, "On Foot"),
        (Self::BICYCLE, "Bicycle"),
        (Self::FERRY, "Ferry"),
        (Self::TAXI, "Taxi"),
        (Self::OTHER, "Other"),
    ];

    pub fn contains(&self, mode: i32) -> bool {
        self.0 & mode != 0
    }

    pub fn labels(&self) -> Vec<&'static str> {
        Self::LABELS
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, label)| *label)
            .collect()
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0 && self.0 < 1024
    }
}

impl fmt::Display for TransportModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.labels().as_slice() {
            [] => write!(f, "Mode (Undisclosed)"),
            [one] => write!(f, "{}", one),
            [first, ..] => write!(f, "{},...", first),
        }
    }
}

/// Declared trip purpose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    #[default]
    Undisclosed,
    GoingHome,
    VisitingSomeone,
    GoingToWork,
    WorkRelated,
    Medical,
    PersonalErrand,
    Shopping,
    Education,
    Accompanying,
    Sports,
    Other,
}

impl Purpose {
    const ALL: [Purpose; 12] = [
        Purpose::Undisclosed,
        Purpose::GoingHome,
        Purpose::VisitingSomeone,
        Purpose::GoingToWork,
        Purpose::WorkRelated,
        Purpose::Medical,
        Purpose::PersonalErrand,
        Purpose::Shopping,
        Purpose::Education,
        Purpose::Accompanying,
        Purpose::Sports,
        Purpose::Other,
    ];

    /// Wire code: 0 for undisclosed, otherwise a single bit
    pub fn code(&self) -> i32 {
        match *self as i32 {
            0 => 0,
            index => 1 << (index - 1),
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.code() == code)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Purpose::Undisclosed => "Undisclosed",
            Purpose::GoingHome => "Going Home",
            Purpose::VisitingSomeone => "Visiting Someone",
            Purpose::GoingToWork => "Going to Work",
            Purpose::WorkRelated => "Work-Related",
            Purpose::Medical => "Medical",
            Purpose::PersonalErrand => "Personal Errand",
            Purpose::Shopping => "Shopping",
            Purpose::Education => "Education",
            Purpose::Accompanying => "Accompanying",
            Purpose::Sports => "Sports",
            Purpose::Other => "Other",
        }
    }
}

/// A recorded trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub id: i64,
    points: Vec<RoutePoint>,
    pub reason: TerminationCode,
    pub mode: TransportModes,
    pub purpose: Purpose,
}

const HEADER_BYTES: usize = 8 + 4 * 4;
const POINT_BYTES: usize = 8 * 3;

impl Journey {
    pub fn new(id: i64) -> Self {
        Journey {
            id,
            points: Vec::with_capacity(256),
            reason: TerminationCode::default(),
            mode: TransportModes::default(),
            purpose: Purpose::default(),
        }
    }

    /// Append a point; points without a valid timestamp are refused
    pub fn add_point(&mut self, point: RoutePoint) -> bool {
        if point.timestamp <= 0 {
            log::warn!("[JOUR] {} rejected point with timestamp {}", self.id, point.timestamp);
            return false;
        }
        self.points.push(point);
        true
    }

    /// Concatenate `later` onto this journey, packing both termination codes.
    /// Hands `later` back untouched when the packed code would overflow.
    pub fn append(&mut self, later: Journey) -> Result<(), Journey> {
        let Some(reason) = self.reason.combine(later.reason) else {
            return Err(later);
        };
        self.reason = reason;
        self.points.extend(later.points);
        Ok(())
    }

    /// Set the termination reason, keeping the current one for `Unspecified`
    pub fn finish(&mut self, reason: TerminationReason) {
        if reason != TerminationReason::Unspecified {
            self.reason = reason.into();
        }
    }

    pub fn points(&self) -> &[RoutePoint] {
        &self.points
    }

    pub fn first(&self) -> Option<&RoutePoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&RoutePoint> {
        self.points.last()
    }

    pub fn remove_point(&mut self, index: usize) -> RoutePoint {
        self.points.remove(index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Lat/lon bounding box (x = longitude, y = latitude)
    pub fn bounds(&self) -> Option<Rect<f64>> {
        let multi: MultiPoint<f64> = self.points.iter().map(RoutePoint::to_point).collect();
        multi.bounding_rect()
    }

    /// Great-circle length of the bounding-box diagonal, in metres
    pub fn diagonal_span(&self) -> f64 {
        match self.bounds() {
            Some(rect) => {
                let sw = RoutePoint::new(rect.min().y, rect.min().x, 0);
                let ne = RoutePoint::new(rect.max().y, rect.max().x, 0);
                sw.distance_to(&ne)
            }
            None => 0.0,
        }
    }

    pub fn title(&self) -> String {
        match self.first() {
            Some(p) => format_millis(p.timestamp, "%a %-d/%b/%Y"),
            None => "Invalid Journey".to_string(),
        }
    }

    pub fn times(&self) -> String {
        match (self.first(), self.last()) {
            (Some(a), Some(b)) => format!(
                "[{}] - [{}]",
                format_millis(a.timestamp, "%H:%M:%S"),
                format_millis(b.timestamp, "%H:%M:%S")
            ),
            _ => "Invalid Journey".to_string(),
        }
    }

    /// Upload header: `mode purpose reason count`
    pub fn header_line(&self) -> String {
        format!(
            "{} {} {} {}",
            self.mode.0,
            self.purpose.code(),
            self.reason.0,
            self.points.len()
        )
    }

    /// Upload batch for points `[start, start + len)`: `t lat lon ` per point
    pub fn points_line(&self, start: usize, len: usize) -> String {
        let end = (start + len).min(self.points.len());
        self.points[start.min(end)..end]
            .iter()
            .map(|p| format!("{} {} {} ", p.timestamp, p.latitude, p.longitude))
            .collect()
    }

    /// Serialize as one big-endian binary record
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(HEADER_BYTES + self.points.len() * POINT_BYTES);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&(self.points.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.reason.0.to_be_bytes());
        buf.extend_from_slice(&self.mode.0.to_be_bytes());
        buf.extend_from_slice(&self.purpose.code().to_be_bytes());
        for p in &self.points {
            buf.extend_from_slice(&p.latitude.to_be_bytes());
            buf.extend_from_slice(&p.longitude.to_be_bytes());
            buf.extend_from_slice(&p.timestamp.to_be_bytes());
        }
        out.write_all(&buf)
    }

    /// Read the next record; `Ok(None)` at a clean end of stream
    pub fn read_from<R: Read>(input: &mut R) -> TrackerResult<Option<Journey>> {
        let mut header = [0u8; HEADER_BYTES];
        let got = read_fully(input, &mut header)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_BYTES {
            return Err(TrackerError::MalformedRecord(format!(
                "truncated header ({} of {} bytes)",
                got, HEADER_BYTES
            )));
        }

        let id = i64::from_be_bytes(slice8(&header[0..8]));
        let count = i32::from_be_bytes(slice4(&header[8..12]));
        let reason = i32::from_be_bytes(slice4(&header[12..16]));
        let mode = TransportModes(i32::from_be_bytes(slice4(&header[16..20])));
        let purpose_code = i32::from_be_bytes(slice4(&header[20..24]));

        if count < 0 || reason < 0 || !mode.is_valid() {
            return Err(TrackerError::MalformedRecord(format!(
                "journey {}: bad header (count {}, reason {}, mode {})",
                id, count, reason, mode.0
            )));
        }
        let purpose = Purpose::from_code(purpose_code).ok_or_else(|| {
            TrackerError::MalformedRecord(format!("journey {}: unknown purpose {}", id, purpose_code))
        })?;

        let count = count as usize;
        let mut points = Vec::with_capacity(count.min(4096));
        let mut raw = [0u8; POINT_BYTES];
        for i in 0..count {
            if read_fully(input, &mut raw)? < POINT_BYTES {
                return Err(TrackerError::MalformedRecord(format!(
                    "journey {}: truncated at point {} of {}",
                    id, i, count
                )));
            }
            points.push(RoutePoint {
                latitude: f64::from_be_bytes(slice8(&raw[0..8])),
                longitude: f64::from_be_bytes(slice8(&raw[8..16])),
                timestamp: i64::from_be_bytes(slice8(&raw[16..24])),
            });
        }

        Ok(Some(Journey {
            id,
            points,
            reason: TerminationCode(reason),
            mode,
            purpose,
        }))
    }
}

fn format_millis(ms: i64, pattern: &str) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format(pattern).to_string(),
        None => format!("{}ms", ms),
    }
}

/// Fill `buf` as far as the stream allows; returns bytes read
fn read_fully<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn slice8(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    out
}

fn slice4(b: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn journey_with(n: usize) -> Journey {
        let mut j = Journey::new(1_600_000_000_000);
        for i in 0..n {
            j.add_point(RoutePoint::new(
                35.8 + i as f64 * 1.37e-5,
                14.5 - i as f64 * 2.9e-5,
                1_600_000_000_000 + i as i64 * 2_000,
            ));
        }
        j
    }

    #[test]
    fn test_round_trip_exact() {
        for n in [1usize, 1000] {
            let mut j = journey_with(n);
            j.finish(TerminationReason::NoMotion);
            j.mode = TransportModes(TransportModes::BUS | TransportModes::ON_FOOT);
            j.purpose = Purpose::Shopping;

            let mut bytes = Vec::new();
            j.write_to(&mut bytes).unwrap();
            assert_eq!(bytes.len(), HEADER_BYTES + n * POINT_BYTES);

            let mut cursor = Cursor::new(bytes);
            let back = Journey::read_from(&mut cursor).unwrap().unwrap();
            assert_eq!(back.id, j.id);
            assert_eq!(back.reason, j.reason);
            assert_eq!(back.mode, j.mode);
            assert_eq!(back.purpose, Purpose::Shopping);
            for (a, b) in back.points().iter().zip(j.points()) {
                assert_eq!(a.latitude.to_bits(), b.latitude.to_bits());
                assert_eq!(a.longitude.to_bits(), b.longitude.to_bits());
                assert_eq!(a.timestamp, b.timestamp);
            }
            assert_eq!(back.len(), n);
            assert!(Journey::read_from(&mut cursor).unwrap().is_none());
        }
    }

    #[test]
    fn test_header_layout_big_endian() {
        let mut j = journey_with(1);
        j.id = 0x0102030405060708;
        j.finish(TerminationReason::UserStop);
        let mut bytes = Vec::new();
        j.write_to(&mut bytes).unwrap();
        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 5]);
    }

    #[test]
    fn test_truncated_record_is_malformed() {
        let mut bytes = Vec::new();
        journey_with(3).write_to(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 5);
        let err = Journey::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, TrackerError::MalformedRecord(_)));
    }

    #[test]
    fn test_rejects_unset_timestamp() {
        let mut j = Journey::new(1);
        assert!(!j.add_point(RoutePoint::new(1.0, 1.0, 0)));
        assert!(j.is_empty());
    }

    #[test]
    fn test_combine_codes_octal() {
        let nm = TerminationCode::from(TerminationReason::NoMotion);
        let us = TerminationCode::from(TerminationReason::UserStop);
        let joined = nm.combine(us).unwrap();
        assert_eq!(joined.0, 0o25);
        assert_eq!(
            joined
                .combine(TerminationReason::SignalLoss.into())
                .unwrap()
                .reasons(),
            vec![
                TerminationReason::NoMotion,
                TerminationReason::UserStop,
                TerminationReason::SignalLoss
            ]
        );
        assert!(TerminationCode::default().reasons().is_empty());
    }

    #[test]
    fn test_combine_refuses_overflow() {
        let nine = TerminationCode(0o222222222);
        let ten = nine.combine(TerminationReason::NoMotion.into()).unwrap();
        assert_eq!(ten.0, 0o2222222222);
        assert_eq!(ten.reasons().len(), 10);
        // An eleventh digit would need 2 * 8^10 = 2^31
        assert_eq!(ten.combine(TerminationReason::NoMotion.into()), None);
        let max = TerminationCode(i32::MAX);
        assert_eq!(max.combine(TerminationCode(0)), Some(max));
        assert_eq!(max.combine(TerminationCode(1)), None);
    }

    #[test]
    fn test_append_keeps_order() {
        let mut a = journey_with(3);
        a.finish(TerminationReason::NoMotion);
        let mut b = journey_with(2);
        b.finish(TerminationReason::NoMotion);
        a.append(b).unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(a.reason.0, 0o22);
    }

    #[test]
    fn test_append_hands_back_on_full_code() {
        let mut a = journey_with(3);
        a.reason = TerminationCode(0o2222222222);
        let mut b = journey_with(2);
        b.finish(TerminationReason::UserStop);
        let back = a.append(b.clone()).unwrap_err();
        assert_eq!(back, b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.reason.0, 0o2222222222);
    }

    #[test]
    fn test_purpose_codes() {
        assert_eq!(Purpose::Undisclosed.code(), 0);
        assert_eq!(Purpose::GoingHome.code(), 1);
        assert_eq!(Purpose::Other.code(), 1024);
        assert_eq!(Purpose::from_code(64), Some(Purpose::Shopping));
        assert_eq!(Purpose::from_code(3), None);
    }

    #[test]
    fn test_display_helpers() {
        let mut j = journey_with(2);
        j.mode = TransportModes(TransportModes::CAR_DRIVER);
        assert_eq!(j.mode.to_string(), "Car Driver");
        j.mode = TransportModes(TransportModes::BUS | TransportModes::TAXI);
        assert_eq!(j.mode.to_string(), "Bus (Public Transport),...");
        // 2020-09-13 12:26:40 UTC
        assert_eq!(j.title(), "Sun 13/Sep/2020");
        assert_eq!(j.times(), "[12:26:40] - [12:26:42]");
        assert_eq!(j.header_line(), format!("{} 0 0 2", TransportModes::BUS | TransportModes::TAXI));
    }
}
