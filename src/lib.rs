//! GPS journey segmentation: raw fixes in, discrete trips out.

pub mod accel_gate;
pub mod config;
pub mod downsampler;
pub mod error;
pub mod journey;
pub mod markov;
pub mod postprocess;
pub mod route_point;
pub mod segmenter;
pub mod service;
pub mod storage;
pub mod trace;
pub mod transport;
pub mod watchdog;
pub mod window_buffer;

pub use config::Settings;
pub use error::{TrackerError, TrackerResult};
pub use journey::{Journey, TerminationReason};
pub use route_point::RoutePoint;
pub use segmenter::{JourneySink, SegmenterState, TripSegmenter};
