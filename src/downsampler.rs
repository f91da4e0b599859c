use crate::route_point::RoutePoint;

/// Receives each averaged window
pub trait DownsampleHandler {
    fn on_downsample(&mut self, window: RoutePoint);
}

/// Averages every `rate` raw points into one window point
#[derive(Debug, Clone)]
pub struct Downsampler {
    rate: usize,
    accumulator: RoutePoint,
    processed: usize,
}

impl Downsampler {
    pub fn new(rate: usize) -> Self {
        assert!(rate > 0, "downsample rate must be positive");
        Downsampler {
            rate,
            accumulator: RoutePoint::default(),
            processed: 0,
        }
    }

    /// Accumulate a point; returns the mean once `rate` points are in.
    pub fn add_point(&mut self, point: RoutePoint) -> Option<RoutePoint> {
        self.accumulator += point;
        self.processed += 1;
        if self.processed < self.rate {
            return None;
        }
        let mean = self.accumulator * (1.0 / self.rate as f64);
        self.flush();
        Some(mean)
    }

    /// Same as [`add_point`](Self::add_point) but forwards the window to `handler`
    pub fn push<H: DownsampleHandler>(&mut self, point: RoutePoint, handler: &mut H) {
        if let Some(window) = self.add_point(point) {
            handler.on_downsample(window);
        }
    }

    /// Points held in the current partial window.
    ///
    /// The segmenter relies on this to map window ages onto raw-buffer ages:
    /// window `k` spans raw ages `k * rate + processed ..= (k + 1) * rate - 1 + processed`.
    pub fn processed_count(&self) -> usize {
        self.processed
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    /// Discard the partial window
    pub fn flush(&mut self) {
        self.accumulator = RoutePoint::default();
        self.processed = 0;
    }
}
