use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;

use crate::accel_gate::{AccelGate, GateState, GateVerdict};
use crate::config::Settings;
use crate::error::{TrackerError, TrackerResult};
use crate::route_point::RoutePoint;
use crate::segmenter::{SegmenterState, TripSegmenter};
use crate::storage::{spawn_writer, JourneyStore, JourneyWriter};
use crate::trace::TraceReading;
use crate::watchdog::{spawn_ticker, TimeoutHandler, Watchdog, WatchdogId};

/// Hardware switches the service flips between tracking modes
pub trait SensorControl {
    fn start_gps(&mut self) -> TrackerResult<()>;
    fn stop_gps(&mut self) -> TrackerResult<()>;
    fn start_accel(&mut self) -> TrackerResult<()>;
    fn stop_accel(&mut self) -> TrackerResult<()>;
}

/// Sensors fed from a recording or stdin; switching them only logs
#[derive(Debug, Default)]
pub struct PassiveSensors;

impl SensorControl for PassiveSensors {
    fn start_gps(&mut self) -> TrackerResult<()> {
        log::debug!("[SVC] gps on");
        Ok(())
    }

    fn stop_gps(&mut self) -> TrackerResult<()> {
        log::debug!("[SVC] gps off");
        Ok(())
    }

    fn start_accel(&mut self) -> TrackerResult<()> {
        log::debug!("[SVC] accelerometer on");
        Ok(())
    }

    fn stop_accel(&mut self) -> TrackerResult<()> {
        log::debug!("[SVC] accelerometer off");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Off,
    Gps,
    Accel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Location(RoutePoint),
    Satellites { count: u32, timestamp: i64 },
    Acceleration { xyz: [f64; 3], timestamp: i64 },
    Timeout(WatchdogId),
    Stop { by_user: bool },
}

struct TimeoutForwarder(UnboundedSender<ServiceEvent>);

impl TimeoutHandler for TimeoutForwarder {
    fn on_timeout(&self, id: WatchdogId) {
        if self.0.send(ServiceEvent::Timeout(id)).is_err() {
            log::debug!("[WD] timeout {} after service shutdown", id);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Journeys appended to the raw store during this session
    pub written: usize,
    /// Journeys left after post-processing
    pub processed: usize,
}

/// Switches between GPS segmentation and accelerometer standby.
///
/// Sensor samples and watchdog expiries share one event queue, so the
/// segmenter is only ever touched from the thread calling [`handle`].
///
/// [`handle`]: TrackingService::handle
pub struct TrackingService<C: SensorControl> {
    settings: Settings,
    sensors: C,
    store: JourneyStore,
    segmenter: TripSegmenter<JourneyWriter>,
    gate: AccelGate,
    watchdog: Arc<Watchdog>,
    gps_timer: WatchdogId,
    journey_timer: WatchdogId,
    accel_timer: WatchdogId,
    events_tx: UnboundedSender<ServiceEvent>,
    events_rx: UnboundedReceiver<ServiceEvent>,
    mode: Mode,
    last_sample: Option<i64>,
}

impl<C: SensorControl> TrackingService<C> {
    pub fn new(settings: Settings, sensors: C, store: JourneyStore) -> TrackerResult<Self> {
        settings.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watchdog = Arc::new(Watchdog::new(settings.timeouts.watchdog_offset));
        let forwarder: Arc<dyn TimeoutHandler> = Arc::new(TimeoutForwarder(events_tx.clone()));
        let gps_timer = watchdog.register(forwarder.clone(), settings.timeouts.no_satellite_ms);
        let journey_timer =
            watchdog.register(forwarder.clone(), settings.timeouts.journey_idle_ms);
        let accel_timer = watchdog.register(forwarder, settings.accel.check_interval_ms);

        let writer = spawn_writer(store.clone());
        Ok(TrackingService {
            segmenter: TripSegmenter::new(settings.gps.clone(), writer),
            gate: AccelGate::new(settings.accel.clone()),
            settings,
            sensors,
            store,
            watchdog,
            gps_timer,
            journey_timer,
            accel_timer,
            events_tx,
            events_rx,
            mode: Mode::Off,
            last_sample: None,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn segmenter_state(&self) -> SegmenterState {
        self.segmenter.state()
    }

    pub fn sensors(&self) -> &C {
        &self.sensors
    }

    /// Producer handle for the service's event queue
    pub fn sender(&self) -> UnboundedSender<ServiceEvent> {
        self.events_tx.clone()
    }

    pub fn start(&mut self, now: i64) -> TrackerResult<()> {
        if self.mode != Mode::Off {
            return Err(TrackerError::AlreadyRunning);
        }
        log::info!("[SVC] tracking started");
        self.enable_gps(now)
    }

    pub fn handle(&mut self, event: ServiceEvent, now: i64) -> TrackerResult<()> {
        match (self.mode, event) {
            (Mode::Gps, ServiceEvent::Location(point)) => {
                self.segmenter.on_location(point)?;
                if self.segmenter.is_active() {
                    self.watchdog.ping(self.journey_timer, now);
                }
            }
            (Mode::Gps, ServiceEvent::Satellites { count, .. }) => {
                if count >= self.settings.gps.min_satellites {
                    self.watchdog.ping(self.gps_timer, now);
                }
            }
            (Mode::Accel, ServiceEvent::Acceleration { xyz, timestamp }) => {
                self.on_acceleration(xyz, timestamp, now)?;
            }
            (_, ServiceEvent::Timeout(id)) => self.on_timeout(id, now)?,
            (_, ServiceEvent::Stop { by_user }) => self.stop(by_user),
            (mode, event) => log::trace!("[SVC] {:?} ignored in {:?}", event, mode),
        }
        Ok(())
    }

    /// Leave every mode; any journey in progress is persisted
    pub fn stop(&mut self, by_user: bool) {
        match self.mode {
            Mode::Off => return,
            Mode::Gps => self.disable_gps(by_user),
            Mode::Accel => {
                self.watchdog.pause(self.accel_timer);
                if self.gate.state() != GateState::Undefined {
                    self.gate.stop();
                    self.release_accel();
                }
            }
        }
        self.mode = Mode::Off;
        log::info!("[SVC] tracking stopped");
    }

    /// Stop, flush pending journey writes and post-process the raw store
    pub fn shutdown(mut self) -> TrackerResult<ShutdownSummary> {
        self.stop(true);
        for id in [self.gps_timer, self.journey_timer, self.accel_timer] {
            self.watchdog.kill(id);
        }
        let written = self.segmenter.into_sink().finish()?;
        let processed = self.store.post_process(&self.settings.postprocess)?;
        log::info!("[SVC] {} journeys written, {} after post-processing", written, processed);
        Ok(ShutdownSummary { written, processed })
    }

    /// Drive the service from a recorded trace, using trace time as the clock
    pub fn replay(&mut self, readings: &[TraceReading]) -> TrackerResult<()> {
        if self.mode == Mode::Off {
            match readings.first() {
                Some(first) => self.start(first.millis())?,
                None => return Ok(()),
            }
        }
        for reading in readings {
            let now = reading.millis();
            self.watchdog.poll(now);
            self.drain_queue(now)?;

            for event in reading_events(reading, self.settings.gps.min_satellites) {
                self.handle(event, now)?;
            }
        }
        Ok(())
    }

    /// Live loop: consume queued events until a stop, then shut down
    pub async fn run(mut self, tick: Duration) -> TrackerResult<ShutdownSummary> {
        let ticker = spawn_ticker(self.watchdog.clone(), tick);
        if let Err(e) = self.start(now_millis()) {
            ticker.abort();
            return Err(e);
        }
        while let Some(event) = self.events_rx.recv().await {
            let last = matches!(event, ServiceEvent::Stop { .. });
            if let Err(e) = self.handle(event, now_millis()) {
                log::error!("[SVC] {}", e);
            }
            if last {
                break;
            }
        }
        ticker.abort();
        self.shutdown()
    }

    fn drain_queue(&mut self, now: i64) -> TrackerResult<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle(event, now)?;
        }
        Ok(())
    }

    fn enable_gps(&mut self, now: i64) -> TrackerResult<()> {
        if let Err(e) = self.sensors.start_gps() {
            log::error!("[SVC] GPS unavailable: {}", e);
            self.mode = Mode::Off;
            return Err(e);
        }
        self.segmenter.on_start()?;
        self.watchdog.start(self.gps_timer, now);
        self.watchdog.start(self.journey_timer, now);
        self.mode = Mode::Gps;
        Ok(())
    }

    fn disable_gps(&mut self, by_user: bool) {
        self.watchdog.pause(self.gps_timer);
        self.watchdog.pause(self.journey_timer);
        self.segmenter.on_stop(by_user);
        if let Err(e) = self.sensors.stop_gps() {
            log::warn!("[SVC] failed to stop GPS: {}", e);
        }
    }

    fn release_accel(&mut self) {
        if let Err(e) = self.sensors.stop_accel() {
            log::warn!("[SVC] failed to stop accelerometer: {}", e);
        }
    }

    fn on_timeout(&mut self, id: WatchdogId, now: i64) -> TrackerResult<()> {
        if id == self.gps_timer && self.mode == Mode::Gps {
            log::info!("[SVC] satellite fix lost");
            self.segmenter.on_signal_loss();
        } else if id == self.journey_timer && self.mode == Mode::Gps {
            log::info!("[SVC] no journey, switching to accelerometer");
            self.disable_gps(false);
            self.watchdog.start(self.accel_timer, now);
            self.mode = Mode::Accel;
        } else if id == self.accel_timer && self.mode == Mode::Accel {
            self.watchdog.pause(self.accel_timer);
            if let Err(e) = self.sensors.start_accel() {
                log::warn!("[SVC] accelerometer unavailable: {}", e);
                self.watchdog.start(self.accel_timer, now);
                return Err(e);
            }
            self.gate.start();
            self.last_sample = None;
        } else {
            log::trace!("[SVC] stale timeout {} in {:?}", id, self.mode);
        }
        Ok(())
    }

    fn on_acceleration(&mut self, xyz: [f64; 3], timestamp: i64, now: i64) -> TrackerResult<()> {
        if self.gate.state() == GateState::Undefined {
            return Ok(());
        }
        if let Some(last) = self.last_sample {
            if timestamp - last < self.settings.accel.min_sample_interval_ms {
                return Ok(());
            }
        }
        self.last_sample = Some(timestamp);

        match self.gate.on_sample(xyz) {
            GateVerdict::Wait => {}
            GateVerdict::Sleep => {
                self.gate.stop();
                self.release_accel();
                self.watchdog.start(self.accel_timer, now);
            }
            GateVerdict::Pass => {
                self.release_accel();
                log::info!("[SVC] motion detected, GPS back on");
                self.enable_gps(now)?;
            }
        }
        Ok(())
    }
}

/// Events carried by one recorded reading, satellite report before its fix.
///
/// Recordings without satellite counts only hold usable fixes, so those are
/// reported with `min_satellites`.
pub fn reading_events(reading: &TraceReading, min_satellites: u32) -> Vec<ServiceEvent> {
    let mut events = Vec::with_capacity(3);
    if let Some(point) = reading.location() {
        let count = reading
            .gps
            .and_then(|g| g.satellites)
            .unwrap_or(min_satellites);
        events.push(ServiceEvent::Satellites {
            count,
            timestamp: point.timestamp,
        });
        events.push(ServiceEvent::Location(point));
    }
    if let Some(xyz) = reading.acceleration() {
        events.push(ServiceEvent::Acceleration {
            xyz,
            timestamp: reading.millis(),
        });
    }
    events
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
