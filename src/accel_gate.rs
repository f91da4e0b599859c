use serde::{Deserialize, Serialize};

use crate::config::AccelSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateState {
    Undefined,
    QuickCheck,
    ExtraCheck,
}

/// Outcome of one accelerometer sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateVerdict {
    /// At rest, go back to sleep
    Sleep,
    /// Need more samples
    Wait,
    /// Motion confirmed, re-enable GPS
    Pass,
}

/// Two-stage motion check run while GPS is off
pub struct AccelGate {
    settings: AccelSettings,
    state: GateState,
    deviations: Vec<f64>,
    window: usize,
}

impl AccelGate {
    pub fn new(settings: AccelSettings) -> Self {
        let capacity = settings.quick_sample_size.max(settings.extra_sample_size);
        Self {
            settings,
            state: GateState::Undefined,
            deviations: Vec::with_capacity(capacity),
            window: 0,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn start(&mut self) {
        self.enter(GateState::QuickCheck);
    }

    pub fn stop(&mut self) {
        self.state = GateState::Undefined;
        self.deviations.clear();
        self.window = 0;
    }

    pub fn on_sample(&mut self, accel: [f64; 3]) -> GateVerdict {
        if self.state == GateState::Undefined {
            return GateVerdict::Sleep;
        }

        let magnitude = (accel[0] * accel[0] + accel[1] * accel[1] + accel[2] * accel[2]).sqrt();
        let deviation = magnitude - self.settings.gravity;
        self.deviations.push(deviation * deviation);
        if self.deviations.len() < self.window {
            return GateVerdict::Wait;
        }

        let energy = self.deviations.iter().sum::<f64>() / self.deviations.len() as f64;
        match self.state {
            GateState::QuickCheck if energy < self.settings.quick_threshold => {
                log::debug!("[ACC] quick check at rest ({:.4})", energy);
                self.enter(GateState::QuickCheck);
                GateVerdict::Sleep
            }
            GateState::QuickCheck => {
                log::debug!("[ACC] quick check moving ({:.4}), extending", energy);
                self.enter(GateState::ExtraCheck);
                GateVerdict::Wait
            }
            GateState::ExtraCheck if energy < self.settings.extra_threshold => {
                log::debug!("[ACC] extra check at rest ({:.4})", energy);
                self.enter(GateState::QuickCheck);
                GateVerdict::Sleep
            }
            _ => {
                log::info!("[ACC] motion confirmed ({:.4})", energy);
                self.stop();
                GateVerdict::Pass
            }
        }
    }

    fn enter(&mut self, state: GateState) {
        self.state = state;
        self.deviations.clear();
        self.window = match state {
            GateState::QuickCheck => self.settings.quick_sample_size,
            GateState::ExtraCheck => self.settings.extra_sample_size,
            GateState::Undefined => 0,
        };
    }
}
