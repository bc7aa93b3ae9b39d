//! Battery simulation
//!
//! Drains at the rate the power policy dictates with ±10% jitter; voltage
//! tracks the charge level linearly across the 3.2-4.2 V window with a
//! small measurement jitter.

use super::rng::Rng;
use crate::domain::BatteryStatus;

const MIN_VOLTAGE: f64 = 3.2;
const MAX_VOLTAGE: f64 = 4.2;

pub struct Battery {
    percentage: f64,
}

impl Battery {
    pub fn new() -> Self {
        Self { percentage: 100.0 }
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    pub fn set_percentage(&mut self, pct: f64) {
        self.percentage = pct.clamp(0.0, 100.0);
    }

    /// Apply drain for one tick. `drain_pct_per_hour` comes from the power
    /// policy for the current motion/connection state.
    pub fn tick(&mut self, delta_seconds: f64, drain_pct_per_hour: f64, rng: &mut dyn Rng) {
        let base_drain = (drain_pct_per_hour / 3600.0) * delta_seconds;
        let jitter = rng.uniform(-0.1, 0.1);
        let actual_drain = base_drain * (1.0 + jitter);

        self.percentage = (self.percentage - actual_drain).clamp(0.0, 100.0);
    }

    /// Snapshot for the wire: integral percentage and the derived voltage
    pub fn status(&self, rng: &mut dyn Rng) -> BatteryStatus {
        let voltage_range = MAX_VOLTAGE - MIN_VOLTAGE;
        let mut voltage = MIN_VOLTAGE + (self.percentage / 100.0) * voltage_range;
        voltage += rng.uniform(-0.05, 0.05);
        voltage = voltage.clamp(MIN_VOLTAGE, MAX_VOLTAGE);

        BatteryStatus {
            pct: self.percentage.round() as u8,
            voltage,
        }
    }
}

impl Default for Battery {
    fn default() -> Self {
        Self::new()
    }
}
