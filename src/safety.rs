use serde::{Deserialize, Serialize};

use crate::config::FlightConfig;
use crate::protocol::{SystemState, TelemetryPacket};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyThresholds {
    pub battery_critical_mv: u16,
    pub battery_rearm_mv: u16,
    pub temperature_min_c: f32,
    pub temperature_max_c: f32,
    pub temperature_rearm_min_c: f32,
    pub temperature_rearm_max_c: f32,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self::from_config(&FlightConfig::default())
    }
}

impl SafetyThresholds {
    #[must_use]
    pub fn from_config(config: &FlightConfig) -> Self {
        Self {
            battery_critical_mv: config.battery_critical_mv,
            battery_rearm_mv: config
                .battery_critical_mv
                .saturating_add(config.battery_recovery_band_mv),
            temperature_min_c: config.temperature_min_c,
            temperature_max_c: config.temperature_max_c,
            temperature_rearm_min_c: config.temperature_min_c + config.temperature_hysteresis_c,
            temperature_rearm_max_c: config.temperature_max_c - config.temperature_hysteresis_c,
        }
    }
}

/// Battery and temperature limit checks run by the watchdog unit.
///
/// The state forcing is level-triggered: every evaluation below the battery
/// threshold asks for LowPower and every evaluation outside the temperature
/// band asks for Safe. The one-shot actions (payload shutdown, temperature
/// fault report) are edge-triggered and re-arm only once the reading is back
/// inside the hysteresis band.
#[derive(Debug)]
pub struct SafetyMonitor {
    thresholds: SafetyThresholds,
    battery_latched: bool,
    temperature_latched: bool,
    evaluations: u32,
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new(SafetyThresholds::default())
    }
}

impl SafetyMonitor {
    #[must_use]
    pub fn new(thresholds: SafetyThresholds) -> Self {
        Self {
            thresholds,
            battery_latched: false,
            temperature_latched: false,
            evaluations: 0,
        }
    }

    #[must_use]
    pub fn thresholds(&self) -> &SafetyThresholds {
        &self.thresholds
    }

    pub fn evaluate(&mut self, snapshot: &TelemetryPacket) -> SafetyActions {
        let mut actions = SafetyActions::new();
        self.evaluations = self.evaluations.wrapping_add(1);

        self.check_battery(snapshot.battery_voltage, &mut actions);
        self.check_temperature(snapshot.temperature_bme, &mut actions);

        // NASA Rule 5: a shutdown is never requested without the mode change
        debug_assert!(!actions.shutdown_payload || actions.enter_low_power);

        actions
    }

    fn check_battery(&mut self, millivolts: u16, actions: &mut SafetyActions) {
        if millivolts < self.thresholds.battery_critical_mv {
            actions.enter_low_power = true;
            if !self.battery_latched {
                self.battery_latched = true;
                actions.shutdown_payload = true;
                tracing::warn!(
                    battery_mv = millivolts,
                    threshold_mv = self.thresholds.battery_critical_mv,
                    "battery below critical threshold"
                );
            }
        } else if self.battery_latched && millivolts >= self.thresholds.battery_rearm_mv {
            self.battery_latched = false;
            actions.battery_rearmed = true;
            tracing::info!(battery_mv = millivolts, "battery recovered, shutdown re-armed");
        }
    }

    fn check_temperature(&mut self, celsius: f32, actions: &mut SafetyActions) {
        let t = &self.thresholds;
        if celsius > t.temperature_max_c || celsius < t.temperature_min_c {
            actions.enter_safe = true;
            if !self.temperature_latched {
                self.temperature_latched = true;
                actions.record_temperature_fault = true;
                tracing::warn!(
                    temperature_c = celsius,
                    min_c = t.temperature_min_c,
                    max_c = t.temperature_max_c,
                    "temperature outside operating limits"
                );
            }
        } else if self.temperature_latched
            && celsius >= t.temperature_rearm_min_c
            && celsius <= t.temperature_rearm_max_c
        {
            self.temperature_latched = false;
            actions.temperature_rearmed = true;
            tracing::info!(temperature_c = celsius, "temperature back in band, fault re-armed");
        }
    }

    #[must_use]
    pub fn battery_latched(&self) -> bool {
        self.battery_latched
    }

    #[must_use]
    pub fn temperature_latched(&self) -> bool {
        self.temperature_latched
    }

    #[must_use]
    pub fn evaluations(&self) -> u32 {
        self.evaluations
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SafetyActions {
    pub enter_low_power: bool,
    pub shutdown_payload: bool,
    pub enter_safe: bool,
    pub record_temperature_fault: bool,
    pub battery_rearmed: bool,
    pub temperature_rearmed: bool,
}

impl SafetyActions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_actions(&self) -> bool {
        self.enter_low_power
            || self.shutdown_payload
            || self.enter_safe
            || self.record_temperature_fault
    }

    /// Mode to force after this evaluation. Battery is applied first and
    /// temperature second, so Safe wins when both limits trip.
    #[must_use]
    pub fn target_state(&self) -> Option<SystemState> {
        if self.enter_safe {
            Some(SystemState::Safe)
        } else if self.enter_low_power {
            Some(SystemState::LowPower)
        } else {
            None
        }
    }
}
