//! Board collaborators consumed by the flight software.
//!
//! Register-level drivers live behind these traits. Reads return calibrated
//! physical values (or raw codes where the telemetry carries raw codes);
//! outputs are fire-and-forget except for the serial links, whose transmit
//! can fail.

use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::ErrorFlag;

/// Battery monitor full-scale reference, millivolts.
pub const ADC_REFERENCE_MV: u32 = 3300;
/// Battery monitor sits behind a 1:2 resistor divider.
pub const BATTERY_DIVIDER: u32 = 2;
/// 12-bit converter.
pub const ADC_FULL_SCALE: u32 = 4096;

/// Converts a 12-bit battery-monitor code to cell millivolts.
#[must_use]
pub fn battery_millivolts(raw_code: u16) -> u16 {
    let mv = u32::from(raw_code) * ADC_REFERENCE_MV * BATTERY_DIVIDER / ADC_FULL_SCALE;
    u16::try_from(mv).unwrap_or(u16::MAX)
}

/// Inverse of [`battery_millivolts`], clamped to the converter range.
#[must_use]
pub fn battery_adc_code(millivolts: u16) -> u16 {
    let code = u32::from(millivolts) * ADC_FULL_SCALE / (ADC_REFERENCE_MV * BATTERY_DIVIDER);
    u16::try_from(code.min(ADC_FULL_SCALE - 1)).unwrap_or(u16::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Magnetometer,
    Environmental,
    PrecisionThermometer,
    CorrosionAdc,
    BatteryAdc,
}

impl Device {
    /// Fault category reported when this device cannot be read.
    #[must_use]
    pub fn fault_flag(self) -> ErrorFlag {
        match self {
            Device::Magnetometer | Device::Environmental | Device::PrecisionThermometer => ErrorFlag::I2c,
            Device::CorrosionAdc => ErrorFlag::Spi,
            Device::BatteryAdc => ErrorFlag::Adc,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Device::Magnetometer => "magnetometer",
            Device::Environmental => "environmental sensor",
            Device::PrecisionThermometer => "precision thermometer",
            Device::CorrosionAdc => "corrosion ADC",
            Device::BatteryAdc => "battery ADC",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("{0} did not acknowledge")]
    Nack(Device),
    #[error("{0} conversion timed out")]
    Timeout(Device),
}

impl SensorError {
    #[must_use]
    pub fn device(&self) -> Device {
        match self {
            SensorError::Nack(d) | SensorError::Timeout(d) => *d,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("transmit timed out")]
    Timeout,
    #[error("link is down")]
    Disconnected,
}

/// Magnetic field, gauss.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MagneticField {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Environment {
    pub temperature_c: f32,
    pub pressure_pa: f32,
    pub humidity_pct: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude_e7: i32,
    pub longitude_e7: i32,
    pub altitude_mm: i32,
    pub quality: u8,
    pub satellites: u8,
}

pub trait SensorSuite: Send {
    fn read_magnetometer(&mut self) -> Result<MagneticField, SensorError>;
    fn read_environment(&mut self) -> Result<Environment, SensorError>;
    fn read_precision_temperature(&mut self) -> Result<f32, SensorError>;
    fn read_corrosion_adc(&mut self) -> Result<u16, SensorError>;
    fn read_battery_voltage_mv(&mut self) -> Result<u16, SensorError>;

    /// Boards without a current sense amplifier report zero.
    fn read_battery_current_ma(&mut self) -> Result<u16, SensorError> {
        Ok(0)
    }

    fn read_gps(&mut self) -> Option<GpsFix> {
        None
    }
}

/// Payload (camera computer) power and wake line.
pub trait PayloadControl: Send + Sync {
    fn set_wake(&self, high: bool);

    /// Deasserts the wake line and gates non-essential bus power.
    fn shutdown_payload(&self);

    fn restore_payload_power(&self);
}

pub trait SerialLink: Send + Sync {
    fn transmit(&self, bytes: &[u8]) -> Result<(), LinkError>;
}

pub trait SystemControl: Send + Sync {
    /// Requests a full processor reset. Does not return on hardware.
    fn reset(&self);

    /// Boot counter kept outside volatile memory.
    fn boot_count(&self) -> u8;
}

pub trait HardwareWatchdog: Send + Sync {
    fn refresh(&self);
}

pub trait StatusIndicator: Send + Sync {
    fn toggle(&self);
}

/// Every board output the flight software drives, shared between units.
#[derive(Clone)]
pub struct Peripherals {
    pub payload: Arc<dyn PayloadControl>,
    /// Companion-computer UART: telemetry, acknowledgements, forwarded files.
    pub companion: Arc<dyn SerialLink>,
    /// Radio UART: beacons only.
    pub radio: Arc<dyn SerialLink>,
    pub system: Arc<dyn SystemControl>,
    pub watchdog: Arc<dyn HardwareWatchdog>,
    pub indicator: Arc<dyn StatusIndicator>,
}

impl fmt::Debug for Peripherals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripherals").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_conversion() {
        assert_eq!(battery_millivolts(0), 0);
        // 2482 * 6600 / 4096 = 3999.3
        assert_eq!(battery_millivolts(2482), 3999);
        assert_eq!(battery_millivolts(4095), 6598);
    }

    #[test]
    fn test_battery_code_inverse_is_close() {
        for mv in [3300u16, 3400, 3700, 4200] {
            let back = battery_millivolts(battery_adc_code(mv));
            assert!(mv - back <= 2, "{mv} -> {back}");
        }
    }

    #[test]
    fn test_device_fault_flags() {
        assert_eq!(Device::Magnetometer.fault_flag(), ErrorFlag::I2c);
        assert_eq!(Device::CorrosionAdc.fault_flag(), ErrorFlag::Spi);
        assert_eq!(Device::BatteryAdc.fault_flag(), ErrorFlag::Adc);
    }
}
