//! TSL2561 ambient light sensor over I2C.
//!
//! Runs at 402 ms integration and 1x gain. Both photodiode channels are read
//! and converted to lux with the datasheet's piecewise approximation for the
//! T/FN/CL package.

#[cfg(feature = "hardware")]
use rppal::i2c::I2c;
use time::OffsetDateTime;

use super::{sim, DriverError, SensorDriver};
use crate::model::{MetricKind, Reading};

// ── Register map ────────────────────────────────────────────────────────────

#[cfg(feature = "hardware")]
mod reg {
    /// Command byte: CMD bit set, register address in the low nibble.
    pub const CMD: u8 = 0x80;
    /// Word-protocol bit; combined with CMD for 16-bit channel reads.
    pub const CMD_WORD: u8 = 0x20;

    pub const CONTROL: u8 = 0x00;
    pub const TIMING: u8 = 0x01;
    pub const DATA0: u8 = 0x0C;
    pub const DATA1: u8 = 0x0E;

    pub const POWER_ON: u8 = 0x03;
    pub const POWER_OFF: u8 = 0x00;
    /// GAIN=0 (1x), INTEG=10 (402 ms).
    pub const TIMING_402MS_1X: u8 = 0x02;
}

/// The datasheet lux formula assumes 16x gain; scale 1x counts up.
const GAIN_SCALE: f64 = 16.0;

/// Counts saturate at 0xFFFF with 402 ms integration.
const SATURATED: u16 = u16::MAX;

#[cfg(feature = "hardware")]
const FIRST_INTEGRATION: std::time::Duration = std::time::Duration::from_millis(410);

/// Convert raw channel counts (broadband `ch0`, infrared `ch1`) to lux.
/// Returns `None` when either channel is saturated.
pub(crate) fn compute_lux(ch0: u16, ch1: u16) -> Option<f64> {
    if ch0 == SATURATED || ch1 == SATURATED {
        return None;
    }
    if ch0 == 0 {
        return Some(0.0);
    }
    let c0 = f64::from(ch0) * GAIN_SCALE;
    let c1 = f64::from(ch1) * GAIN_SCALE;
    let ratio = c1 / c0;

    let lux = if ratio <= 0.50 {
        0.0304 * c0 - 0.062 * c0 * ratio.powf(1.4)
    } else if ratio <= 0.61 {
        0.0224 * c0 - 0.031 * c1
    } else if ratio <= 0.80 {
        0.0128 * c0 - 0.0153 * c1
    } else if ratio <= 1.30 {
        0.00146 * c0 - 0.00112 * c1
    } else {
        0.0
    };
    Some(lux.max(0.0))
}

enum Backend {
    #[cfg(feature = "hardware")]
    I2c(I2c),
    Simulated,
}

pub struct Tsl2561 {
    name: String,
    #[cfg_attr(not(feature = "hardware"), allow(dead_code))]
    bus: u8,
    address: u16,
    simulated: bool,
    backend: Option<Backend>,
}

impl Tsl2561 {
    pub fn new(name: &str, bus: u8, address: u16, simulated: bool) -> Self {
        Self {
            name: name.to_string(),
            bus,
            address,
            simulated,
            backend: None,
        }
    }

    #[cfg(feature = "hardware")]
    fn open(&self) -> Result<Backend, DriverError> {
        if self.simulated {
            return Ok(Backend::Simulated);
        }
        let mut i2c = match I2c::with_bus(self.bus) {
            Ok(i2c) => i2c,
            Err(e) => {
                tracing::warn!(sensor = %self.name, bus = self.bus, "i2c unavailable ({e}), simulating light sensor");
                return Ok(Backend::Simulated);
            }
        };
        i2c.set_slave_address(self.address)?;

        i2c.smbus_write_byte(reg::CMD | reg::CONTROL, reg::POWER_ON)?;
        let control = i2c.smbus_read_byte(reg::CMD | reg::CONTROL)?;
        if control & reg::POWER_ON != reg::POWER_ON {
            return Err(DriverError::Hardware(format!(
                "tsl2561 at 0x{:02x} did not power up (control={control:#04x})",
                self.address
            )));
        }
        i2c.smbus_write_byte(reg::CMD | reg::TIMING, reg::TIMING_402MS_1X)?;

        // Let the first integration cycle complete before the first read.
        std::thread::sleep(FIRST_INTEGRATION);
        Ok(Backend::I2c(i2c))
    }

    #[cfg(not(feature = "hardware"))]
    fn open(&self) -> Result<Backend, DriverError> {
        if !self.simulated {
            tracing::warn!(
                sensor = %self.name,
                addr = format_args!("0x{:02x}", self.address),
                "built without hardware support, simulating light sensor"
            );
        }
        Ok(Backend::Simulated)
    }
}

impl SensorDriver for Tsl2561 {
    fn initialize(&mut self) -> Result<(), DriverError> {
        self.backend = Some(self.open()?);
        tracing::info!(
            sensor = %self.name,
            addr = format_args!("0x{:02x}", self.address),
            simulated = matches!(self.backend, Some(Backend::Simulated)),
            "tsl2561 initialised"
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<Reading>, DriverError> {
        let lux = match self.backend.as_mut() {
            #[cfg(feature = "hardware")]
            Some(Backend::I2c(i2c)) => {
                let ch0 = i2c.smbus_read_word(reg::CMD | reg::CMD_WORD | reg::DATA0)?;
                let ch1 = i2c.smbus_read_word(reg::CMD | reg::CMD_WORD | reg::DATA1)?;
                match compute_lux(ch0, ch1) {
                    Some(lux) => sim::round1(lux),
                    None => {
                        tracing::warn!(sensor = %self.name, ch0, ch1, "tsl2561 saturated");
                        return Ok(Vec::new());
                    }
                }
            }
            Some(Backend::Simulated) => sim::light_lux(OffsetDateTime::now_utc()),
            None => return Err(DriverError::NotInitialized),
        };
        tracing::debug!(sensor = %self.name, lux, "tsl2561 sample");
        Ok(vec![Reading::new(&self.name, MetricKind::Light, lux)])
    }

    fn release(&mut self) {
        #[cfg(feature = "hardware")]
        if let Some(Backend::I2c(i2c)) = self.backend.as_mut() {
            if let Err(e) = i2c.smbus_write_byte(reg::CMD | reg::CONTROL, reg::POWER_OFF) {
                tracing::warn!(sensor = %self.name, "tsl2561 power-down failed: {e}");
            }
        }
        self.backend = None;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Lux conversion -----------------------------------------------------

    #[test]
    fn lux_dark_is_zero() {
        assert_eq!(compute_lux(0, 0), Some(0.0));
    }

    #[test]
    fn lux_no_infrared() {
        // ratio 0: 0.0304 * (100 * 16)
        let lux = compute_lux(100, 0).unwrap();
        assert!((lux - 48.64).abs() < 1e-9, "lux = {lux}");
    }

    #[test]
    fn lux_mid_ratio_band() {
        // ratio 0.55: 0.0224 * 1600 - 0.031 * 880
        let lux = compute_lux(100, 55).unwrap();
        assert!((lux - (35.84 - 27.28)).abs() < 1e-9, "lux = {lux}");
    }

    #[test]
    fn lux_mostly_infrared_is_zero() {
        assert_eq!(compute_lux(100, 200), Some(0.0));
    }

    #[test]
    fn lux_saturated_is_none() {
        assert_eq!(compute_lux(u16::MAX, 10), None);
        assert_eq!(compute_lux(10, u16::MAX), None);
    }

    #[test]
    fn lux_is_never_negative() {
        for ch1 in 0..=130u16 {
            assert!(compute_lux(100, ch1).unwrap() >= 0.0);
        }
    }

    // -- Driver ---------------------------------------------------------------

    #[test]
    fn simulated_reports_light_in_lux() {
        let mut sensor = Tsl2561::new("light", 1, 0x39, true);
        sensor.initialize().unwrap();
        let readings = sensor.read().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].metric, MetricKind::Light);
        assert_eq!(readings[0].unit, "lux");
        assert!(readings[0].value >= 0.0);
    }

    #[test]
    fn read_before_initialise_fails() {
        let mut sensor = Tsl2561::new("light", 1, 0x39, true);
        assert!(matches!(sensor.read(), Err(DriverError::NotInitialized)));
    }

    #[test]
    fn release_returns_to_uninitialised() {
        let mut sensor = Tsl2561::new("light", 1, 0x39, true);
        sensor.initialize().unwrap();
        sensor.release();
        assert!(matches!(sensor.read(), Err(DriverError::NotInitialized)));
    }
}
