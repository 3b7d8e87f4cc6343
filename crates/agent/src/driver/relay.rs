//! Relay-switched actuators (LED bar, fan, pump, heater).
//!
//! With the `hardware` feature the relay is driven through an rppal
//! `OutputPin`. Otherwise, or when the entry is marked `simulated`, the
//! relay level only lives in memory and changes are logged.

use serde_json::Value;
use std::collections::BTreeMap;

#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, OutputPin};

use super::{ActuatorDriver, DriverError};
use crate::model::{now_millis, ActuatorKind, ActuatorState, Command};

enum RelayOutput {
    #[cfg(feature = "hardware")]
    Gpio(OutputPin),
    Simulated { energized: bool },
}

pub struct RelayActuator {
    name: String,
    actuator_id: String,
    kind: ActuatorKind,
    gpio_pin: u8,
    #[cfg_attr(not(feature = "hardware"), allow(dead_code))]
    active_low: bool, // many relay boards are active-low
    simulated: bool,
    output: Option<RelayOutput>,
    power: bool,
    level: u8,
}

impl RelayActuator {
    pub fn new(name: &str, kind: ActuatorKind, gpio_pin: u8, active_low: bool, simulated: bool) -> Self {
        Self {
            name: name.to_string(),
            actuator_id: format!("{}_gpio_{gpio_pin}", kind.as_str()),
            kind,
            gpio_pin,
            active_low,
            simulated,
            output: None,
            power: false,
            level: 0,
        }
    }

    #[cfg(test)]
    pub fn simulated(name: &str, kind: ActuatorKind, gpio_pin: u8) -> Self {
        Self::new(name, kind, gpio_pin, true, true)
    }

    #[cfg(feature = "hardware")]
    fn open_output(&self) -> Result<RelayOutput, DriverError> {
        if self.simulated {
            return Ok(RelayOutput::Simulated { energized: false });
        }
        let gpio = match Gpio::new() {
            Ok(gpio) => gpio,
            Err(e) => {
                tracing::warn!(actuator = %self.name, "gpio unavailable ({e}), simulating relay");
                return Ok(RelayOutput::Simulated { energized: false });
            }
        };
        let pin = gpio.get(self.gpio_pin)?.into_output();
        Ok(RelayOutput::Gpio(pin))
    }

    #[cfg(not(feature = "hardware"))]
    fn open_output(&self) -> Result<RelayOutput, DriverError> {
        if !self.simulated {
            tracing::warn!(
                actuator = %self.name,
                gpio = self.gpio_pin,
                "built without hardware support, simulating relay"
            );
        }
        Ok(RelayOutput::Simulated { energized: false })
    }

    fn drive(&mut self, on: bool) -> Result<(), DriverError> {
        match self.output.as_mut() {
            #[cfg(feature = "hardware")]
            Some(RelayOutput::Gpio(pin)) => {
                // active-low relay: LOW = ON, HIGH = OFF
                if on != self.active_low {
                    pin.set_high();
                } else {
                    pin.set_low();
                }
            }
            Some(RelayOutput::Simulated { energized }) => *energized = on,
            None => return Err(DriverError::NotInitialized),
        }
        self.power = on;
        tracing::debug!(
            actuator = %self.name,
            gpio = self.gpio_pin,
            "relay set {}",
            if on { "ON" } else { "OFF" }
        );
        Ok(())
    }

    fn turn_off(&mut self) -> Result<(), DriverError> {
        self.drive(false)?;
        self.level = 0;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn energized(&self) -> Option<bool> {
        match self.output.as_ref()? {
            #[cfg(feature = "hardware")]
            RelayOutput::Gpio(_) => None,
            RelayOutput::Simulated { energized } => Some(*energized),
        }
    }
}

impl ActuatorDriver for RelayActuator {
    fn kind(&self) -> ActuatorKind {
        self.kind
    }

    fn initialize(&mut self) -> Result<(), DriverError> {
        self.output = Some(self.open_output()?);
        // Fail-safe: ensure "OFF" at startup
        self.turn_off()?;
        tracing::info!(
            actuator = %self.name,
            kind = %self.kind,
            gpio = self.gpio_pin,
            simulated = matches!(self.output, Some(RelayOutput::Simulated { .. })),
            "relay initialised"
        );
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<(), DriverError> {
        match command {
            Command::On => self.drive(true),
            Command::Off => self.turn_off(),
            Command::Level(level) => {
                let control = self.kind.continuous().ok_or(DriverError::Unsupported {
                    kind: self.kind,
                    command,
                })?;
                if level > 100 {
                    return Err(DriverError::InvalidData(format!("level {level} above 100")));
                }
                // No PWM on a relay: the level only decides on/off.
                if level >= control.on_threshold {
                    self.drive(true)?;
                } else {
                    self.turn_off()?;
                }
                self.level = level;
                Ok(())
            }
        }
    }

    fn state(&self) -> ActuatorState {
        let mut attributes = BTreeMap::new();
        attributes.insert("power".to_string(), Value::Bool(self.power));
        if let Some(control) = self.kind.continuous() {
            attributes.insert(control.command.to_string(), Value::from(self.level));
        }
        ActuatorState {
            actuator_id: self.actuator_id.clone(),
            kind: self.kind,
            attributes,
            observed_at_ms: now_millis(),
        }
    }

    fn release(&mut self) {
        if self.output.is_some() {
            if let Err(e) = self.turn_off() {
                tracing::error!(actuator = %self.name, "failed to switch relay off on release: {e}");
            }
        }
        // Dropping the rppal pin resets it to its original mode.
        self.output = None;
        tracing::info!(actuator = %self.name, "relay released");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
