//! Logical-name lookup for initialized sensor and actuator drivers.
//!
//! The registry is built once at startup and shared behind `Arc` afterwards.
//! Lookups take no lock. Each driver sits behind its own mutex, which is what
//! keeps the poller and the router from using a driver at the same time.

use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::driver::{
    actuator_from_entry, sensor_from_entry, ActuatorDriver, ActuatorHandle, SensorDriver,
    SensorHandle,
};
use crate::model::ActuatorKind;

pub struct SensorSlot {
    pub name: String,
    pub driver: SensorHandle,
    initialized: AtomicBool,
}

impl SensorSlot {
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

pub struct ActuatorSlot {
    pub name: String,
    pub kind: ActuatorKind,
    pub driver: ActuatorHandle,
    initialized: AtomicBool,
}

impl ActuatorSlot {
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RegistryBuilder {
    sensors: BTreeMap<String, SensorSlot>,
    actuators: BTreeMap<String, ActuatorSlot>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize `driver` and keep it under `name`. A driver that fails to
    /// initialize is logged and left out. Returns whether it was registered.
    pub fn register_sensor(&mut self, name: &str, mut driver: Box<dyn SensorDriver>) -> bool {
        if self.sensors.contains_key(name) {
            tracing::warn!(sensor = %name, "duplicate sensor name, ignoring");
            return false;
        }
        if let Err(e) = driver.initialize() {
            tracing::error!(sensor = %name, "sensor init failed, leaving it out: {e}");
            return false;
        }
        self.sensors.insert(
            name.to_string(),
            SensorSlot {
                name: name.to_string(),
                driver: Arc::new(Mutex::new(driver)),
                initialized: AtomicBool::new(true),
            },
        );
        true
    }

    pub fn register_actuator(&mut self, name: &str, mut driver: Box<dyn ActuatorDriver>) -> bool {
        if self.actuators.contains_key(name) {
            tracing::warn!(actuator = %name, "duplicate actuator name, ignoring");
            return false;
        }
        if let Err(e) = driver.initialize() {
            tracing::error!(actuator = %name, "actuator init failed, leaving it out: {e}");
            return false;
        }
        let kind = driver.kind();
        self.actuators.insert(
            name.to_string(),
            ActuatorSlot {
                name: name.to_string(),
                kind,
                driver: Arc::new(Mutex::new(driver)),
                initialized: AtomicBool::new(true),
            },
        );
        true
    }

    /// Fails when a whole device class came up empty.
    pub fn finish(self) -> Result<DeviceRegistry> {
        if self.sensors.is_empty() {
            bail!("no sensor initialized successfully");
        }
        if self.actuators.is_empty() {
            bail!("no actuator initialized successfully");
        }
        tracing::info!(
            sensors = self.sensors.len(),
            actuators = self.actuators.len(),
            "device registry ready"
        );
        Ok(DeviceRegistry {
            sensors: self.sensors,
            actuators: self.actuators,
        })
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct DeviceRegistry {
    sensors: BTreeMap<String, SensorSlot>,
    actuators: BTreeMap<String, ActuatorSlot>,
}

impl DeviceRegistry {
    /// Construct and initialize every configured driver. Driver
    /// initialization blocks on hardware, so call this off the async runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = RegistryBuilder::new();
        for entry in &config.sensors {
            builder.register_sensor(&entry.name, sensor_from_entry(entry));
        }
        for entry in &config.actuators {
            builder.register_actuator(&entry.name, actuator_from_entry(entry));
        }
        builder.finish()
    }

    #[cfg(test)]
    pub fn sensor(&self, name: &str) -> Option<&SensorSlot> {
        self.sensors.get(name)
    }

    pub fn actuator(&self, name: &str) -> Option<&ActuatorSlot> {
        self.actuators.get(name)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &SensorSlot> {
        self.sensors.values()
    }

    pub fn actuators(&self) -> impl Iterator<Item = &ActuatorSlot> {
        self.actuators.values()
    }

    /// Release every driver and clear its `initialized` flag. Drivers that
    /// are still locked by a hung call are skipped with a warning.
    pub fn release_all(&self) {
        for slot in self.sensors.values() {
            if !slot.initialized.swap(false, Ordering::AcqRel) {
                continue;
            }
            match slot.driver.try_lock() {
                Ok(mut driver) => driver.release(),
                Err(_) => tracing::warn!(sensor = %slot.name, "driver busy, not released"),
            }
        }
        for slot in self.actuators.values() {
            if !slot.initialized.swap(false, Ordering::AcqRel) {
                continue;
            }
            match slot.driver.try_lock() {
                Ok(mut driver) => driver.release(),
                Err(_) => tracing::warn!(actuator = %slot.name, "driver busy, not released"),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
