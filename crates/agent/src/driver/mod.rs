//! Sensor and actuator driver capabilities.
//!
//! Every concrete driver has a hardware variant and a `Simulated` variant.
//! The variant is picked when the driver is constructed: `simulated = true`
//! in the config, or a build without the `hardware` feature, selects the
//! simulated one.

mod dht22;
mod relay;
mod sim;
mod tsl2561;

pub use dht22::Dht22;
pub use relay::RelayActuator;
pub use tsl2561::Tsl2561;

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use thiserror::Error;

use crate::config::{ActuatorEntry, SensorEntry, SensorKind};
use crate::model::{ActuatorKind, ActuatorState, Command, Reading};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device returned no data")]
    Unavailable,
    #[error("driver not initialized")]
    NotInitialized,
    #[error("driver call exceeded {0:?}")]
    Timeout(Duration),
    #[error("driver busy with a previous call")]
    Busy,
    #[error("command {command} not supported by {kind}")]
    Unsupported { kind: ActuatorKind, command: Command },
    #[error("implausible reading: {0}")]
    InvalidData(String),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("driver panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        Self::Hardware(e.to_string())
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::gpio::Error> for DriverError {
    fn from(e: rppal::gpio::Error) -> Self {
        Self::Hardware(e.to_string())
    }
}

#[cfg(feature = "hardware")]
impl From<rppal::i2c::Error> for DriverError {
    fn from(e: rppal::i2c::Error) -> Self {
        Self::Hardware(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

pub trait SensorDriver: Send {
    fn initialize(&mut self) -> Result<(), DriverError>;

    /// Take one sample. An empty vector means the device had nothing to
    /// report this time.
    fn read(&mut self) -> Result<Vec<Reading>, DriverError>;

    fn release(&mut self) {}
}

pub trait ActuatorDriver: Send {
    fn kind(&self) -> ActuatorKind;

    fn initialize(&mut self) -> Result<(), DriverError>;

    fn execute(&mut self, command: Command) -> Result<(), DriverError>;

    fn state(&self) -> ActuatorState;

    fn release(&mut self) {}
}

pub type SensorHandle = Arc<Mutex<Box<dyn SensorDriver>>>;
pub type ActuatorHandle = Arc<Mutex<Box<dyn ActuatorDriver>>>;

/// Run `f` against a driver on the blocking pool, bounded by `limit`.
///
/// A driver still busy with an earlier call (one that timed out) is reported
/// as `Busy` instead of queueing another blocking thread behind it.
pub async fn call_bounded<D, T, F>(
    driver: &Arc<Mutex<D>>,
    limit: Duration,
    f: F,
) -> Result<T, DriverError>
where
    D: ?Sized + Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut D) -> Result<T, DriverError> + Send + 'static,
{
    let driver = Arc::clone(driver);
    let task = tokio::task::spawn_blocking(move || {
        let mut guard = match driver.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(DriverError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => {
                tracing::warn!("recovering driver after an earlier panic");
                poisoned.into_inner()
            }
        };
        f(&mut guard)
    });

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(DriverError::Panicked(join.to_string())),
        Err(_) => Err(DriverError::Timeout(limit)),
    }
}

// ---------------------------------------------------------------------------
// Construction from config
// ---------------------------------------------------------------------------

pub fn sensor_from_entry(entry: &SensorEntry) -> Box<dyn SensorDriver> {
    match entry.kind {
        SensorKind::Dht22 => Box::new(Dht22::new(&entry.name, &entry.iio_device, entry.simulated)),
        SensorKind::Tsl2561 => Box::new(Tsl2561::new(
            &entry.name,
            entry.i2c_bus,
            entry.address,
            entry.simulated,
        )),
    }
}

pub fn actuator_from_entry(entry: &ActuatorEntry) -> Box<dyn ActuatorDriver> {
    Box::new(RelayActuator::new(
        &entry.name,
        entry.kind,
        entry.gpio_pin as u8,
        entry.active_low,
        entry.simulated,
    ))
}

// ===========================================================================
// Tests
// ===========================================================================
