//! DHT22 temperature/humidity probe.
//!
//! The single-wire protocol is timing-critical, so the hardware variant reads
//! through the kernel's `dht11` IIO driver (`dtoverlay=dht11,gpiopin=4`,
//! which also handles the DHT22) instead of bit-banging from userspace.
//! Values are exposed in milli-units:
//!
//! - `in_temp_input`: milli-degrees Celsius
//! - `in_humidityrelative_input`: milli-percent relative humidity

use std::fs;
use std::path::{Path, PathBuf};

use super::{sim, DriverError, SensorDriver};
use crate::model::{MetricKind, Reading};

const TEMP_FILE: &str = "in_temp_input";
const HUMIDITY_FILE: &str = "in_humidityrelative_input";

/// DHT22 datasheet operating range.
const TEMP_RANGE_C: std::ops::RangeInclusive<f64> = -40.0..=80.0;
const HUMIDITY_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

enum Source {
    Iio(PathBuf),
    Simulated,
}

pub struct Dht22 {
    name: String,
    source: Source,
    ready: bool,
}

impl Dht22 {
    pub fn new(name: &str, iio_device: &Path, simulated: bool) -> Self {
        let source = if simulated {
            Source::Simulated
        } else {
            Source::Iio(iio_device.to_path_buf())
        };
        Self {
            name: name.to_string(),
            source,
            ready: false,
        }
    }

    fn sample(&self) -> Result<(f64, f64), DriverError> {
        match &self.source {
            Source::Iio(dir) => {
                let temperature = read_milli(&dir.join(TEMP_FILE))?;
                let humidity = read_milli(&dir.join(HUMIDITY_FILE))?;
                Ok((temperature, humidity))
            }
            Source::Simulated => Ok((sim::uniform(18.0, 28.0), sim::uniform(40.0, 80.0))),
        }
    }
}

/// Read an IIO milli-unit attribute and scale it to whole units.
fn read_milli(path: &Path) -> Result<f64, DriverError> {
    // The kernel driver answers EIO on a checksum failure; that surfaces
    // here as an io error and the tick simply skips this probe.
    let raw = fs::read_to_string(path)?;
    let milli: i64 = raw
        .trim()
        .parse()
        .map_err(|_| DriverError::InvalidData(format!("{}: {raw:?}", path.display())))?;
    Ok(sim::round1(milli as f64 / 1000.0))
}

impl SensorDriver for Dht22 {
    fn initialize(&mut self) -> Result<(), DriverError> {
        if let Source::Iio(dir) = &self.source {
            for file in [TEMP_FILE, HUMIDITY_FILE] {
                if !dir.join(file).exists() {
                    return Err(DriverError::Hardware(format!(
                        "{} missing; is the dht11 overlay loaded?",
                        dir.join(file).display()
                    )));
                }
            }
        }
        self.ready = true;
        tracing::info!(
            sensor = %self.name,
            simulated = matches!(self.source, Source::Simulated),
            "dht22 initialised"
        );
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<Reading>, DriverError> {
        if !self.ready {
            return Err(DriverError::NotInitialized);
        }
        let (temperature, humidity) = self.sample()?;
        if !TEMP_RANGE_C.contains(&temperature) {
            return Err(DriverError::InvalidData(format!("temperature {temperature} °C")));
        }
        if !HUMIDITY_RANGE.contains(&humidity) {
            return Err(DriverError::InvalidData(format!("humidity {humidity} %")));
        }
        tracing::debug!(sensor = %self.name, temperature, humidity, "dht22 sample");
        Ok(vec![
            Reading::new(&self.name, MetricKind::Temperature, temperature),
            Reading::new(&self.name, MetricKind::Humidity, humidity),
        ])
    }

    fn release(&mut self) {
        self.ready = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn iio_dir(tag: &str, temp: &str, humidity: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("farm-agent-iio-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(TEMP_FILE), temp).unwrap();
        fs::write(dir.join(HUMIDITY_FILE), humidity).unwrap();
        dir
    }

    #[test]
    fn simulated_yields_temperature_and_humidity() {
        let mut probe = Dht22::new("dht22", Path::new("/nonexistent"), true);
        probe.initialize().unwrap();
        let readings = probe.read().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].metric, MetricKind::Temperature);
        assert_eq!(readings[0].unit, "°C");
        assert_eq!(readings[1].metric, MetricKind::Humidity);
        assert!((18.0..=28.0).contains(&readings[0].value));
        assert!((40.0..=80.0).contains(&readings[1].value));
    }

    #[test]
    fn iio_values_are_scaled_from_milli_units() {
        let dir = iio_dir("ok", "23400\n", "61250\n");
        let mut probe = Dht22::new("dht22", &dir, false);
        probe.initialize().unwrap();
        let readings = probe.read().unwrap();
        assert_eq!(readings[0].value, 23.4);
        assert_eq!(readings[1].value, 61.3);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_iio_device_fails_initialise() {
        let mut probe = Dht22::new("dht22", Path::new("/nonexistent/iio:device9"), false);
        assert!(probe.initialize().is_err());
    }

    #[test]
    fn read_before_initialise_fails() {
        let mut probe = Dht22::new("dht22", Path::new("/nonexistent"), true);
        assert!(matches!(probe.read(), Err(DriverError::NotInitialized)));
    }

    #[test]
    fn garbage_value_is_invalid_data() {
        let dir = iio_dir("garbage", "abc", "50000");
        let mut probe = Dht22::new("dht22", &dir, false);
        probe.initialize().unwrap();
        assert!(matches!(probe.read(), Err(DriverError::InvalidData(_))));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn implausible_humidity_is_rejected() {
        let dir = iio_dir("range", "20000", "140000");
        let mut probe = Dht22::new("dht22", &dir, false);
        probe.initialize().unwrap();
        assert!(matches!(probe.read(), Err(DriverError::InvalidData(_))));
        fs::remove_dir_all(dir).ok();
    }
}
