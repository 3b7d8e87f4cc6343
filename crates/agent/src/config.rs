//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::ActuatorKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
    #[serde(default)]
    pub actuators: Vec<ActuatorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device_id: String,
    /// First topic segment for everything the agent publishes or accepts.
    pub namespace: String,
    pub poll_interval_sec: u64,
    pub driver_timeout_ms: u64,
    pub shutdown_timeout_sec: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: "raspberry-pi-001".to_string(),
            namespace: "smartfarm".to_string(),
            poll_interval_sec: 30,
            driver_timeout_ms: 3000,
            shutdown_timeout_sec: 5,
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub keep_alive_sec: u64,
    pub connect_timeout_sec: u64,
    pub publish_timeout_sec: u64,
    pub tls: Option<TlsPaths>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            client_id: None,
            keep_alive_sec: 30,
            connect_timeout_sec: 10,
            publish_timeout_sec: 5,
            tls: None,
        }
    }
}

impl BrokerConfig {
    /// 8883 for TLS brokers (AWS IoT and friends), 1883 otherwise.
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls.is_some() { 8883 } else { 1883 })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsPaths {
    pub ca_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Dht22,
    Tsl2561,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub name: String,
    pub kind: SensorKind,
    #[serde(default)]
    pub simulated: bool,
    #[serde(default = "default_iio_device")]
    pub iio_device: PathBuf,
    #[serde(default = "default_i2c_bus")]
    pub i2c_bus: u8,
    #[serde(default = "default_tsl2561_address")]
    pub address: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorEntry {
    pub name: String,
    pub kind: ActuatorKind,
    pub gpio_pin: i64,
    #[serde(default = "default_true")]
    pub active_low: bool,
    #[serde(default)]
    pub simulated: bool,
}

fn default_iio_device() -> PathBuf {
    PathBuf::from("/sys/bus/iio/devices/iio:device0")
}

fn default_i2c_bus() -> u8 {
    1
}

fn default_tsl2561_address() -> u16 {
    0x39
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Valid 7-bit addresses for the TSL2561 (ADDR pin low / float / high).
const TSL2561_ADDRESSES: &[u16] = &[0x29, 0x39, 0x49];

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `DEVICE_ID`, `SENSOR_READ_INTERVAL`, `MQTT_HOST` and `MQTT_PORT`
    /// on top of the file. `lookup` is `std::env::var` outside of tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("DEVICE_ID") {
            self.agent.device_id = id;
        }
        if let Some(v) = lookup("SENSOR_READ_INTERVAL") {
            self.agent.poll_interval_sec = v
                .trim()
                .parse()
                .with_context(|| format!("SENSOR_READ_INTERVAL is not a number: {v:?}"))?;
        }
        if let Some(host) = lookup("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            let port = v
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v:?}"))?;
            self.broker.port = Some(port);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_agent(&mut errors);
        self.validate_broker(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_actuators(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_agent(&self, errors: &mut Vec<String>) {
        let a = &self.agent;
        if a.device_id.trim().is_empty() {
            errors.push("agent: device_id is empty".to_string());
        }
        if a.namespace.trim().is_empty() {
            errors.push("agent: namespace is empty".to_string());
        } else if a.namespace.contains(['/', '+', '#']) {
            errors.push(format!(
                "agent: namespace '{}' must be a single topic segment without wildcards",
                a.namespace
            ));
        }
        if a.poll_interval_sec == 0 {
            errors.push("agent: poll_interval_sec must be positive".to_string());
        }
        if a.driver_timeout_ms == 0 {
            errors.push("agent: driver_timeout_ms must be positive".to_string());
        }
        if a.shutdown_timeout_sec == 0 {
            errors.push("agent: shutdown_timeout_sec must be positive".to_string());
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        let b = &self.broker;
        if b.host.trim().is_empty() {
            errors.push("broker: host is empty".to_string());
        }
        if b.port == Some(0) {
            errors.push("broker: port must be non-zero".to_string());
        }
        if b.keep_alive_sec == 0 {
            errors.push("broker: keep_alive_sec must be positive".to_string());
        }
        if b.connect_timeout_sec == 0 {
            errors.push("broker: connect_timeout_sec must be positive".to_string());
        }
        if b.publish_timeout_sec == 0 {
            errors.push("broker: publish_timeout_sec must be positive".to_string());
        }
        if let Some(tls) = &b.tls {
            for (field, path) in [
                ("ca_path", &tls.ca_path),
                ("cert_path", &tls.cert_path),
                ("key_path", &tls.key_path),
            ] {
                if !path.is_file() {
                    errors.push(format!("broker.tls: {field} {} does not exist", path.display()));
                }
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.name.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.name)
                }
            };

            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&s.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if s.kind == SensorKind::Tsl2561 && !TSL2561_ADDRESSES.contains(&s.address) {
                errors.push(format!(
                    "{}: address 0x{:02x} is not a TSL2561 address (0x29, 0x39, 0x49)",
                    ctx(),
                    s.address
                ));
            }
        }
    }

    fn validate_actuators(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, a) in self.actuators.iter().enumerate() {
            let ctx = || {
                if a.name.is_empty() {
                    format!("actuators[{i}]")
                } else {
                    format!("actuator '{}'", a.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if a.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if a.name.contains(['/', '+', '#']) {
                errors.push(format!("{}: name must be a single topic segment", ctx()));
            } else if !seen_names.insert(&a.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&a.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    a.gpio_pin
                ));
            } else if !seen_pins.insert(a.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is already used by another actuator",
                    ctx(),
                    a.gpio_pin
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, and
/// validate the result.
pub fn load(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let mut config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;

    tracing::info!(
        device_id = %config.agent.device_id,
        sensors = config.sensors.len(),
        actuators = config.actuators.len(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
