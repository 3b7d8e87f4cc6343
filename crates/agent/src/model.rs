//! Domain types shared by drivers, the poller, the router and the publisher.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Relay level at or above which an LED `brightness` command powers the LED.
/// The relay has no dimming, so brightness degrades to on/off.
pub const LED_BRIGHTNESS_ON_THRESHOLD: u8 = 50;

/// Relay level at or above which a fan `speed` command powers the fan.
pub const FAN_SPEED_ON_THRESHOLD: u8 = 30;

/// Milliseconds since the Unix epoch.
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn now_millis() -> i64 {
    unix_millis(OffsetDateTime::now_utc())
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Temperature,
    Humidity,
    Light,
}

impl MetricKind {
    /// Topic segment used in `<namespace>/sensor/<metric>/data`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Light => "light",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Light => "lux",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor_name: String,
    pub metric: MetricKind,
    pub value: f64,
    pub unit: &'static str,
    pub captured_at: OffsetDateTime,
}

impl Reading {
    pub fn new(sensor_name: impl Into<String>, metric: MetricKind, value: f64) -> Self {
        Self {
            sensor_name: sensor_name.into(),
            metric,
            value,
            unit: metric.unit(),
            captured_at: OffsetDateTime::now_utc(),
        }
    }
}

/// One tick's worth of readings, keyed by logical sensor name. Sensors that
/// failed during the tick have no entry at all.
#[derive(Debug, Default, Clone)]
pub struct ReadingBatch {
    entries: BTreeMap<String, Vec<Reading>>,
}

impl ReadingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sensor's readings. Empty reading lists are ignored.
    pub fn insert(&mut self, sensor_name: impl Into<String>, readings: Vec<Reading>) {
        if !readings.is_empty() {
            self.entries.insert(sensor_name.into(), readings);
        }
    }

    /// Number of sensors contributing to this batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, sensor_name: &str) -> bool {
        self.entries.contains_key(sensor_name)
    }

    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.entries.values().flatten()
    }
}

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    Led,
    Fan,
    Pump,
    Heater,
    Relay,
}

/// A kind-specific command that takes a 0-100 level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousControl {
    /// Command name on the control topic, also the state attribute name.
    pub command: &'static str,
    /// Levels at or above this power the relay on.
    pub on_threshold: u8,
}

/// What a command name means for a particular actuator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    On,
    Off,
    Level,
}

impl ActuatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Led => "led",
            Self::Fan => "fan",
            Self::Pump => "pump",
            Self::Heater => "heater",
            Self::Relay => "relay",
        }
    }

    pub fn continuous(&self) -> Option<ContinuousControl> {
        match self {
            Self::Led => Some(ContinuousControl {
                command: "brightness",
                on_threshold: LED_BRIGHTNESS_ON_THRESHOLD,
            }),
            Self::Fan => Some(ContinuousControl {
                command: "speed",
                on_threshold: FAN_SPEED_ON_THRESHOLD,
            }),
            Self::Pump | Self::Heater | Self::Relay => None,
        }
    }

    /// Resolve a command name against this kind's vocabulary.
    pub fn resolve(&self, command: &str) -> Option<CommandKind> {
        match command {
            "on" => Some(CommandKind::On),
            "off" => Some(CommandKind::Off),
            other => self
                .continuous()
                .filter(|c| c.command == other)
                .map(|_| CommandKind::Level),
        }
    }
}

impl fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated command, ready for a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
    /// Level for the kind's continuous command, already bounded to 0..=100.
    Level(u8),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("on"),
            Self::Off => f.write_str("off"),
            Self::Level(v) => write!(f, "level={v}"),
        }
    }
}

/// Snapshot of an actuator, published as the `status` of a status report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub actuator_id: String,
    pub kind: ActuatorKind,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub observed_at_ms: i64,
}

#[cfg(test)]
impl ActuatorState {
    pub fn power(&self) -> Option<bool> {
        self.attributes.get("power").and_then(|v| v.as_bool())
    }

    pub fn attribute_u64(&self, name: &str) -> Option<u64> {
        self.attributes.get(name).and_then(|v| v.as_u64())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
