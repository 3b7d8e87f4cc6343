//! Test doubles: a recording transport, scripted sensors, and an actuator
//! that counts what it was asked to do.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::driver::{ActuatorDriver, DriverError, RelayActuator, SensorDriver};
use crate::model::{ActuatorKind, ActuatorState, Command, MetricKind, Reading};
use crate::transport::{topic_matches, InboundMessage, MessageHandler, Payload, Transport, TransportError};

// ---------------------------------------------------------------------------
// FakeTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTransport {
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    panic_publish: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<(String, MessageHandler)>>,
    disconnects: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected() -> Self {
        let t = Self::default();
        t.connected.store(true, Ordering::SeqCst);
        t
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_panic_publish(&self, panic: bool) {
        self.panic_publish.store(panic, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| serde_json::from_slice(&body).unwrap())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(f, _)| f.clone())
            .collect()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate the broker delivering a message. Returns how many
    /// subscriptions accepted it.
    pub fn deliver(&self, topic: &str, raw: &[u8]) -> usize {
        let Ok(payload) = Payload::parse(raw) else {
            return 0;
        };
        let subs = self.subscriptions.lock().unwrap();
        subs.iter()
            .filter(|(f, _)| topic_matches(f, topic))
            .filter(|(_, h)| {
                h.try_send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            })
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Client("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.subscriptions
            .lock()
            .unwrap()
            .push((filter.to_string(), handler));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(Duration::from_secs(5)));
        }
        assert!(!self.panic_publish.load(Ordering::SeqCst), "transport panicked on publish");
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Scripted sensors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SensorScript {
    Ok(Vec<(MetricKind, f64)>),
    /// Read succeeds with nothing to report.
    Unavailable,
    Fail,
    Panic,
    Hang(Duration),
}

pub struct ScriptedSensor {
    script: SensorScript,
    fail_init: bool,
    reads: Arc<AtomicUsize>,
}

impl ScriptedSensor {
    pub fn new(script: SensorScript) -> Self {
        Self {
            script,
            fail_init: false,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn temperature(value: f64) -> Self {
        Self::new(SensorScript::Ok(vec![(MetricKind::Temperature, value)]))
    }

    pub fn broken_init() -> Self {
        Self {
            fail_init: true,
            ..Self::new(SensorScript::Fail)
        }
    }

    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

impl SensorDriver for ScriptedSensor {
    fn initialize(&mut self) -> Result<(), DriverError> {
        if self.fail_init {
            return Err(DriverError::Hardware("no such device".into()));
        }
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<Reading>, DriverError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            SensorScript::Ok(values) => Ok(values
                .iter()
                .map(|(metric, v)| Reading::new("scripted", *metric, *v))
                .collect()),
            SensorScript::Unavailable => Ok(Vec::new()),
            SensorScript::Fail => Err(DriverError::Hardware("checksum mismatch".into())),
            SensorScript::Panic => panic!("scripted sensor panic"),
            SensorScript::Hang(d) => {
                std::thread::sleep(*d);
                Ok(Vec::new())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Counting actuator
// ---------------------------------------------------------------------------

/// Shared view of what a `CountingActuator` was asked to do.
#[derive(Clone, Default)]
pub struct ActuatorProbe {
    commands: Arc<Mutex<Vec<Command>>>,
    releases: Arc<AtomicUsize>,
    fail_execute: Arc<AtomicBool>,
}

impl ActuatorProbe {
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn executions(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn set_fail_execute(&self, fail: bool) {
        self.fail_execute.store(fail, Ordering::SeqCst);
    }
}

/// A simulated relay that records every command it receives.
pub struct CountingActuator {
    relay: RelayActuator,
    probe: ActuatorProbe,
}

impl CountingActuator {
    pub fn new(kind: ActuatorKind) -> (Self, ActuatorProbe) {
        let probe = ActuatorProbe::default();
        let actuator = Self {
            relay: RelayActuator::simulated(kind.as_str(), kind, 5),
            probe: probe.clone(),
        };
        (actuator, probe)
    }
}

impl ActuatorDriver for CountingActuator {
    fn kind(&self) -> ActuatorKind {
        self.relay.kind()
    }

    fn initialize(&mut self) -> Result<(), DriverError> {
        self.relay.initialize()
    }

    fn execute(&mut self, command: Command) -> Result<(), DriverError> {
        self.probe.commands.lock().unwrap().push(command);
        if self.probe.fail_execute.load(Ordering::SeqCst) {
            return Err(DriverError::Hardware("relay stuck".into()));
        }
        self.relay.execute(command)
    }

    fn state(&self) -> ActuatorState {
        self.relay.state()
    }

    fn release(&mut self) {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
        self.relay.release();
    }
}
