//! Control-message routing.
//!
//! Each inbound message walks `Idle -> Parsing -> Validated -> Dispatching
//! -> Reporting -> Idle`. A message that fails parsing or validation goes
//! straight back to `Idle` and is dropped with a log entry. One worker
//! drains the queue, so commands run strictly in arrival order and never
//! concurrently.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::driver::{call_bounded, DriverError};
use crate::model::{ActuatorKind, Command, CommandKind};
use crate::publisher::Publisher;
use crate::registry::{ActuatorSlot, DeviceRegistry};
use crate::transport::{InboundMessage, Payload, TransportError};

const CONTROL_SEGMENT: &str = "control";

/// Bounds for the value of a continuous command.
const LEVEL_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Idle,
    Parsing,
    Validated,
    Dispatching,
    Reporting,
}

#[derive(Debug, Error, PartialEq)]
pub enum Rejection {
    #[error("topic {0:?} is not <namespace>/control/<target>/<command>")]
    BadTopic(String),
    #[error("no actuator named {0:?}")]
    UnknownTarget(String),
    #[error("{kind} has no command {command:?}")]
    UnknownCommand { kind: ActuatorKind, command: String },
    #[error("{command} needs a value")]
    MissingValue { command: String },
    #[error("{command} value {value} is not a number")]
    NotNumeric { command: String, value: Value },
    #[error("{command} value {value} outside 0..=100")]
    OutOfRange { command: String, value: f64 },
}

/// One parsed control message. Lives for a single dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub target: String,
    pub command: String,
    pub value: Option<Value>,
}

#[derive(Debug)]
pub enum Outcome {
    /// Command executed and its status was published.
    Reported,
    /// Command executed but the status publish failed.
    ReportFailed(TransportError),
    Rejected(Rejection),
    ExecutionFailed(DriverError),
    /// Arrived after shutdown began; never executed.
    Dropped,
}

// ---------------------------------------------------------------------------
// Parsing and validation
// ---------------------------------------------------------------------------

impl ControlMessage {
    pub fn parse(namespace: &str, message: &InboundMessage) -> Result<Self, Rejection> {
        let bad = || Rejection::BadTopic(message.topic.clone());
        let segments: Vec<&str> = message.topic.split('/').collect();
        if segments.len() < 4 || segments[0] != namespace || segments[1] != CONTROL_SEGMENT {
            return Err(bad());
        }
        let (target, command) = (segments[2], segments[3]);
        if target.is_empty() || command.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            target: target.to_string(),
            command: command.to_string(),
            value: extract_value(command, &message.payload),
        })
    }
}

/// Pull the command argument out of a payload: the object key `value` or
/// the command's own name, or the scalar itself.
fn extract_value(command: &str, payload: &Payload) -> Option<Value> {
    match payload {
        Payload::Empty => None,
        Payload::Scalar(s) => Some(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))),
        Payload::Object(map) => map.get("value").or_else(|| map.get(command)).cloned(),
    }
}

fn level_from(command: &str, value: Option<&Value>) -> Result<u8, Rejection> {
    let value = value.ok_or_else(|| Rejection::MissingValue {
        command: command.to_string(),
    })?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| Rejection::NotNumeric {
        command: command.to_string(),
        value: value.clone(),
    })?;
    if !LEVEL_RANGE.contains(&number) {
        return Err(Rejection::OutOfRange {
            command: command.to_string(),
            value: number,
        });
    }
    Ok(number as u8)
}

/// Check a message against the registry and the target's vocabulary.
pub fn validate<'r>(
    registry: &'r DeviceRegistry,
    message: &ControlMessage,
) -> Result<(&'r ActuatorSlot, Command), Rejection> {
    let slot = registry
        .actuator(&message.target)
        .ok_or_else(|| Rejection::UnknownTarget(message.target.clone()))?;
    let command = match slot.kind.resolve(&message.command) {
        Some(CommandKind::On) => Command::On,
        Some(CommandKind::Off) => Command::Off,
        Some(CommandKind::Level) => Command::Level(level_from(&message.command, message.value.as_ref())?),
        None => {
            return Err(Rejection::UnknownCommand {
                kind: slot.kind,
                command: message.command.clone(),
            })
        }
    };
    Ok((slot, command))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    registry: Arc<DeviceRegistry>,
    publisher: Publisher,
    namespace: String,
    driver_timeout: Duration,
    shutdown: CancellationToken,
    state: RouterState,
}

impl Router {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        publisher: Publisher,
        namespace: &str,
        driver_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            publisher,
            namespace: namespace.to_string(),
            driver_timeout,
            shutdown,
            state: RouterState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> RouterState {
        self.state
    }

    fn enter(&mut self, state: RouterState) {
        tracing::trace!(from = ?self.state, to = ?state, "router state");
        self.state = state;
    }

    fn finish(&mut self, outcome: Outcome) -> Outcome {
        self.enter(RouterState::Idle);
        outcome
    }

    /// Handle one inbound message to completion.
    pub async fn dispatch(&mut self, message: InboundMessage) -> Outcome {
        if self.shutdown.is_cancelled() {
            tracing::warn!(topic = %message.topic, "shutting down, command dropped");
            return Outcome::Dropped;
        }

        self.enter(RouterState::Parsing);
        let parsed = ControlMessage::parse(&self.namespace, &message).and_then(|msg| {
            let (slot, command) = validate(&self.registry, &msg)?;
            Ok((msg, Arc::clone(&slot.driver), slot.is_initialized(), command))
        });
        let (msg, driver, initialized, command) = match parsed {
            Ok(v) => v,
            Err(reason) => {
                tracing::warn!(topic = %message.topic, "control message rejected: {reason}");
                return self.finish(Outcome::Rejected(reason));
            }
        };
        let target = msg.target.as_str();
        self.enter(RouterState::Validated);

        self.enter(RouterState::Dispatching);
        tracing::info!(%target, %command, "executing command");
        let result = if initialized {
            call_bounded(&driver, self.driver_timeout, move |d| {
                d.execute(command)?;
                Ok(d.state())
            })
            .await
        } else {
            Err(DriverError::NotInitialized)
        };
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(%target, command = %msg.command, "command failed: {e}");
                return self.finish(Outcome::ExecutionFailed(e));
            }
        };

        self.enter(RouterState::Reporting);
        match self.publisher.publish_status(target, &state).await {
            Ok(()) => self.finish(Outcome::Reported),
            Err(e) => {
                tracing::warn!(%target, "status publish failed: {e}");
                self.finish(Outcome::ReportFailed(e))
            }
        }
    }

    /// Drain the command queue until shutdown. Anything still queued when
    /// shutdown begins is dropped, not executed.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<InboundMessage>) {
        tracing::info!("command router started");
        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = inbox.recv() => match next {
                    Some(message) => {
                        let outcome = self.dispatch(message).await;
                        tracing::debug!(?outcome, "dispatch finished");
                    }
                    None => break,
                },
            }
        }

        inbox.close();
        let mut dropped = 0usize;
        while let Ok(message) = inbox.try_recv() {
            tracing::warn!(topic = %message.topic, "shutting down, command dropped");
            dropped += 1;
        }
        tracing::info!(dropped, "command router stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
