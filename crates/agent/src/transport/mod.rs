//! Broker transport capability and the inbound message shape.

mod mqtt;

pub use mqtt::MqttTransport;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("mqtt client error: {0}")]
    Client(String),
    #[error("tls setup failed: {0}")]
    Tls(String),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// Inbound payload after transport-level parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    /// Anything that is not a JSON object, trimmed.
    Scalar(String),
    Object(Map<String, Value>),
}

impl Payload {
    /// A payload starting with `{` must be a JSON object; everything else is
    /// taken as a scalar string.
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::Empty);
        }
        if text.starts_with('{') {
            return serde_json::from_str(text).map(Self::Object);
        }
        Ok(Self::Scalar(text.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Payload,
}

/// Where the transport delivers messages for a subscription.
pub type MessageHandler = mpsc::Sender<InboundMessage>;

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    /// Subscribe at QoS 1. Matching messages go to `handler` without ever
    /// blocking the transport; a full handler queue drops the message.
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// MQTT topic filter match supporting `+` and a trailing `#`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fs), Some(ts)) if fs == ts => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Hand a message to a subscription without waiting on it.
pub(crate) fn forward(handler: &MessageHandler, message: InboundMessage) {
    match handler.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(m)) => {
            tracing::warn!(topic = %m.topic, "command queue full, dropping message");
        }
        Err(mpsc::error::TrySendError::Closed(m)) => {
            tracing::debug!(topic = %m.topic, "command queue closed, dropping message");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
