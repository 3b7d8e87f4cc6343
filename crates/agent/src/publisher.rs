//! Outbound payload formatting for sensor readings and actuator status.

use serde::Serialize;
use std::sync::Arc;

use crate::model::{now_millis, unix_millis, ActuatorState, ReadingBatch};
use crate::transport::{Transport, TransportError};

#[derive(Debug, Serialize)]
struct ReadingPayload<'a> {
    value: f64,
    unit: &'a str,
    device_id: &'a str,
    timestamp_ms: i64,
}

#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    status: &'a ActuatorState,
    device_id: &'a str,
    timestamp_ms: i64,
}

/// Outcome of publishing one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub sent: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
    namespace: String,
    device_id: String,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, namespace: &str, device_id: &str) -> Self {
        Self {
            transport,
            namespace: namespace.to_string(),
            device_id: device_id.to_string(),
        }
    }

    pub fn reading_topic(&self, metric: &str) -> String {
        format!("{}/sensor/{metric}/data", self.namespace)
    }

    pub fn status_topic(&self, target: &str) -> String {
        format!("{}/status/{target}", self.namespace)
    }

    /// Publish each reading on its metric topic. Failures are logged and
    /// counted; they never stop the rest of the batch.
    pub async fn publish_readings(&self, batch: &ReadingBatch) -> PublishReport {
        let mut report = PublishReport::default();
        for reading in batch.readings() {
            let topic = self.reading_topic(reading.metric.as_str());
            let body = ReadingPayload {
                value: reading.value,
                unit: reading.unit,
                device_id: &self.device_id,
                timestamp_ms: unix_millis(reading.captured_at),
            };
            let result = match serde_json::to_vec(&body) {
                Ok(bytes) => self.transport.publish(&topic, bytes).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {
                    report.sent += 1;
                    tracing::debug!(%topic, sensor = %reading.sensor_name, value = reading.value, "reading published");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%topic, sensor = %reading.sensor_name, "reading publish failed: {e}");
                }
            }
        }
        report
    }

    pub async fn publish_status(&self, target: &str, state: &ActuatorState) -> Result<(), TransportError> {
        let topic = self.status_topic(target);
        let body = StatusPayload {
            status: state,
            device_id: &self.device_id,
            timestamp_ms: now_millis(),
        };
        let bytes = serde_json::to_vec(&body)?;
        self.transport.publish(&topic, bytes).await?;
        tracing::info!(%topic, %target, "status published");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
