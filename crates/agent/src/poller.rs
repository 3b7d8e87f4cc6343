//! Periodic sensor sampling.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::driver::{call_bounded, DriverError};
use crate::model::ReadingBatch;
use crate::publisher::{PublishReport, Publisher};
use crate::registry::DeviceRegistry;

/// Wait after a tick that failed unexpectedly, before trying again.
pub const TICK_FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// What one tick did.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub batch: ReadingBatch,
    /// Sensors that failed, timed out, or had nothing to report.
    pub skipped: Vec<String>,
    /// `None` when the batch was empty and nothing was published.
    pub published: Option<PublishReport>,
}

#[derive(Clone)]
pub struct Poller {
    registry: Arc<DeviceRegistry>,
    publisher: Publisher,
    interval: Duration,
    driver_timeout: Duration,
}

impl Poller {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        publisher: Publisher,
        interval: Duration,
        driver_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            publisher,
            interval,
            driver_timeout,
        }
    }

    /// Read every sensor once and publish whatever succeeded.
    pub async fn tick(&self) -> TickReport {
        let mut batch = ReadingBatch::new();
        let mut skipped = Vec::new();

        for slot in self.registry.sensors() {
            if !slot.is_initialized() {
                skipped.push(slot.name.clone());
                continue;
            }
            let read = call_bounded(&slot.driver, self.driver_timeout, |d| {
                let readings = d.read()?;
                if readings.is_empty() {
                    return Err(DriverError::Unavailable);
                }
                Ok(readings)
            });
            match read.await {
                Ok(readings) => batch.insert(slot.name.clone(), readings),
                Err(e) => {
                    tracing::warn!(sensor = %slot.name, "sensor read skipped: {e}");
                    skipped.push(slot.name.clone());
                }
            }
        }

        if batch.is_empty() {
            tracing::debug!(skipped = skipped.len(), "no readings this tick");
            return TickReport {
                batch,
                skipped,
                published: None,
            };
        }

        let published = self.publisher.publish_readings(&batch).await;
        tracing::info!(
            sensors = batch.len(),
            skipped = skipped.len(),
            sent = published.sent,
            failed = published.failed,
            "readings published"
        );
        TickReport {
            batch,
            skipped,
            published: Some(published),
        }
    }

    /// Tick until `cancel` fires. A tick that dies unexpectedly is logged
    /// and followed by a longer pause.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval = ?self.interval, "polling loop started");
        loop {
            let poller = self.clone();
            let mut tick = TickTask(tokio::spawn(async move { poller.tick().await }));
            let pause = self.pause_after((&mut tick.0).await);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(pause) => {}
            }
        }
        tracing::info!("polling loop stopped");
    }

    fn pause_after(&self, outcome: Result<TickReport, JoinError>) -> Duration {
        match outcome {
            Ok(report) => {
                if report.published.is_some_and(|p| p.sent == 0) {
                    tracing::warn!("no reading reached the broker this tick");
                }
                self.interval
            }
            Err(e) => {
                tracing::error!("polling tick failed: {e}");
                TICK_FAILURE_BACKOFF
            }
        }
    }
}

/// Aborts the tick when the loop itself is dropped mid-tick.
struct TickTask(JoinHandle<TickReport>);

impl Drop for TickTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActuatorKind, MetricKind};
    use crate::registry::RegistryBuilder;
    use crate::testing::{CountingActuator, FakeTransport, ScriptedSensor, SensorScript};
    use std::sync::atomic::Ordering;

    fn poller(sensors: Vec<(&str, ScriptedSensor)>) -> (Arc<FakeTransport>, Poller) {
        let mut builder = RegistryBuilder::new();
        for (name, sensor) in sensors {
            builder.register_sensor(name, Box::new(sensor));
        }
        let (fan, _) = CountingActuator::new(ActuatorKind::Fan);
        builder.register_actuator("fan", Box::new(fan));
        let registry = Arc::new(builder.finish().unwrap());

        let fake = Arc::new(FakeTransport::connected());
        let publisher = Publisher::new(fake.clone(), "farm", "pi-001");
        let poller = Poller::new(
            registry,
            publisher,
            Duration::from_millis(20),
            Duration::from_millis(100),
        );
        (fake, poller)
    }

    fn dht22() -> ScriptedSensor {
        ScriptedSensor::new(SensorScript::Ok(vec![
            (MetricKind::Temperature, 23.1),
            (MetricKind::Humidity, 58.0),
        ]))
    }

    #[tokio::test]
    async fn healthy_tick_publishes_all_readings() {
        let (fake, poller) = poller(vec![("dht22", dht22())]);
        let report = poller.tick().await;
        assert_eq!(report.batch.len(), 1);
        assert_eq!(report.published, Some(PublishReport { sent: 2, failed: 0 }));
        assert_eq!(fake.published_to("farm/sensor/temperature/data").len(), 1);
        assert_eq!(fake.published_to("farm/sensor/humidity/data").len(), 1);
    }

    #[tokio::test]
    async fn failing_sensors_are_left_out_of_the_batch() {
        let (_fake, poller) = poller(vec![
            ("dht22", dht22()),
            ("light", ScriptedSensor::new(SensorScript::Fail)),
            ("soil", ScriptedSensor::new(SensorScript::Panic)),
            ("uv", ScriptedSensor::new(SensorScript::Unavailable)),
        ]);
        let report = poller.tick().await;
        assert_eq!(report.batch.len(), 1);
        assert!(report.batch.contains("dht22"));
        assert_eq!(report.skipped.len(), 3);
    }

    #[tokio::test]
    async fn light_timeout_still_publishes_dht22_batch() {
        let (fake, poller) = poller(vec![
            ("dht22", dht22()),
            ("light", ScriptedSensor::new(SensorScript::Hang(Duration::from_millis(500)))),
        ]);
        let report = poller.tick().await;
        assert_eq!(report.batch.len(), 1);
        assert!(report.batch.contains("dht22"));
        assert!(!report.batch.contains("light"));
        assert_eq!(report.skipped, vec!["light".to_string()]);
        assert!(fake.published_to("farm/sensor/light/data").is_empty());
        assert_eq!(fake.published_to("farm/sensor/temperature/data").len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_is_not_published() {
        let (fake, poller) = poller(vec![("light", ScriptedSensor::new(SensorScript::Fail))]);
        let report = poller.tick().await;
        assert!(report.batch.is_empty());
        assert!(report.published.is_none());
        assert!(fake.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_tick() {
        let (fake, poller) = poller(vec![("dht22", dht22())]);
        fake.set_fail_publish(true);
        let report = poller.tick().await;
        assert_eq!(report.published, Some(PublishReport { sent: 0, failed: 2 }));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let sensor = dht22();
        let reads = sensor.read_counter();
        let (_fake, poller) = poller(vec![("dht22", sensor)]);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(70)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert!(reads.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn failed_tick_backs_off_and_loop_survives() {
        let (fake, poller) = poller(vec![("dht22", dht22())]);
        fake.set_panic_publish(true);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();

        let failed: Result<TickReport, JoinError> =
            tokio::spawn(async { panic!("tick blew up") }).await;
        assert_eq!(poller.pause_after(failed), TICK_FAILURE_BACKOFF);
    }

    #[tokio::test]
    async fn aborted_loop_abandons_the_tick_in_flight() {
        let fast = dht22();
        let fast_reads = fast.read_counter();
        let (fake, poller) = poller(vec![
            ("a_slow", ScriptedSensor::new(SensorScript::Hang(Duration::from_millis(200)))),
            ("b_fast", fast),
        ]);
        let handle = tokio::spawn(poller.run(CancellationToken::new()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fast_reads.load(Ordering::SeqCst), 0);
        assert!(fake.published().is_empty());
    }
}
