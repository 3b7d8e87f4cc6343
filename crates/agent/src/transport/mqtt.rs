//! MQTT transport on rumqttc, with optional mutual TLS (AWS IoT style).

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport as Wire,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::{forward, topic_matches, InboundMessage, MessageHandler, Payload, Transport, TransportError};
use crate::config::BrokerConfig;

/// Pause between failed event-loop polls; the next poll reconnects.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Capacity of the request channel between `AsyncClient` and the event loop.
const REQUEST_CAPACITY: usize = 20;

struct Route {
    filter: String,
    handler: MessageHandler,
}

type Routes = Arc<Mutex<Vec<Route>>>;

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: tokio::sync::Mutex<Option<EventLoop>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    routes: Routes,
    connected: Arc<AtomicBool>,
    connect_timeout: Duration,
    publish_timeout: Duration,
}

impl MqttTransport {
    /// Build the client from config. Reads the TLS material up front so a
    /// missing certificate fails startup instead of the first connect.
    pub fn from_config(broker: &BrokerConfig, device_id: &str) -> Result<Self, TransportError> {
        let client_id = broker.client_id.as_deref().unwrap_or(device_id);
        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port());
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_sec));

        if let Some(tls) = &broker.tls {
            let ca = read_pem(&tls.ca_path)?;
            let cert = read_pem(&tls.cert_path)?;
            let key = read_pem(&tls.key_path)?;
            options.set_transport(Wire::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        tracing::info!(
            host = %broker.host,
            port = broker.port(),
            client_id,
            tls = broker.tls.is_some(),
            "mqtt transport configured"
        );
        Ok(Self {
            client,
            eventloop: tokio::sync::Mutex::new(Some(eventloop)),
            task: tokio::sync::Mutex::new(None),
            routes: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(false)),
            connect_timeout: Duration::from_secs(broker.connect_timeout_sec),
            publish_timeout: Duration::from_secs(broker.publish_timeout_sec),
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|e| TransportError::Tls(format!("{}: {e}", path.display())))
}

/// Poll until the broker accepts the session.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Client(format!("broker refused: {code:?}"))),
                };
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Client(e.to_string())),
        }
    }
}

/// Parse and hand a publish to every matching subscription.
fn route(routes: &Mutex<Vec<Route>>, topic: &str, raw: &[u8]) {
    let payload = match Payload::parse(raw) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(%topic, "malformed json payload dropped: {e}");
            return;
        }
    };
    let routes = routes.lock().unwrap_or_else(|p| p.into_inner());
    let mut matched = false;
    for r in routes.iter().filter(|r| topic_matches(&r.filter, topic)) {
        matched = true;
        forward(
            &r.handler,
            InboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            },
        );
    }
    if !matched {
        tracing::debug!(%topic, "unhandled topic");
    }
}

fn resubscribe(client: &AsyncClient, routes: &Mutex<Vec<Route>>) {
    let routes = routes.lock().unwrap_or_else(|p| p.into_inner());
    for r in routes.iter() {
        match client.try_subscribe(r.filter.as_str(), QoS::AtLeastOnce) {
            Ok(()) => tracing::info!(filter = %r.filter, "resubscribed"),
            Err(e) => tracing::error!(filter = %r.filter, "resubscribe failed: {e}"),
        }
    }
}

async fn drive(mut eventloop: EventLoop, client: AsyncClient, routes: Routes, connected: Arc<AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => route(&routes, &p.topic, &p.payload),
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected.store(true, Ordering::Release);
                tracing::info!(session_present = ack.session_present, "mqtt connected");
                if !ack.session_present {
                    resubscribe(&client, &routes);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, "subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                connected.store(false, Ordering::Release);
                tracing::warn!("broker sent disconnect");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::Release);
                tracing::info!("mqtt disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected.swap(false, Ordering::AcqRel) {
                    tracing::warn!("mqtt connection lost: {e}. reconnecting...");
                } else {
                    tracing::debug!("mqtt reconnect failed: {e}");
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self.eventloop.lock().await;
        let Some(eventloop) = slot.as_mut() else {
            return Err(TransportError::Client("event loop already running".into()));
        };
        timeout(self.connect_timeout, await_connack(eventloop))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))??;

        let Some(eventloop) = slot.take() else {
            return Err(TransportError::NotConnected);
        };
        self.connected.store(true, Ordering::Release);
        let handle = tokio::spawn(drive(
            eventloop,
            self.client.clone(),
            Arc::clone(&self.routes),
            Arc::clone(&self.connected),
        ));
        *self.task.lock().await = Some(handle);
        tracing::info!("mqtt connected");
        Ok(())
    }

    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Route {
                filter: filter.to_string(),
                handler,
            });
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Client(e.to_string()))?;
        tracing::info!(%filter, "subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        timeout(
            self.publish_timeout,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.publish_timeout))?
        .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn disconnect(&self) {
        let Some(mut handle) = self.task.lock().await.take() else {
            return;
        };
        if let Err(e) = self.client.try_disconnect() {
            tracing::warn!("mqtt disconnect request failed: {e}");
        }
        if timeout(self.connect_timeout, &mut handle).await.is_err() {
            tracing::warn!("mqtt event loop did not stop in time, aborting it");
            handle.abort();
        }
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
