//! Startup and shutdown ordering.
//!
//! Startup: registry (already built) → transport connect → command router
//! → control subscription → polling loop. Shutdown stops the polling loop
//! and the router together, then leaves every actuator off before the
//! drivers are released.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::driver::call_bounded;
use crate::model::Command;
use crate::poller::Poller;
use crate::publisher::Publisher;
use crate::registry::DeviceRegistry;
use crate::router::Router;
use crate::transport::Transport;

/// Inbound control messages waiting for the router.
const COMMAND_QUEUE_CAPACITY: usize = 32;

pub struct Agent {
    registry: Arc<DeviceRegistry>,
    transport: Arc<dyn Transport>,
    poller_cancel: CancellationToken,
    router_cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    driver_timeout: Duration,
    shutdown_timeout: Duration,
    span: tracing::Span,
}

impl Agent {
    /// Connect and start the background tasks. Fails only when the broker
    /// connection cannot be established.
    pub async fn start(
        config: &Config,
        registry: Arc<DeviceRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let span = tracing::info_span!("agent", device_id = %config.agent.device_id);
        let namespace = config.agent.namespace.as_str();

        async {
            transport
                .connect()
                .await
                .context("failed to connect to broker")?;

            let publisher = Publisher::new(Arc::clone(&transport), namespace, &config.agent.device_id);

            // Router first so nothing delivered after subscribing is lost.
            let router_cancel = CancellationToken::new();
            let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
            let router = Router::new(
                Arc::clone(&registry),
                publisher.clone(),
                namespace,
                config.agent.driver_timeout(),
                router_cancel.clone(),
            );
            let router_task = tokio::spawn(router.run(rx).in_current_span());

            let filter = format!("{namespace}/control/#");
            if let Err(e) = transport.subscribe(&filter, tx).await {
                tracing::error!(%filter, "control subscription failed: {e}");
            }

            let poller_cancel = CancellationToken::new();
            let poller = Poller::new(
                Arc::clone(&registry),
                publisher,
                config.agent.poll_interval(),
                config.agent.driver_timeout(),
            );
            let poller_task = tokio::spawn(poller.run(poller_cancel.clone()).in_current_span());

            tracing::info!("agent started");
            Ok::<_, anyhow::Error>(Self {
                registry,
                transport,
                poller_cancel,
                router_cancel,
                poller: Mutex::new(Some(poller_task)),
                router: Mutex::new(Some(router_task)),
                stopped: AtomicBool::new(false),
                driver_timeout: config.agent.driver_timeout(),
                shutdown_timeout: config.agent.shutdown_timeout(),
                span: tracing::Span::current(),
            })
        }
        .instrument(span)
        .await
    }

    /// Stop everything in order. Safe to call more than once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown().instrument(self.span.clone()).await
    }

    async fn shutdown(&self) {
        tracing::info!("agent stopping");

        // No new dispatch starts from here on; one already running finishes.
        self.poller_cancel.cancel();
        self.router_cancel.cancel();

        let poller = self.poller.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.join("polling loop", poller).await;

        let router = self.router.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.join("command router", router).await;

        for slot in self.registry.actuators().filter(|s| s.is_initialized()) {
            match call_bounded(&slot.driver, self.driver_timeout, |d| d.execute(Command::Off)).await {
                Ok(()) => tracing::info!(actuator = %slot.name, "switched off"),
                Err(e) => tracing::error!(actuator = %slot.name, "failed to switch off: {e}"),
            }
        }

        self.transport.disconnect().await;

        let registry = Arc::clone(&self.registry);
        if let Err(e) = tokio::task::spawn_blocking(move || registry.release_all()).await {
            tracing::error!("driver release failed: {e}");
        }
        tracing::info!("agent stopped");
    }

    async fn join(&self, what: &str, handle: Option<JoinHandle<()>>) {
        let Some(mut handle) = handle else {
            return;
        };
        match timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{what} ended abnormally: {e}"),
            Err(_) => {
                tracing::warn!("{what} did not stop within {:?}, aborting", self.shutdown_timeout);
                handle.abort();
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
