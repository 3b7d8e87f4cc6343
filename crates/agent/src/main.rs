mod config;
mod driver;
mod lifecycle;
mod model;
mod poller;
mod publisher;
mod registry;
mod router;
#[cfg(test)]
mod testing;
mod transport;

use anyhow::{Context, Result};
use std::{env, sync::Arc};
use tracing_subscriber::EnvFilter;

use lifecycle::Agent;
use registry::DeviceRegistry;
use transport::{MqttTransport, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "agent.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Drivers ─────────────────────────────────────────────────────
    // Driver init touches GPIO/I2C and may sleep, keep it off the runtime.
    let registry_cfg = cfg.clone();
    let registry = tokio::task::spawn_blocking(move || DeviceRegistry::from_config(&registry_cfg))
        .await
        .context("driver initialization panicked")??;
    let registry = Arc::new(registry);

    // ── MQTT ────────────────────────────────────────────────────────
    let transport: Arc<dyn Transport> =
        Arc::new(MqttTransport::from_config(&cfg.broker, &cfg.agent.device_id)?);

    let agent = Agent::start(&cfg, registry, transport).await?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    agent.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
