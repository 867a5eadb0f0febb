//! lbsync load-balancer controller daemon.
//!
//! This service:
//! - Opens a session with the configured load-balancer backend
//! - Tails the routing-update feed
//! - Applies each update as pool/route/monitor changes
//! - Acknowledges an update only after the backend confirmed it

use anyhow::{Context, Result};
use lbsync_controller::drivers::{ApplianceBackend, LbaasBackend, MemoryBackend};
use lbsync_controller::{
    Backend, Config, ConsumerSettings, Controller, ControllerSettings, Credentials, DriverConfig,
    HttpEventSource, RoutingConsumer,
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LBSYNC_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting lbsync load-balancer controller");
    info!(
        driver = config.driver.name(),
        events_url = %config.events_url,
        virtual_endpoint = ?config.virtual_endpoint,
        create_routes = config.create_routes,
        monitor = ?config.monitor.as_ref().map(|m| m.name.as_str()),
        once = config.once,
        "Configuration loaded"
    );

    match &config.driver {
        DriverConfig::Appliance(appliance) => {
            let backend = ApplianceBackend::new(appliance, config.virtual_endpoint.clone())?;
            run(backend, Some(appliance.credentials.clone()), &config).await
        }
        DriverConfig::Lbaas(lbaas) => {
            let backend = LbaasBackend::new(lbaas)?;
            run(backend, Some(lbaas.credentials.clone()), &config).await
        }
        DriverConfig::Memory => run(MemoryBackend::new(), None, &config).await,
    }
}

async fn run<B>(backend: B, credentials: Option<Credentials>, config: &Config) -> Result<()>
where
    B: Backend + 'static,
{
    let mut controller = Controller::new(
        backend,
        ControllerSettings {
            virtual_endpoint: config.virtual_endpoint.clone(),
            job_budget: config.job_budget,
        },
    );
    if let Some(credentials) = &credentials {
        controller
            .authenticate(credentials)
            .await
            .context("Failed to authenticate with the load-balancer backend")?;
    }

    let source = HttpEventSource::from_config(config)?;
    let mut consumer = RoutingConsumer::new(controller, source, ConsumerSettings::from_config(config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    let joined = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            (&mut worker).await
        }
        joined = &mut worker => joined,
    };

    joined.context("Routing consumer task panicked")??;
    info!("Controller shutdown complete");
    Ok(())
}
