mod args;
mod ble;

use std::process::ExitCode;

use anyhow::{Context as _, Result};
use args::Args;
use clap::Parser as _;
use sensor_collector::{
    collector::{CollectionPolicy, Collector},
    config::{Normalized, RawConfig},
    db::Database,
    retention::Retention,
    session::DeviceSession,
    supervisor,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use crate::ble::BleTransport;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!("{e:#}");
        return ExitCode::from(1);
    }

    ExitCode::from(0)
}

async fn run() -> Result<()> {
    let args = Args::parse();

    info!("starting sensor data collector");

    let Normalized { settings, warnings } = RawConfig::load(&args.config)
        .and_then(RawConfig::normalize)
        .with_context(|| format!("invalid configuration: {}", args.config.display()))?;

    for warning in &warnings {
        warn!("{warning}");
    }

    info!(
        device = %settings.device,
        poll_interval_secs = settings.poll_interval.as_secs(),
        retention_days = settings.retention_window.num_days(),
        "configuration loaded"
    );

    let database = Database::connect(&args.database_url)
        .await
        .with_context(|| format!("failed to open database: {}", args.database_url))?;

    database
        .initialize()
        .await
        .context("failed to set up database")?;

    let stored = database.count().await.context("failed to count readings")?;
    info!(stored, "database setup complete");

    let transport = BleTransport::new()
        .await
        .context("failed to initialize Bluetooth transport")?;

    let session = DeviceSession::new(transport, settings.device, args.timezone);
    let collector = Collector::new(
        session,
        database.clone(),
        CollectionPolicy::new(settings.poll_interval),
    );
    let retention = Retention::new(database.clone(), settings.retention_window);

    supervisor::run(collector, retention, shutdown_signal()).await?;

    database.close().await;
    info!("interrupted, exiting");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
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
