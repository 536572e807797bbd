use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.facematch.Facematch1";
const OBJECT_PATH: &str = "/org/facematch/Facematch1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematchd starting");

    let config = config::Config::from_env();
    tracing::info!(
        gallery = %config.gallery_dir.display(),
        cascade = %config.cascade_path.display(),
        strict = config.settings.thresholds.strict,
        moderate = config.settings.thresholds.moderate,
        bus = ?config.bus,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(
        config.gallery_dir.clone(),
        config.cascade_path.clone(),
        config.settings,
    )
    .context("failed to start recognition engine")?;

    let service = dbus_interface::FacematchService::new(
        engine,
        config.gallery_dir.clone(),
        config.cascade_path.clone(),
    );

    let builder = match config.bus {
        config::Bus::Session => zbus::connection::Builder::session()?,
        config::Bus::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "facematchd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facematchd shutting down");

    Ok(())
}
