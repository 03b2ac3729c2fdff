use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};

const BUS_NAME: &str = "org.facegate.Registry1";
const OBJECT_PATH: &str = "/org/facegate/Registry1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load().context("invalid configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        backend = %config.profile.backend(),
        metric = %config.profile.metric(),
        threshold = config.profile.threshold(),
        refresh_on_verify = config.pipeline.refresh_on_verify,
        "configuration loaded"
    );

    let registry = facegate_store::SqliteRegistry::open(&config.db_path, config.profile.backend())
        .with_context(|| format!("failed to open registry {}", config.db_path.display()))?;
    let pipeline = engine::load_pipeline(&config).context("failed to load models")?;
    let engine = engine::spawn_engine(pipeline, registry)?;

    let service = dbus_interface::RegistryService::new(
        engine,
        config.profile,
        config.return_embedding,
        Duration::from_secs(config.request_timeout_secs),
    );

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
