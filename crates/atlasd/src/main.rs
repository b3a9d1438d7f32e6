use anyhow::{Context, Result};
use atlas_core::{AttendanceService, NotificationDispatcher};
use atlas_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod hooks;

use config::{BusKind, Config};
use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};
use hooks::{CommandEncoder, CommandNotifier, HelperCommand, LogNotifier};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("atlasd starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        bus = ?config.bus,
        tolerance = config.tolerance,
        cooldown_minutes = config.cooldown_minutes,
        "configuration loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );

    let runtime = tokio::runtime::Handle::current();
    let helper_timeout = config.helper_timeout();

    let dispatcher = match config.notify_command.as_deref().and_then(HelperCommand::parse) {
        Some(command) => {
            tracing::info!(program = command.program(), "notifications via helper");
            let notifier =
                CommandNotifier::new(command.with_timeout(helper_timeout), runtime.clone());
            NotificationDispatcher::spawn(notifier, config.notify_queue)?
        }
        None => {
            tracing::warn!("ATLAS_NOTIFY_COMMAND not set; notifications will only be logged");
            NotificationDispatcher::spawn(LogNotifier, config.notify_queue)?
        }
    };

    let service = AttendanceService::open(
        config.policy(),
        store.clone(),
        store.clone(),
        store,
        Some(dispatcher),
    )?;

    let encoder = HelperCommand::parse(&config.encoder_command)
        .context("ATLAS_ENCODER_COMMAND is empty")?;
    tracing::info!(program = encoder.program(), "face encoder configured");
    let engine = engine::spawn_engine(CommandEncoder::new(
        encoder.with_timeout(helper_timeout),
        runtime.clone(),
    ))?;

    let iface = AttendanceInterface::new(Arc::new(service), engine, runtime);
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "atlasd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("atlasd shutting down");

    Ok(())
}
