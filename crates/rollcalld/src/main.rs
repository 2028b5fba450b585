use anyhow::{Context, Result};
use rollcall_core::AttendanceRecorder;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod ledger;
mod store;
mod workflow;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = config::Config::from_env();
    tracing::info!(
        camera = %config.camera_device,
        width = config.camera_width,
        height = config.camera_height,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        threshold = config.distance_threshold,
        "configuration loaded"
    );

    let settings = config::load_settings(&config.settings_path)?;
    tracing::info!(
        check_in = %settings.check_in_time,
        late = %settings.late_time,
        check_out = %settings.check_out_time,
        "school day settings"
    );

    let store = store::SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening database {}", config.db_path.display()))?;
    let recorder = AttendanceRecorder::new(store, settings, config.feed_len);
    let ledger = ledger::spawn_ledger(recorder).context("failed to spawn ledger thread")?;

    let service = dbus_interface::AttendanceService::new(config.clone(), ledger);
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the D-Bus"))?;

    tracing::info!(
        bus = if config.system_bus { "system" } else { "session" },
        name = BUS_NAME,
        "rollcalld ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    let iface = connection
        .object_server()
        .interface::<_, dbus_interface::AttendanceService>(OBJECT_PATH)
        .await?;
    iface.get().await.shutdown().await;

    Ok(())
}
