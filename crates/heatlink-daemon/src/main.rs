//! heatlink daemon entry point.
//!
//! Bootstrap order matters: persisted setpoints are restored before any
//! surface can observe the state, the startup valve sweep runs before the
//! regulators start, and the command dispatcher is up before the Modbus
//! slave accepts its first write.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use heatlink_api::ApiState;
use heatlink_control::{startup_valve_sweep, CommandDispatcher, RegulatorSet};
use heatlink_core::{
    Clock, CommandBus, DeviceRegistry, Mutation, StateStore, SystemClock, TelemetryPublisher,
};
use heatlink_modbus::{ModbusServer, Reflector, RegisterPlane};
use heatlink_storage::{RedbSettingsStore, SettingsStore, SETPOINT_KEY};
use heatlink_telemetry::{spawn_health_task, BrokerSet};

use config::DaemonConfig;

#[derive(Parser)]
#[command(
    name = "heatlink",
    version,
    about = "Heating-control daemon bridging telemetry-attached controllers to Modbus TCP SCADA"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "heatlink.toml")]
    config: PathBuf,

    /// Tracing filter, e.g. `info` or `heatlink_modbus=debug,info`.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_filter)),
        )
        .init();

    let config = DaemonConfig::load(&cli.config)?;
    run(config).await
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let registry = Arc::new(DeviceRegistry::new(config.devices)?);
    info!(devices = registry.len(), "device registry loaded");

    let settings: Arc<dyn SettingsStore> = Arc::new(
        RedbSettingsStore::open(&config.storage.path).with_context(|| {
            format!("opening settings store {}", config.storage.path.display())
        })?,
    );

    let store = Arc::new(StateStore::new(registry.clone()));
    restore_setpoints(&store, settings.as_ref()).await;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let running = Arc::new(AtomicBool::new(true));
    let (commands, command_rx) = CommandBus::channel(256);

    // Telemetry: broker links, ingress routing, staleness scan.
    let publisher: Arc<dyn TelemetryPublisher> = Arc::new(BrokerSet::connect(
        &config.brokers,
        store.clone(),
        clock.clone(),
        running.clone(),
    ));
    let health_task = spawn_health_task(store.clone(), clock.clone(), running.clone());

    // Valve positions are asserted once before closed-loop control starts.
    startup_valve_sweep(&store, &publisher, &clock).await;

    let dispatcher =
        CommandDispatcher::new(store.clone(), publisher.clone(), settings.clone());
    let dispatcher_task = tokio::spawn(dispatcher.run(command_rx));

    let mut regulators = RegulatorSet::new(
        store.clone(),
        publisher.clone(),
        commands.clone(),
        clock.clone(),
    );
    regulators.start();

    // Modbus plane, reflector and slave.
    let plane = Arc::new(RegisterPlane::new(registry.max_unit_id() as usize));
    let reflector_task =
        Reflector::new(plane.clone(), store.clone(), clock.clone()).spawn(running.clone());

    let modbus_addr = format!("{}:{}", config.modbus.bind, config.modbus.port);
    let modbus_listener = TcpListener::bind(&modbus_addr)
        .await
        .with_context(|| format!("failed to bind Modbus listener on {modbus_addr}"))?;
    let modbus = ModbusServer::new(
        plane,
        store.clone(),
        commands.clone(),
        Duration::from_secs(config.modbus.idle_timeout_secs),
    );
    let modbus_task = tokio::spawn(modbus.serve(modbus_listener));

    // HTTP/WS facade.
    let api_task = if config.api.enabled {
        let listener = TcpListener::bind(&config.api.bind)
            .await
            .with_context(|| format!("failed to bind API listener on {}", config.api.bind))?;
        info!(bind = %config.api.bind, "http facade listening");
        let app = heatlink_api::router(ApiState {
            store: store.clone(),
            commands: commands.clone(),
        });
        Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "http facade terminated");
            }
        }))
    } else {
        None
    };

    info!("heatlink daemon running");
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown requested");

    running.store(false, Ordering::SeqCst);
    regulators.stop();
    regulators.join().await;

    modbus_task.abort();
    if let Some(task) = api_task {
        task.abort();
    }
    reflector_task.abort();
    health_task.abort();

    // With the servers gone the remaining bus handles drop and the
    // dispatcher drains out.
    drop(commands);
    let _ = tokio::time::timeout(Duration::from_secs(2), dispatcher_task).await;

    info!("heatlink daemon stopped");
    Ok(())
}

/// Overwrite default setpoints with persisted values, ignoring anything
/// unparseable or out of range.
async fn restore_setpoints(store: &Arc<StateStore>, settings: &dyn SettingsStore) {
    for config in store.registry().iter() {
        match settings.get(&config.device_id, SETPOINT_KEY).await {
            Ok(Some(raw)) => match raw.parse::<f32>() {
                Ok(value) if config.setpoint_in_range(value) => {
                    if let Err(err) =
                        store.apply(&config.device_id, Mutation::SetSetpoint(value))
                    {
                        warn!(device_id = %config.device_id, error = %err, "setpoint restore failed");
                    } else {
                        info!(device_id = %config.device_id, setpoint = value, "setpoint restored");
                    }
                }
                Ok(value) => {
                    warn!(
                        device_id = %config.device_id,
                        setpoint = value,
                        "persisted setpoint out of range, keeping default"
                    );
                }
                Err(_) => {
                    warn!(
                        device_id = %config.device_id,
                        raw = %raw,
                        "unparseable persisted setpoint, keeping default"
                    );
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(
                    device_id = %config.device_id,
                    error = %err,
                    "settings store unavailable, keeping default setpoint"
                );
            }
        }
    }
}
