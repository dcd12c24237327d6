//! Per-device regulator tasks.
//!
//! One cooperative task per device runs at 1 Hz. Safety trips are evaluated
//! on every tick whether or not the regulator is enabled; the PID path only
//! runs while `auto_enabled` and not in emergency stop. The fan command is
//! republished on every tick so a lost publish heals within one period; the
//! valve is only published on transitions, and its shadow is only updated
//! when the publish went out, so a failed valve publish retries next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use heatlink_core::{
    fan_payload, valve_payload, valve_target, Clock, Command, CommandBus, CommandSource,
    DeviceConfig, Mutation, StateStore, TelemetryPublisher, ValveState,
};

use crate::pid::{self, PidInput};

/// Owns the regulator tasks for the whole device table.
pub struct RegulatorSet {
    store: Arc<StateStore>,
    publisher: Arc<dyn TelemetryPublisher>,
    commands: CommandBus,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl RegulatorSet {
    pub fn new(
        store: Arc<StateStore>,
        publisher: Arc<dyn TelemetryPublisher>,
        commands: CommandBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            publisher,
            commands,
            clock,
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    /// Spawn one 1 Hz task per registered device.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let configs: Vec<_> = self.store.registry().iter().cloned().collect();
        for config in configs {
            info!(device_id = %config.device_id, "starting regulator");
            self.handles.push(tokio::spawn(regulator_loop(
                config,
                self.store.clone(),
                self.publisher.clone(),
                self.commands.clone(),
                self.clock.clone(),
                self.running.clone(),
            )));
        }
    }

    /// Request shutdown; each task finishes its in-flight tick and exits
    /// within one period.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for all regulator tasks to exit.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn regulator_loop(
    config: Arc<DeviceConfig>,
    store: Arc<StateStore>,
    publisher: Arc<dyn TelemetryPublisher>,
    commands: CommandBus,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
) {
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        if !running.load(Ordering::SeqCst) {
            break;
        }
        run_tick(&config, &store, publisher.as_ref(), &commands, clock.as_ref()).await;
    }
    debug!(device_id = %config.device_id, "regulator stopped");
}

/// One regulator tick for one device. Public to the crate's tests.
pub(crate) async fn run_tick(
    config: &DeviceConfig,
    store: &StateStore,
    publisher: &dyn TelemetryPublisher,
    commands: &CommandBus,
    clock: &dyn Clock,
) {
    let snapshot = match store.snapshot(&config.device_id) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(device_id = %config.device_id, error = %err, "snapshot failed");
            return;
        }
    };

    let temperature = snapshot.current_temperature;
    let has_reading = snapshot.last_temperature_update_ms != 0;

    // Safety trips, evaluated regardless of the regulator enable. They need
    // at least one real reading; the power-on default of 0 °C is not a
    // measurement.
    if has_reading && !snapshot.emergency_stop {
        if temperature > config.safety.overheat_limit {
            warn!(
                device_id = %config.device_id,
                temperature,
                limit = config.safety.overheat_limit,
                "overheat limit exceeded, tripping emergency stop"
            );
            if let Err(err) = commands
                .dispatch(
                    config.device_id.clone(),
                    Command::EmergencyStop,
                    CommandSource::Internal,
                )
                .await
            {
                warn!(device_id = %config.device_id, error = %err, "emergency dispatch failed");
            }
            return;
        }

        if temperature < config.safety.freeze_limit {
            warn!(
                device_id = %config.device_id,
                temperature,
                limit = config.safety.freeze_limit,
                "freeze protection active"
            );
            freeze_protect(config, store, publisher).await;
            return;
        }
    }

    if !snapshot.auto_enabled || snapshot.emergency_stop {
        return;
    }

    let outcome = pid::tick(
        &config.gains,
        &config.safety,
        PidInput {
            setpoint: snapshot.setpoint_temperature,
            measured: temperature,
            integral: snapshot.integral,
            prev_error: snapshot.prev_error,
            is_working: snapshot.is_working,
        },
    );

    // Fan goes out every tick: the shadow is the retry mechanism.
    if let Err(err) = publisher
        .publish(
            &config.broker,
            &config.topics.fan_dimmer_out,
            fan_payload(outcome.fan),
        )
        .await
    {
        warn!(device_id = %config.device_id, error = %err, "fan publish failed");
    }

    let valve = valve_target(clock.month(), outcome.output);
    let valve_update = if valve != snapshot.valve_state {
        match publisher
            .publish(
                &config.broker,
                &config.topics.valve_relay_out,
                valve_payload(valve),
            )
            .await
        {
            Ok(()) => Some(valve),
            Err(err) => {
                warn!(device_id = %config.device_id, error = %err, "valve publish failed");
                None
            }
        }
    } else {
        None
    };

    if let Err(err) = store.apply(
        &config.device_id,
        Mutation::SetActuators {
            fan: Some(outcome.fan),
            pid: Some(outcome.output),
            valve: valve_update,
        },
    ) {
        warn!(device_id = %config.device_id, error = %err, "actuator update failed");
    }

    if let Err(err) = store.apply(
        &config.device_id,
        Mutation::SetRegulator {
            integral: outcome.integral,
            prev_error: outcome.error,
            last_tick_ms: clock.now_ms(),
        },
    ) {
        warn!(device_id = %config.device_id, error = %err, "regulator update failed");
    }
}

/// Freeze protection: fan to maximum, valve open, no emergency trip.
async fn freeze_protect(config: &DeviceConfig, store: &StateStore, publisher: &dyn TelemetryPublisher) {
    let out_max = config.gains.out_max;
    if let Err(err) = publisher
        .publish(
            &config.broker,
            &config.topics.fan_dimmer_out,
            fan_payload(out_max),
        )
        .await
    {
        warn!(device_id = %config.device_id, error = %err, "freeze fan publish failed");
    }

    let valve_update = {
        let open_needed = store
            .snapshot(&config.device_id)
            .map(|s| s.valve_state != ValveState::Open)
            .unwrap_or(false);
        if open_needed {
            match publisher
                .publish(
                    &config.broker,
                    &config.topics.valve_relay_out,
                    valve_payload(ValveState::Open),
                )
                .await
            {
                Ok(()) => Some(ValveState::Open),
                Err(err) => {
                    warn!(device_id = %config.device_id, error = %err, "freeze valve publish failed");
                    None
                }
            }
        } else {
            None
        }
    };

    if let Err(err) = store.apply(
        &config.device_id,
        Mutation::SetActuators {
            fan: Some(out_max),
            pid: None,
            valve: valve_update,
        },
    ) {
        warn!(device_id = %config.device_id, error = %err, "freeze actuator update failed");
    }
}
