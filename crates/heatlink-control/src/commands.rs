//! The command pipeline.
//!
//! A single dispatcher task drains the command bus and executes envelopes
//! one at a time, which gives the serialized per-device command order the
//! rest of the system assumes. Validation failures travel back to the
//! originating source through the envelope's reply channel; actuation
//! failures are logged and healed by the regulator's next tick.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use heatlink_core::{
    fan_payload, valve_payload, Command, CommandEnvelope, CommandSource, CoreError, Mutation,
    StateStore, TelemetryPublisher, ValveState,
};
use heatlink_storage::{SettingsStore, SETPOINT_KEY};

/// Executes commands against the state store and the actuator topics.
pub struct CommandDispatcher {
    store: Arc<StateStore>,
    publisher: Arc<dyn TelemetryPublisher>,
    settings: Arc<dyn SettingsStore>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<StateStore>,
        publisher: Arc<dyn TelemetryPublisher>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
        }
    }

    /// Drain the bus until every sender is gone.
    pub async fn run(self, mut rx: mpsc::Receiver<CommandEnvelope>) {
        info!("command dispatcher started");
        while let Some(envelope) = rx.recv().await {
            let result = self
                .execute(&envelope.device_id, envelope.command, envelope.source)
                .await;
            if let Err(err) = &result {
                warn!(
                    device_id = %envelope.device_id,
                    source = ?envelope.source,
                    command = ?envelope.command,
                    error = %err,
                    "command rejected"
                );
            }
            if let Some(reply) = envelope.reply {
                let _ = reply.send(result);
            }
        }
        info!("command dispatcher stopped");
    }

    /// Execute one command. Exposed to the crate's tests.
    pub async fn execute(
        &self,
        device_id: &str,
        command: Command,
        source: CommandSource,
    ) -> Result<(), CoreError> {
        debug!(device_id, ?command, ?source, "executing command");
        let config = self.store.config(device_id)?.clone();

        match command {
            Command::EnableAuto => {
                self.store.apply(device_id, Mutation::SetAuto(true))?;
            }
            Command::DisableAuto => {
                self.store.apply(device_id, Mutation::SetAuto(false))?;
                self.publish_fan(&config.broker, &config.topics.fan_dimmer_out, 0.0)
                    .await;
                let closed = self
                    .publish_valve(&config.broker, &config.topics.valve_relay_out, ValveState::Closed)
                    .await;
                self.store.apply(
                    device_id,
                    Mutation::SetActuators {
                        fan: None,
                        pid: None,
                        valve: closed.then_some(ValveState::Closed),
                    },
                )?;
            }
            Command::SetTemperature(value) => {
                self.store.apply(device_id, Mutation::SetSetpoint(value))?;
                if let Err(err) = self
                    .settings
                    .set(device_id, SETPOINT_KEY, &value.to_string())
                    .await
                {
                    // The in-memory setpoint wins; persistence catches up on
                    // the next successful write.
                    warn!(device_id, error = %err, "setpoint persistence failed");
                }
            }
            Command::SetFanSpeed(value) => {
                if !(0.0..=100.0).contains(&value) {
                    return Err(CoreError::FanSpeedOutOfRange(value));
                }
                self.publish_fan(&config.broker, &config.topics.fan_dimmer_out, value)
                    .await;
                self.store.apply(
                    device_id,
                    Mutation::SetActuators {
                        fan: Some(value),
                        pid: Some(value),
                        valve: None,
                    },
                )?;
            }
            Command::EmergencyStop => {
                self.store.apply(device_id, Mutation::SetEmergency(true))?;
                self.publish_fan(&config.broker, &config.topics.fan_dimmer_out, 0.0)
                    .await;
                self.publish_valve(&config.broker, &config.topics.valve_relay_out, ValveState::Closed)
                    .await;
            }
            Command::ResetEmergency => {
                self.store.apply(device_id, Mutation::SetEmergency(false))?;
            }
        }
        Ok(())
    }

    async fn publish_fan(&self, broker: &str, topic: &str, value: f32) {
        if let Err(err) = self
            .publisher
            .publish(broker, topic, fan_payload(value))
            .await
        {
            warn!(topic, error = %err, "fan publish failed");
        }
    }

    /// Returns true when the publish went out.
    async fn publish_valve(&self, broker: &str, topic: &str, valve: ValveState) -> bool {
        match self
            .publisher
            .publish(broker, topic, valve_payload(valve))
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(topic, error = %err, "valve publish failed");
                false
            }
        }
    }
}
