//! Command envelopes and the in-process command bus.
//!
//! Commands from every surface (Modbus writes, WebSocket, HTTP, internal
//! safety trips) funnel into one bounded MPSC queue and are executed
//! serially by the dispatcher in `heatlink-control`. Sources that need the
//! validation verdict attach a oneshot reply channel.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::CoreError;

/// A control command addressed to one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Command {
    EnableAuto,
    DisableAuto,
    SetTemperature(f32),
    SetFanSpeed(f32),
    EmergencyStop,
    ResetEmergency,
}

/// Where a command originated. Validation failures are reported back to the
/// source; the register plane write path and the facade map them to their
/// own error surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    Modbus,
    WebSocket,
    Http,
    Internal,
}

/// One queued command with its addressing and optional reply channel.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub device_id: String,
    pub command: Command,
    pub source: CommandSource,
    pub reply: Option<oneshot::Sender<Result<(), CoreError>>>,
}

/// Cloneable sending half of the command queue.
#[derive(Clone)]
pub struct CommandBus {
    tx: mpsc::Sender<CommandEnvelope>,
}

impl CommandBus {
    /// Create the bus and the receiving half for the dispatcher task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<CommandEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a command without waiting for the outcome.
    pub async fn dispatch(
        &self,
        device_id: impl Into<String>,
        command: Command,
        source: CommandSource,
    ) -> Result<(), CoreError> {
        self.tx
            .send(CommandEnvelope {
                device_id: device_id.into(),
                command,
                source,
                reply: None,
            })
            .await
            .map_err(|_| CoreError::ChannelClosed)
    }

    /// Enqueue a command and wait for the dispatcher's verdict.
    pub async fn request(
        &self,
        device_id: impl Into<String>,
        command: Command,
        source: CommandSource,
    ) -> Result<(), CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CommandEnvelope {
                device_id: device_id.into(),
                command,
                source,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| CoreError::ChannelClosed)?;
        reply_rx.await.map_err(|_| CoreError::ChannelClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_delivers_envelope() {
        let (bus, mut rx) = CommandBus::channel(8);
        bus.dispatch("zone-1", Command::EnableAuto, CommandSource::Modbus)
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.device_id, "zone-1");
        assert_eq!(envelope.command, Command::EnableAuto);
        assert_eq!(envelope.source, CommandSource::Modbus);
        assert!(envelope.reply.is_none());
    }

    #[tokio::test]
    async fn request_round_trips_the_verdict() {
        let (bus, mut rx) = CommandBus::channel(8);

        let executor = tokio::spawn(async move {
            let envelope = rx.recv().await.unwrap();
            envelope
                .reply
                .unwrap()
                .send(Err(CoreError::FanSpeedOutOfRange(140.0)))
                .unwrap();
        });

        let verdict = bus
            .request("zone-1", Command::SetFanSpeed(140.0), CommandSource::Http)
            .await;
        assert!(matches!(verdict, Err(CoreError::FanSpeedOutOfRange(_))));
        executor.await.unwrap();
    }

    #[tokio::test]
    async fn closed_dispatcher_surfaces_as_channel_closed() {
        let (bus, rx) = CommandBus::channel(1);
        drop(rx);
        let err = bus
            .dispatch("zone-1", Command::EnableAuto, CommandSource::Internal)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ChannelClosed));
    }
}
