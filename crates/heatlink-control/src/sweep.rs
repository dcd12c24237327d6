//! Startup valve sweep.
//!
//! At boot the physical valve positions are unknown, so the seasonal policy
//! is asserted once for every device before the regulators start, whether or
//! not automatic control is enabled.

use std::sync::Arc;

use tracing::{info, warn};

use heatlink_core::{valve_payload, valve_target, Clock, Mutation, StateStore, TelemetryPublisher};

/// Publish the seasonal valve target for every device and record the shadow.
pub async fn startup_valve_sweep(
    store: &Arc<StateStore>,
    publisher: &Arc<dyn TelemetryPublisher>,
    clock: &Arc<dyn Clock>,
) {
    let month = clock.month();
    for (config, state) in store.all() {
        let target = valve_target(month, state.pid_output);
        info!(
            device_id = %config.device_id,
            month,
            valve = ?target,
            "startup valve assertion"
        );
        match publisher
            .publish(
                &config.broker,
                &config.topics.valve_relay_out,
                valve_payload(target),
            )
            .await
        {
            Ok(()) => {
                if let Err(err) = store.apply(
                    &config.device_id,
                    Mutation::SetActuators {
                        fan: None,
                        pid: None,
                        valve: Some(target),
                    },
                ) {
                    warn!(device_id = %config.device_id, error = %err, "valve shadow update failed");
                }
            }
            Err(err) => {
                warn!(device_id = %config.device_id, error = %err, "startup valve publish failed");
            }
        }
    }
}
