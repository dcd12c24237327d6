//! Event-driven mirror of the device state into the register plane.
//!
//! Each state-change event triggers a rewrite of that device's slice, so
//! FC03/FC04 reads observe changes within one hop. A 1 Hz sweep reasserts
//! every slice to bound divergence if events are lost, and a lagged
//! broadcast receiver falls back to a full sweep instead of trying to
//! replay what it missed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use heatlink_core::{Clock, StateStore};

use crate::map;
use crate::plane::RegisterPlane;

/// Keeps the register plane in step with the state store.
pub struct Reflector {
    plane: Arc<RegisterPlane>,
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl Reflector {
    pub fn new(plane: Arc<RegisterPlane>, store: Arc<StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            plane,
            store,
            clock,
        }
    }

    /// Spawn the reflector task. The plane is fully rendered once before the
    /// task starts handling events.
    pub fn spawn(self, running: Arc<AtomicBool>) -> JoinHandle<()> {
        self.sweep();
        tokio::spawn(self.run(running))
    }

    async fn run(self, running: Arc<AtomicBool>) {
        let mut events = self.store.subscribe();
        let mut sweeper = interval(Duration::from_secs(1));
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = sweeper.tick() => self.sweep(),
                event = events.recv() => match event {
                    Ok(event) => self.reflect(&event.device_id),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "event stream lagged, resyncing all slices");
                        self.sweep();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("reflector stopped");
    }

    /// Rewrite one device's slice from its current snapshot.
    pub fn reflect(&self, device_id: &str) {
        let Ok(config) = self.store.config(device_id).map(Arc::clone) else {
            return;
        };
        let Ok(state) = self.store.snapshot(device_id) else {
            return;
        };
        let now_ms = self.clock.now_ms();
        self.plane
            .update_unit(config.unit_id as usize - 1, |slice| {
                map::render_into(slice, &config, &state, now_ms);
            });
    }

    /// Rewrite every device's slice.
    pub fn sweep(&self) {
        let now_ms = self.clock.now_ms();
        for (config, state) in self.store.all() {
            self.plane
                .update_unit(config.unit_id as usize - 1, |slice| {
                    map::render_into(slice, &config, &state, now_ms);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatlink_core::config::{DeviceTopics, RegulatorGains, SafetyLimits};
    use heatlink_core::{DeviceConfig, DeviceRegistry, ManualClock, Mutation};

    fn fixture() -> (Arc<RegisterPlane>, Arc<StateStore>, Reflector) {
        let configs = vec![
            DeviceConfig {
                device_id: "zone-1".to_string(),
                unit_id: 1,
                broker: "plant".to_string(),
                topics: DeviceTopics {
                    temperature_in: "t1".to_string(),
                    valve_relay_out: "v1".to_string(),
                    fan_dimmer_out: "f1".to_string(),
                    alarm_in: None,
                },
                gains: RegulatorGains {
                    kp: 10.0,
                    ki: 0.0,
                    kd: 0.0,
                    out_min: 0.0,
                    out_max: 100.0,
                    integral_decay: 0.95,
                },
                safety: SafetyLimits::default(),
                setpoint_min: 5.0,
                setpoint_max: 35.0,
                stale_threshold_ms: 30_000,
            },
            DeviceConfig {
                device_id: "zone-2".to_string(),
                unit_id: 2,
                broker: "plant".to_string(),
                topics: DeviceTopics {
                    temperature_in: "t2".to_string(),
                    valve_relay_out: "v2".to_string(),
                    fan_dimmer_out: "f2".to_string(),
                    alarm_in: None,
                },
                gains: RegulatorGains {
                    kp: 10.0,
                    ki: 0.0,
                    kd: 0.0,
                    out_min: 0.0,
                    out_max: 100.0,
                    integral_decay: 0.95,
                },
                safety: SafetyLimits::default(),
                setpoint_min: 5.0,
                setpoint_max: 35.0,
                stale_threshold_ms: 30_000,
            },
        ];
        let registry = Arc::new(DeviceRegistry::new(configs).unwrap());
        let store = Arc::new(StateStore::new(registry.clone()));
        let plane = Arc::new(RegisterPlane::new(registry.max_unit_id() as usize));
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000, 1));
        let reflector = Reflector::new(plane.clone(), store.clone(), clock);
        (plane, store, reflector)
    }

    #[test]
    fn reflect_writes_the_right_slice() {
        let (plane, store, reflector) = fixture();
        store
            .apply(
                "zone-2",
                Mutation::UpdateTemperature {
                    celsius: -5.2,
                    at_ms: 900,
                },
            )
            .unwrap();

        reflector.reflect("zone-2");

        // Unit 2's input slice starts at flat address 20.
        assert_eq!(plane.read_input(20, 1).unwrap(), vec![0xFFCC]);
        // Unit 1 untouched.
        assert_eq!(plane.read_input(0, 1).unwrap(), vec![0]);
    }

    #[test]
    fn sweep_covers_all_devices() {
        let (plane, store, reflector) = fixture();
        store.apply("zone-1", Mutation::SetSetpoint(25.0)).unwrap();
        store.apply("zone-2", Mutation::SetSetpoint(18.5)).unwrap();

        reflector.sweep();

        assert_eq!(plane.read_holding(0, 1).unwrap(), vec![250]);
        assert_eq!(plane.read_holding(30, 1).unwrap(), vec![185]);
    }
}
