//! Telemetry staleness scan.
//!
//! A device whose last accepted reading is older than its stale threshold is
//! marked offline; the Modbus status word raises the sensor-error bit from
//! the same condition. The next valid reading flips it back online.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use heatlink_core::{Clock, Mutation, StateStore};

/// Spawn the 1 Hz staleness scan.
pub fn spawn_health_task(
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            scan(&store, clock.as_ref());
        }
        debug!("health task stopped");
    })
}

/// One pass over all devices. Split out for tests.
pub fn scan(store: &StateStore, clock: &dyn Clock) {
    let now = clock.now_ms();
    for (config, state) in store.all() {
        if !state.is_online {
            continue;
        }
        let age = now - state.last_temperature_update_ms;
        if age > config.stale_threshold_ms {
            warn!(
                device_id = %config.device_id,
                age_ms = age,
                threshold_ms = config.stale_threshold_ms,
                "telemetry stale, marking device offline"
            );
            if let Err(err) = store.apply(&config.device_id, Mutation::SetOnline(false)) {
                warn!(device_id = %config.device_id, error = %err, "offline update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatlink_core::config::{DeviceTopics, RegulatorGains, SafetyLimits};
    use heatlink_core::{DeviceConfig, DeviceRegistry, EventKind, ManualClock};

    fn store() -> Arc<StateStore> {
        let config = DeviceConfig {
            device_id: "zone-1".to_string(),
            unit_id: 1,
            broker: "plant".to_string(),
            topics: DeviceTopics {
                temperature_in: "zone-1/temp".to_string(),
                valve_relay_out: "zone-1/valve".to_string(),
                fan_dimmer_out: "zone-1/fan".to_string(),
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
        };
        Arc::new(StateStore::new(Arc::new(
            DeviceRegistry::new(vec![config]).unwrap(),
        )))
    }

    #[test]
    fn stale_device_goes_offline() {
        let store = store();
        let clock = ManualClock::new(100_000, 1);
        store
            .apply(
                "zone-1",
                Mutation::UpdateTemperature {
                    celsius: 20.0,
                    at_ms: 100_000,
                },
            )
            .unwrap();

        // Within the threshold: stays online.
        clock.set_now_ms(120_000);
        scan(&store, &clock);
        assert!(store.snapshot("zone-1").unwrap().is_online);

        // Past the threshold: goes offline, once.
        clock.set_now_ms(130_001);
        let mut events = store.subscribe();
        scan(&store, &clock);
        assert!(!store.snapshot("zone-1").unwrap().is_online);
        assert_eq!(events.try_recv().unwrap().kind, EventKind::OnlineChanged);

        scan(&store, &clock);
        assert!(events.try_recv().is_err(), "no repeated offline events");
    }

    #[test]
    fn fresh_reading_revives_the_device() {
        let store = store();
        let clock = ManualClock::new(200_000, 1);
        store
            .apply(
                "zone-1",
                Mutation::UpdateTemperature {
                    celsius: 20.0,
                    at_ms: 100_000,
                },
            )
            .unwrap();
        scan(&store, &clock);
        assert!(!store.snapshot("zone-1").unwrap().is_online);

        store
            .apply(
                "zone-1",
                Mutation::UpdateTemperature {
                    celsius: 20.5,
                    at_ms: 200_000,
                },
            )
            .unwrap();
        assert!(store.snapshot("zone-1").unwrap().is_online);
    }
}
