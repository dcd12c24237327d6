//! Static device registry.
//!
//! The device table is fixed at startup; there is no dynamic provisioning.
//! Lookups are needed on two paths with different keys: telemetry and
//! commands address devices by `device_id`, the Modbus plane addresses them
//! by `unit_id`, so the registry keeps both indexes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::error::CoreError;

/// Immutable table of all configured heating controllers.
#[derive(Debug)]
pub struct DeviceRegistry {
    by_id: HashMap<String, Arc<DeviceConfig>>,
    by_unit: HashMap<u8, Arc<DeviceConfig>>,
    ordered: Vec<Arc<DeviceConfig>>,
}

impl DeviceRegistry {
    /// Build the registry, validating id and unit uniqueness.
    pub fn new(configs: Vec<DeviceConfig>) -> Result<Self, CoreError> {
        let mut by_id = HashMap::with_capacity(configs.len());
        let mut by_unit = HashMap::with_capacity(configs.len());
        let mut ordered = Vec::with_capacity(configs.len());

        for config in configs {
            if config.unit_id == 0 || config.unit_id > 247 {
                return Err(CoreError::UnitIdOutOfRange(config.unit_id));
            }
            let config = Arc::new(config);
            if by_id
                .insert(config.device_id.clone(), config.clone())
                .is_some()
            {
                return Err(CoreError::DuplicateDeviceId(config.device_id.clone()));
            }
            if by_unit.insert(config.unit_id, config.clone()).is_some() {
                return Err(CoreError::DuplicateUnitId(config.unit_id));
            }
            ordered.push(config);
        }

        Ok(Self {
            by_id,
            by_unit,
            ordered,
        })
    }

    pub fn get(&self, device_id: &str) -> Option<&Arc<DeviceConfig>> {
        self.by_id.get(device_id)
    }

    pub fn by_unit(&self, unit_id: u8) -> Option<&Arc<DeviceConfig>> {
        self.by_unit.get(&unit_id)
    }

    /// Devices in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceConfig>> {
        self.ordered.iter()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Highest configured unit id; the Modbus register plane is sized by it.
    pub fn max_unit_id(&self) -> u8 {
        self.by_unit.keys().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceTopics, RegulatorGains, SafetyLimits};

    fn config(device_id: &str, unit_id: u8) -> DeviceConfig {
        DeviceConfig {
            device_id: device_id.to_string(),
            unit_id,
            broker: "plant".to_string(),
            topics: DeviceTopics {
                temperature_in: format!("{device_id}/temp"),
                valve_relay_out: format!("{device_id}/valve"),
                fan_dimmer_out: format!("{device_id}/fan"),
                alarm_in: None,
            },
            gains: RegulatorGains {
                kp: 8.0,
                ki: 0.2,
                kd: 1.0,
                out_min: 0.0,
                out_max: 100.0,
                integral_decay: 0.95,
            },
            safety: SafetyLimits::default(),
            setpoint_min: 5.0,
            setpoint_max: 35.0,
            stale_threshold_ms: 30_000,
        }
    }

    #[test]
    fn indexes_by_id_and_unit() {
        let registry = DeviceRegistry::new(vec![config("a", 1), config("b", 3)]).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("a").unwrap().unit_id, 1);
        assert_eq!(registry.by_unit(3).unwrap().device_id, "b");
        assert!(registry.by_unit(2).is_none());
        assert_eq!(registry.max_unit_id(), 3);
    }

    #[test]
    fn rejects_duplicate_device_id() {
        let err = DeviceRegistry::new(vec![config("a", 1), config("a", 2)]).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateDeviceId(_)));
    }

    #[test]
    fn rejects_duplicate_unit_id() {
        let err = DeviceRegistry::new(vec![config("a", 1), config("b", 1)]).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateUnitId(1)));
    }

    #[test]
    fn rejects_unit_id_outside_modbus_range() {
        let err = DeviceRegistry::new(vec![config("a", 0)]).unwrap_err();
        assert!(matches!(err, CoreError::UnitIdOutOfRange(0)));
        let err = DeviceRegistry::new(vec![config("a", 248)]).unwrap_err();
        assert!(matches!(err, CoreError::UnitIdOutOfRange(248)));
    }
}
