//! The per-tick regulator computation.
//!
//! Pure with respect to device state: the caller passes the snapshot values
//! in and stores the outcome back, so the math is trivially testable.

use heatlink_core::config::{RegulatorGains, SafetyLimits};

/// Snapshot values consumed by one tick.
#[derive(Debug, Clone, Copy)]
pub struct PidInput {
    pub setpoint: f32,
    pub measured: f32,
    pub integral: f32,
    pub prev_error: f32,
    pub is_working: bool,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy)]
pub struct PidOutcome {
    /// Saturated regulator output, percent.
    pub output: f32,
    /// Fan command after the minimum-output cut-off: either `output` or 0.
    pub fan: f32,
    /// Updated integral accumulator.
    pub integral: f32,
    /// Effective error of this tick, stored as `prev_error` for the next.
    pub error: f32,
}

/// Run one regulator tick.
///
/// The hysteresis dead-zone only acts while the fan is running and the zone
/// is over temperature by no more than the band: the error is zeroed so the
/// actuator does not chatter off around the setpoint. On negative error the
/// integral is bled down by `integral_decay` and floored at zero, so stored
/// heat cannot keep the output latched on.
pub fn tick(gains: &RegulatorGains, safety: &SafetyLimits, input: PidInput) -> PidOutcome {
    let raw_error = input.setpoint - input.measured;

    let error = if input.is_working && raw_error < 0.0 && raw_error.abs() <= safety.hysteresis {
        0.0
    } else {
        raw_error
    };

    let mut integral = input.integral + error;
    if error < 0.0 {
        integral = (integral * gains.integral_decay).max(0.0);
    }

    let derivative = error - input.prev_error;

    let unsaturated = gains.kp * error + gains.ki * integral + gains.kd * derivative;
    let output = unsaturated.clamp(gains.out_min, gains.out_max);

    let fan = if output < safety.min_output_threshold {
        0.0
    } else {
        output
    };

    PidOutcome {
        output,
        fan,
        integral,
        error,
    }
}
