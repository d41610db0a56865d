use serde::{Deserialize, Serialize};

use super::consts::{pid_params, Phase};
use super::{clamp, safe_div};

/// PID controller with phase-adaptive gains.
///
/// The error is normalized by the setpoint, the integral is clamped against
/// windup, the derivative is low-pass filtered, and the output is a
/// multiplicative factor clamped to `[0.5, 2.0]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidController {
    #[serde(skip, default = "default_gain_kp")]
    kp: f64,
    #[serde(skip, default = "default_gain_ki")]
    ki: f64,
    #[serde(skip, default = "default_gain_kd")]
    kd: f64,
    #[serde(default)]
    integral: f64,
    #[serde(default)]
    last_error: f64,
    #[serde(default)]
    last_time: f64,
    #[serde(default = "default_output")]
    last_output: f64,
    #[serde(default)]
    derivative_filter: f64,
    #[serde(default)]
    initialized: bool,
}

const INTEGRAL_LIMIT: f64 = 0.4;
const DERIVATIVE_ALPHA: f64 = 0.3;

const fn default_gain_kp() -> f64 {
    0.6
}
const fn default_gain_ki() -> f64 {
    0.15
}
const fn default_gain_kd() -> f64 {
    0.08
}
const fn default_output() -> f64 {
    1.0
}

impl Default for PidController {
    fn default() -> Self {
        Self {
            kp: default_gain_kp(),
            ki: default_gain_ki(),
            kd: default_gain_kd(),
            integral: 0.0,
            last_error: 0.0,
            last_time: 0.0,
            last_output: default_output(),
            derivative_filter: 0.0,
            initialized: false,
        }
    }
}

impl PidController {
    /// Load the gain set for the given phase.
    pub fn set_phase(&mut self, phase: Phase) {
        let params = pid_params(phase);
        self.kp = params.kp;
        self.ki = params.ki;
        self.kd = params.kd;
    }

    /// Advance the controller and return the output factor.
    pub fn update(&mut self, setpoint: f64, measured: f64, now: f64) -> f64 {
        let error = safe_div(setpoint - measured, setpoint.max(1.0), 0.0);

        if !self.initialized {
            self.last_error = error;
            self.last_time = now;
            self.initialized = true;
            return 1.0;
        }

        let dt = now - self.last_time;
        if dt <= 0.01 {
            return self.last_output;
        }
        self.last_time = now;

        let p_term = self.kp * error;

        self.integral = clamp(self.integral + error * dt, -INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        let i_term = self.ki * self.integral;

        let raw_derivative = (error - self.last_error) / dt;
        self.derivative_filter =
            DERIVATIVE_ALPHA * raw_derivative + (1.0 - DERIVATIVE_ALPHA) * self.derivative_filter;
        let d_term = self.kd * self.derivative_filter;
        self.last_error = error;

        let output = clamp(1.0 + p_term + i_term + d_term, 0.5, 2.0);
        self.last_output = output;
        output
    }

    /// Forget accumulated state (new cycle with a different regime).
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_time = 0.0;
        self.last_output = default_output();
        self.derivative_filter = 0.0;
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_initializes_and_returns_unity() {
        let mut pid = PidController::default();
        assert!((pid.update(100.0, 0.0, 10.0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn output_is_clamped() {
        let mut pid = PidController::default();
        pid.set_phase(Phase::Finish);
        let _ = pid.update(1000.0, 0.0, 0.0);
        // Huge sustained positive error drives the output to the upper clamp.
        let mut out = 1.0;
        for step in 1..50 {
            out = pid.update(1000.0, 0.0, f64::from(step));
        }
        assert!(out <= 2.0);
        assert!(out > 1.0);

        pid.reset();
        let _ = pid.update(1000.0, 5000.0, 0.0);
        for step in 1..50 {
            out = pid.update(1000.0, 5000.0, f64::from(step));
        }
        assert!(out >= 0.5);
        assert!(out < 1.0);
    }

    #[test]
    fn tiny_dt_returns_previous_output() {
        let mut pid = PidController::default();
        let _ = pid.update(100.0, 50.0, 10.0);
        let first = pid.update(100.0, 50.0, 11.0);
        let repeat = pid.update(100.0, 0.0, 11.005);
        assert!((repeat - first).abs() < f64::EPSILON);
    }

    #[test]
    fn serde_round_trip_preserves_dynamics() {
        let mut pid = PidController::default();
        pid.set_phase(Phase::Steady);
        let _ = pid.update(100.0, 10.0, 1.0);
        let _ = pid.update(100.0, 30.0, 2.0);
        let json = serde_json::to_string(&pid).expect("serialize");
        let mut restored: PidController = serde_json::from_str(&json).expect("deserialize");
        restored.set_phase(Phase::Steady);
        pid.set_phase(Phase::Steady);
        let a = pid.update(100.0, 50.0, 3.0);
        let b = restored.update(100.0, 50.0, 3.0);
        assert!((a - b).abs() < 1e-12);
    }
}
