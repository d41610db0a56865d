use serde::{Deserialize, Serialize};

use super::consts::{KALMAN_Q_ACCEL, KALMAN_Q_SPEED, KALMAN_R};

/// Two-state (speed, acceleration) Kalman filter over noisy speed samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedKalman {
    /// Filtered speed estimate, bytes/s.
    #[serde(default)]
    pub speed: f64,
    /// Filtered acceleration estimate, bytes/s².
    #[serde(default)]
    pub accel: f64,
    #[serde(default = "default_p")]
    p00: f64,
    #[serde(default)]
    p01: f64,
    #[serde(default)]
    p10: f64,
    #[serde(default = "default_p")]
    p11: f64,
    #[serde(default)]
    last_time: f64,
    #[serde(default)]
    initialized: bool,
}

const fn default_p() -> f64 {
    1000.0
}

impl Default for SpeedKalman {
    fn default() -> Self {
        Self {
            speed: 0.0,
            accel: 0.0,
            p00: default_p(),
            p01: 0.0,
            p10: 0.0,
            p11: default_p(),
            last_time: 0.0,
            initialized: false,
        }
    }
}

impl SpeedKalman {
    /// Fold one measurement in and return `(speed, accel)`.
    pub fn update(&mut self, measurement: f64, now: f64) -> (f64, f64) {
        if !self.initialized {
            self.speed = measurement;
            self.last_time = now;
            self.initialized = true;
            return (measurement, 0.0);
        }

        let dt = now - self.last_time;
        if dt <= 0.01 {
            return (self.speed, self.accel);
        }
        self.last_time = now;

        // Predict.
        let pred_speed = self.speed + self.accel * dt;
        let p00_pred = self.p00 + dt * (self.p10 + self.p01) + dt * dt * self.p11 + KALMAN_Q_SPEED;
        let p01_pred = self.p01 + dt * self.p11;
        let p10_pred = self.p10 + dt * self.p11;
        let p11_pred = self.p11 + KALMAN_Q_ACCEL;

        // Update.
        let s = p00_pred + KALMAN_R;
        if s.abs() < 1e-10 {
            return (self.speed, self.accel);
        }
        let k0 = p00_pred / s;
        let k1 = p10_pred / s;
        let innovation = measurement - pred_speed;

        self.speed = pred_speed + k0 * innovation;
        self.accel += k1 * innovation;
        self.p00 = (1.0 - k0) * p00_pred;
        self.p01 = (1.0 - k0) * p01_pred;
        self.p10 = -k1 * p00_pred + p10_pred;
        self.p11 = -k1 * p01_pred + p11_pred;

        (self.speed, self.accel)
    }

    /// Predicted upload over the next `seconds`: `max(0, s·T + a·T²/2)`.
    #[must_use]
    pub fn predict_upload(&self, seconds: f64) -> f64 {
        (self.speed * seconds + 0.5 * self.accel * seconds * seconds).max(0.0)
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_to_constant_speed() {
        let mut kalman = SpeedKalman::default();
        let mut now = 0.0;
        for _ in 0..120 {
            now += 1.0;
            kalman.update(10_000_000.0, now);
        }
        assert!((kalman.speed - 10_000_000.0).abs() / 10_000_000.0 < 0.01);
        assert!(kalman.accel.abs() < 50_000.0);
    }

    #[test]
    fn tracks_a_ramp_with_positive_accel() {
        let mut kalman = SpeedKalman::default();
        let mut now = 0.0;
        let mut speed = 1_000_000.0;
        for _ in 0..240 {
            now += 1.0;
            speed += 10_000.0;
            kalman.update(speed, now);
        }
        assert!(kalman.accel > 1_000.0, "accel estimate {}", kalman.accel);
        // Prediction over 10 s should exceed pure-constant extrapolation.
        assert!(kalman.predict_upload(10.0) > kalman.speed * 10.0);
    }

    #[test]
    fn prediction_never_negative() {
        let mut kalman = SpeedKalman::default();
        kalman.update(100.0, 1.0);
        kalman.update(0.0, 2.0);
        kalman.update(0.0, 3.0);
        assert!(kalman.predict_upload(1000.0) >= 0.0);
    }
}
