use super::consts::{quant_step, Phase, MIN_LIMIT};
use super::safe_div;

/// Round a raw limit to a phase-dependent step to stop the applied cap from
/// jittering on every tick.
///
/// The step widens when the current speed is far above target (big moves are
/// fine) and halves when the 10 s trend is moving fast (fine control while
/// the swarm shifts). The result never goes below [`MIN_LIMIT`].
#[must_use]
pub fn quantize(limit: u64, phase: Phase, current_speed: f64, target: f64, trend: f64) -> u64 {
    if limit == 0 {
        return 0;
    }

    let base = quant_step(phase);
    let ratio = safe_div(current_speed, target, 1.0);

    let mut step = if phase == Phase::Finish {
        256
    } else if ratio > 1.2 {
        base * 2
    } else if ratio > 1.05 {
        base
    } else if ratio > 0.8 {
        base / 2
    } else {
        base
    };

    if trend.abs() > 0.1 {
        step = (step / 2).max(256);
    }

    let step = step.clamp(256, 8192);
    let quantized = (limit + step / 2) / step * step;
    quantized.max(MIN_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_uses_fine_steps() {
        let limit = quantize(1_000_300, Phase::Finish, 1.0, 1.0, 0.0);
        assert_eq!(limit % 256, 0);
        assert!((i64::try_from(limit).unwrap() - 1_000_300).abs() < 256);
    }

    #[test]
    fn overspeed_widens_the_step() {
        // ratio > 1.2 doubles the catch step to 6144.
        let limit = quantize(1_000_000, Phase::Catch, 13.0, 10.0, 0.0);
        assert_eq!(limit % 6144, 0);
    }

    #[test]
    fn fast_trend_halves_the_step() {
        let steady = quantize(1_000_000, Phase::Steady, 10.0, 10.0, 0.0);
        let trending = quantize(1_000_000, Phase::Steady, 10.0, 10.0, 0.5);
        // steady at ratio 1.0 uses 1024; trending halves to 512.
        assert_eq!(steady % 1024, 0);
        assert_eq!(trending % 512, 0);
    }

    #[test]
    fn floor_is_min_limit() {
        assert_eq!(quantize(1, Phase::Steady, 1.0, 1.0, 0.0), MIN_LIMIT);
        assert_eq!(quantize(0, Phase::Steady, 1.0, 1.0, 0.0), 0);
    }
}
