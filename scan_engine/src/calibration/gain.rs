//! Single-shot AFE gain computation.

use hardware::command_set::{GainCurve, GainTuning};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GainOutcome {
    pub gain: [u8; 3],
    /// At least one channel wanted a code outside the legal range
    pub clamped: bool,
}

/// Gain codes that bring each channel's white level to the tuning target.
///
/// `levels` are channel averages indexed by sensor channel, measured at
/// the `current` codes; `dark` is the black level under them.
pub fn compute_gain(
    tuning: &GainTuning,
    curve: GainCurve,
    shared: bool,
    channels: &[usize],
    current: [u8; 3],
    levels: &[f64; 3],
    dark: f64,
) -> GainOutcome {
    let min_code = tuning.min_code.min(tuning.max_code);
    let max_code = tuning.max_code.max(tuning.min_code);
    let target = f64::from(tuning.target) - dark;

    let mut gain = current;
    let mut clamped = false;
    for &c in channels {
        let signal = levels[c] - dark;
        let code = if signal <= 0.0 {
            f64::INFINITY
        } else {
            curve.code_for(curve.factor(current[c]) * target / signal)
        };

        let legal = f64::from(min_code)..=f64::from(max_code);
        let code = code.round();
        gain[c] = if code.is_nan() {
            clamped = true;
            max_code
        } else if !legal.contains(&code) {
            clamped = true;
            code.clamp(f64::from(min_code), f64::from(max_code)) as u8
        } else {
            code as u8
        };
    }

    if shared {
        if let Some(lowest) = channels.iter().map(|&c| gain[c]).min() {
            gain = [lowest; 3];
        }
    }
    GainOutcome { gain, clamped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> GainTuning {
        GainTuning {
            target: 50_000,
            min_code: 0,
            max_code: 255,
        }
    }

    const LINEAR: GainCurve = GainCurve::Linear { step: 1.0 / 32.0 };
    const WOLFSON: GainCurve = GainCurve::Wolfson {
        numerator: 208.0,
        offset: 283.0,
    };

    #[test]
    fn test_half_target_doubles_factor() {
        let level = 2560.0 + 47_440.0 / 2.0;
        let out = compute_gain(&tuning(), LINEAR, false, &[1], [0; 3], &[0.0, level, 0.0], 2560.0);
        assert_eq!(out.gain, [0, 32, 0]);
        assert!(!out.clamped);

        let out = compute_gain(&tuning(), WOLFSON, false, &[1], [75; 3], &[0.0, level, 0.0], 2560.0);
        assert_eq!(out.gain[1], 179);
    }

    #[test]
    fn test_shared_gain_takes_minimum() {
        let levels = [2560.0 + 47_440.0 / 2.0, 2560.0 + 47_440.0 / 1.5, 2560.0 + 47_440.0 / 2.0];
        let out = compute_gain(&tuning(), LINEAR, true, &[0, 1, 2], [0; 3], &levels, 2560.0);
        assert_eq!(out.gain, [16; 3]);

        let out = compute_gain(&tuning(), LINEAR, false, &[0, 1, 2], [0; 3], &levels, 2560.0);
        assert_eq!(out.gain, [32, 16, 32]);
    }

    #[test]
    fn test_codes_clamped_to_legal_range() {
        // Barely any signal: the ratio asks for an enormous factor
        let out = compute_gain(&tuning(), LINEAR, false, &[0], [16; 3], &[2561.0, 0.0, 0.0], 2560.0);
        assert_eq!(out.gain[0], 255);
        assert!(out.clamped);

        // Saturated: the ratio asks for less than unity
        let out = compute_gain(&tuning(), LINEAR, false, &[0], [0; 3], &[65_535.0, 0.0, 0.0], 2560.0);
        assert_eq!(out.gain[0], 0);
        assert!(out.clamped);

        let mut narrow = tuning();
        narrow.min_code = 20;
        narrow.max_code = 200;
        let out = compute_gain(&narrow, WOLFSON, false, &[0], [75; 3], &[2561.0, 0.0, 0.0], 2560.0);
        assert_eq!(out.gain[0], 200);
    }

    #[test]
    fn test_no_signal_goes_to_max() {
        let out = compute_gain(&tuning(), WOLFSON, false, &[2], [75; 3], &[0.0, 0.0, 100.0], 2560.0);
        assert_eq!(out.gain, [75, 75, 255]);
        assert!(out.clamped);
    }
}
