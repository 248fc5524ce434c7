//! Risk sizing models (C4, §4.4): convert discrete signals into target
//! position fractions. Deterministic, side-effect free, and never produce
//! `NaN` — insufficient history always resolves to `0.0`, not an error.

use crate::domain::{RiskSpec, Signal, TargetPosition};

const EPSILON: f64 = 1e-9;

/// `target = signal * fraction`, clamped to `[-1, 1]`.
pub fn fixed_fraction(signals: &[Signal], fraction: f64) -> Vec<TargetPosition> {
    signals
        .iter()
        .map(|s| TargetPosition {
            ts: s.ts,
            fraction: (s.direction as f64 * fraction).clamp(-1.0, 1.0),
        })
        .collect()
}

/// `scale = target_vol / max(realized_vol(lookback), eps)`;
/// `target = clamp(signal * base * scale, -1, 1)`. Bars before `lookback`
/// trailing returns are available produce `0.0`.
pub fn volatility_target(
    signals: &[Signal],
    closes: &[f64],
    base: f64,
    target_vol: f64,
    lookback: usize,
) -> Vec<TargetPosition> {
    assert_eq!(signals.len(), closes.len(), "signals and closes must be bar-aligned");
    let returns: Vec<f64> = closes
        .windows(2)
        .map(|p| if p[0] == 0.0 { 0.0 } else { (p[1] - p[0]) / p[0] })
        .collect();

    signals
        .iter()
        .enumerate()
        .map(|(i, s)| {
            if i < lookback || lookback == 0 {
                return TargetPosition { ts: s.ts, fraction: 0.0 };
            }
            let window = &returns[i - lookback..i];
            let mean = window.iter().sum::<f64>() / lookback as f64;
            let variance = window.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (lookback as f64 - 1.0).max(1.0);
            let realized_vol = variance.sqrt();
            let scale = target_vol / realized_vol.max(EPSILON);
            TargetPosition {
                ts: s.ts,
                fraction: (s.direction as f64 * base * scale).clamp(-1.0, 1.0),
            }
        })
        .collect()
}

/// `target = signal * base * clamp(p - (1-p)/r, 0, 1)`.
pub fn kelly_fraction(signals: &[Signal], base: f64, p: f64, r: f64) -> Vec<TargetPosition> {
    let edge = if r.abs() < EPSILON {
        0.0
    } else {
        (p - (1.0 - p) / r).clamp(0.0, 1.0)
    };
    signals
        .iter()
        .map(|s| TargetPosition {
            ts: s.ts,
            fraction: (s.direction as f64 * base * edge).clamp(-1.0, 1.0),
        })
        .collect()
}

/// Apply whichever [`RiskSpec`] a run config selects.
pub fn apply(spec: &RiskSpec, signals: &[Signal], closes: &[f64]) -> Vec<TargetPosition> {
    match spec {
        RiskSpec::FixedFraction { fraction } => fixed_fraction(signals, *fraction),
        RiskSpec::VolatilityTarget {
            base,
            target_vol,
            lookback,
        } => volatility_target(signals, closes, *base, *target_vol, *lookback),
        RiskSpec::KellyFraction { base, p, r } => kelly_fraction(signals, *base, *p, *r),
        RiskSpec::None => signals
            .iter()
            .map(|s| TargetPosition { ts: s.ts, fraction: 0.0 })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(ts: i64, direction: i8) -> Signal {
        Signal { ts, direction }
    }

    #[test]
    fn fixed_fraction_clamps_to_unit_interval() {
        let signals = vec![signal(0, 1), signal(1, -1), signal(2, 0)];
        let out = fixed_fraction(&signals, 2.0);
        assert_eq!(out[0].fraction, 1.0);
        assert_eq!(out[1].fraction, -1.0);
        assert_eq!(out[2].fraction, 0.0);
    }

    #[test]
    fn volatility_target_is_zero_before_lookback() {
        let signals = vec![signal(0, 1), signal(1, 1), signal(2, 1)];
        let closes = vec![100.0, 101.0, 99.0];
        let out = volatility_target(&signals, &closes, 1.0, 0.1, 5);
        assert!(out.iter().all(|t| t.fraction == 0.0));
    }

    #[test]
    fn volatility_target_scales_down_with_high_realized_vol() {
        let signals: Vec<Signal> = (0..20).map(|i| signal(i, 1)).collect();
        let mut closes = vec![100.0];
        for i in 1..20 {
            let wiggle = if i % 2 == 0 { 1.10 } else { 0.91 };
            closes.push(closes[i - 1] * wiggle);
        }
        let out = volatility_target(&signals, &closes, 1.0, 0.01, 5);
        assert!(out[19].fraction.abs() <= 1.0);
        assert!(out[19].fraction < 1.0);
    }

    #[test]
    fn kelly_fraction_is_zero_on_no_edge() {
        let signals = vec![signal(0, 1)];
        let out = kelly_fraction(&signals, 1.0, 0.4, 1.0);
        assert_eq!(out[0].fraction, 0.0);
    }

    #[test]
    fn kelly_fraction_positive_edge_scales_with_base() {
        let signals = vec![signal(0, 1)];
        let out = kelly_fraction(&signals, 0.5, 0.6, 1.0);
        // edge = clamp(0.6 - 0.4, 0, 1) = 0.2; target = 1 * 0.5 * 0.2
        assert!((out[0].fraction - 0.1).abs() < 1e-9);
    }
}
