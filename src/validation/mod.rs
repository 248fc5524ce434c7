//! Validation engine (C7, §4.7): permutation test, HADJ-BB block
//! bootstrap, walk-forward aggregation, and the strict-mode CI-width gate.

pub mod bootstrap;
pub mod cancel;
pub mod permutation;
pub mod seed;
pub mod walk_forward;

use crate::domain::{Candle, EquityBar, ExecutionSpec, RiskSpec, Signal, Trade, ValidationSpec};
use crate::errors::{EngineError, EngineResult};
use cancel::CancellationToken;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ValidationReport {
    pub permutation: Option<permutation::PermutationResult>,
    pub bootstrap: Option<bootstrap::BootstrapResult>,
    pub walk_forward: Option<walk_forward::WalkForwardResult>,
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    spec: &ValidationSpec,
    candles: &[Candle],
    signals: &[Signal],
    risk_spec: &RiskSpec,
    exec_spec: &ExecutionSpec,
    initial_equity: f64,
    equity: &[EquityBar],
    trades: &[Trade],
    seed_root: u64,
    cancel: &CancellationToken,
    default_width_max: f64,
) -> EngineResult<ValidationReport> {
    let mut report = ValidationReport::default();

    if let Some(perm_spec) = &spec.permutation {
        report.permutation = Some(permutation::run(
            candles,
            signals,
            risk_spec,
            exec_spec,
            initial_equity,
            perm_spec.trials,
            perm_spec.metric,
            seed_root,
            trades.len() as u64,
            cancel,
        )?);
    }

    if let Some(boot_spec) = &spec.bootstrap {
        let returns: Vec<f64> = equity
            .windows(2)
            .map(|p| if p[0].nav == 0.0 { 0.0 } else { (p[1].nav - p[0].nav) / p[0].nav })
            .collect();
        let result = bootstrap::run(&returns, boot_spec.trials, boot_spec.ci_level, seed_root, cancel)?;
        if spec.strict {
            // A per-run `width_threshold` overrides the process-wide
            // `BOOT_CI_WIDTH_MAX` default; an infinite default (the field's
            // own default when unset) means "no gate" either way.
            let threshold = boot_spec.width_threshold.unwrap_or(default_width_max);
            if threshold.is_finite() {
                let width = result.ci_high - result.ci_low;
                if width > threshold {
                    return Err(EngineError::StatsWidthExceeded {
                        metric: "bootstrap_ci".to_string(),
                        width,
                        threshold,
                    });
                }
            }
        }
        report.bootstrap = Some(result);
    }

    if let Some(wf_spec) = &spec.walk_forward {
        report.walk_forward = Some(walk_forward::run(
            candles,
            signals,
            risk_spec,
            exec_spec,
            initial_equity,
            wf_spec.windows,
        )?);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BootstrapSpec, MetricKind, PermutationSpec};

    fn candle(ts: i64, c: f64) -> Candle {
        Candle {
            ts,
            o: c,
            h: c + 0.1,
            l: c - 0.1,
            c,
            v: 10,
            zero_volume: false,
        }
    }

    #[test]
    fn empty_validation_spec_yields_empty_report() {
        let candles: Vec<Candle> = (0..5).map(|i| candle(i * 60_000, 100.0)).collect();
        let signals: Vec<Signal> = (0..5).map(|i| Signal { ts: i, direction: 0 }).collect();
        let equity: Vec<EquityBar> = vec![];
        let report = run(
            &ValidationSpec::default(),
            &candles,
            &signals,
            &RiskSpec::None,
            &ExecutionSpec::default(),
            1000.0,
            &equity,
            &[],
            1,
            &CancellationToken::new(),
            f64::INFINITY,
        )
        .unwrap();
        assert!(report.permutation.is_none());
        assert!(report.bootstrap.is_none());
        assert!(report.walk_forward.is_none());
    }

    #[test]
    fn strict_mode_bootstrap_width_gate_fails_run() {
        let candles: Vec<Candle> = (0..200).map(|i| candle(i * 60_000, 100.0 + (i as f64 * 0.37).sin() * 5.0)).collect();
        let signals: Vec<Signal> = (0..200).map(|i| Signal { ts: i, direction: 1 }).collect();
        let result = execution_equity(&candles, &signals);
        let spec = ValidationSpec {
            permutation: None,
            bootstrap: Some(BootstrapSpec {
                trials: 100,
                ci_level: 0.90,
                width_threshold: Some(0.0),
                metric: MetricKind::TotalReturn,
            }),
            walk_forward: None,
            strict: true,
        };
        let err = run(
            &spec,
            &candles,
            &signals,
            &RiskSpec::FixedFraction { fraction: 1.0 },
            &ExecutionSpec::default(),
            1000.0,
            &result.0,
            &result.1,
            7,
            &CancellationToken::new(),
            f64::INFINITY,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::StatsWidthExceeded { .. }));
    }

    #[test]
    fn strict_mode_falls_back_to_process_wide_width_max() {
        let candles: Vec<Candle> = (0..200).map(|i| candle(i * 60_000, 100.0 + (i as f64 * 0.37).sin() * 5.0)).collect();
        let signals: Vec<Signal> = (0..200).map(|i| Signal { ts: i, direction: 1 }).collect();
        let result = execution_equity(&candles, &signals);
        let spec = ValidationSpec {
            permutation: None,
            bootstrap: Some(BootstrapSpec {
                trials: 100,
                ci_level: 0.90,
                width_threshold: None, // no per-run override
                metric: MetricKind::TotalReturn,
            }),
            walk_forward: None,
            strict: true,
        };
        let err = run(
            &spec,
            &candles,
            &signals,
            &RiskSpec::FixedFraction { fraction: 1.0 },
            &ExecutionSpec::default(),
            1000.0,
            &result.0,
            &result.1,
            7,
            &CancellationToken::new(),
            0.0, // process-wide BOOT_CI_WIDTH_MAX default, tighter than any real CI width
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::StatsWidthExceeded { .. }));
    }

    fn execution_equity(candles: &[Candle], signals: &[Signal]) -> (Vec<EquityBar>, Vec<Trade>) {
        let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
        let targets = crate::risk::apply(&RiskSpec::FixedFraction { fraction: 1.0 }, signals, &closes);
        let result = crate::execution::simulate(candles, &targets, &ExecutionSpec::default(), 1000.0).unwrap();
        (result.equity, result.trades)
    }

    #[test]
    fn permutation_spec_present_populates_report() {
        let candles: Vec<Candle> = (0..50).map(|i| candle(i * 60_000, 100.0 + i as f64)).collect();
        let signals: Vec<Signal> = (0..50).map(|i| Signal { ts: i, direction: if i % 2 == 0 { 1 } else { -1 } }).collect();
        let result = execution_equity(&candles, &signals);
        let spec = ValidationSpec {
            permutation: Some(PermutationSpec { trials: 20, metric: MetricKind::TotalReturn }),
            bootstrap: None,
            walk_forward: None,
            strict: false,
        };
        let report = run(
            &spec,
            &candles,
            &signals,
            &RiskSpec::FixedFraction { fraction: 1.0 },
            &ExecutionSpec::default(),
            1000.0,
            &result.0,
            &result.1,
            42,
            &CancellationToken::new(),
            f64::INFINITY,
        )
        .unwrap();
        assert!(report.permutation.is_some());
    }
}
