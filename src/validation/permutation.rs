//! Permutation test (§4.7): shuffle signal order (not returns) N
//! times, recompute the chosen metric, and compare against the actual.

use rand::seq::SliceRandom;

use crate::domain::{Candle, ExecutionSpec, MetricKind, RiskSpec, Signal, TargetPosition};
use crate::errors::{EngineError, EngineResult};
use crate::execution;
use crate::metrics;
use crate::risk;
use crate::validation::cancel::{CancellationToken, CHECK_INTERVAL};
use crate::validation::seed::rng_for;

const MIN_TRADE_COUNT: u64 = 5;
const METHOD_NAME: &str = "permutation";

#[derive(Debug, Clone, serde::Serialize)]
pub struct PermutationResult {
    pub p_value: f64,
    pub actual_metric: f64,
    pub trials_run: u64,
    pub skipped: bool,
}

fn metric_value(kind: MetricKind, summary: &crate::domain::MetricsSummary) -> f64 {
    match kind {
        MetricKind::TotalReturn => summary.total_return,
        MetricKind::Sharpe => summary.sharpe.unwrap_or(0.0),
        MetricKind::Sortino => summary.sortino.unwrap_or(0.0),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn run(
    candles: &[Candle],
    signals: &[Signal],
    risk_spec: &RiskSpec,
    exec_spec: &ExecutionSpec,
    initial_equity: f64,
    trials: u64,
    metric: MetricKind,
    seed_root: u64,
    actual_trade_count: u64,
    cancel: &CancellationToken,
) -> EngineResult<PermutationResult> {
    let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
    let actual_targets = risk::apply(risk_spec, signals, &closes);
    let actual_exec = execution::simulate(candles, &actual_targets, exec_spec, initial_equity)?;
    let actual_summary = metrics::summarize(&actual_exec.equity, &actual_exec.trades, initial_equity);
    let actual_metric = metric_value(metric, &actual_summary);

    if actual_trade_count < MIN_TRADE_COUNT {
        return Ok(PermutationResult {
            p_value: 1.0,
            actual_metric,
            trials_run: 0,
            skipped: true,
        });
    }

    let mut at_least_as_extreme: u64 = 0;
    for i in 0..trials {
        if i % CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let mut rng = rng_for(seed_root, METHOD_NAME, i);
        let mut shuffled: Vec<Signal> = signals.to_vec();
        let mut directions: Vec<i8> = shuffled.iter().map(|s| s.direction).collect();
        directions.shuffle(&mut rng);
        for (s, d) in shuffled.iter_mut().zip(directions) {
            s.direction = d;
        }
        let targets: Vec<TargetPosition> = risk::apply(risk_spec, &shuffled, &closes);
        let exec = execution::simulate(candles, &targets, exec_spec, initial_equity)?;
        let summary = metrics::summarize(&exec.equity, &exec.trades, initial_equity);
        let perm_metric = metric_value(metric, &summary);
        if perm_metric >= actual_metric {
            at_least_as_extreme += 1;
        }
    }

    let p_value = (at_least_as_extreme as f64 + 1.0) / (trials as f64 + 1.0);
    Ok(PermutationResult {
        p_value,
        actual_metric,
        trials_run: trials,
        skipped: false,
    })
}
