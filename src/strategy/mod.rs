//! Strategy layer (C4, §4.4): `(Candles, Features) -> Signals`.
//!
//! Strategies never compute position sizes (that's `risk.rs`) and never see
//! an unshifted feature column — the only inputs available here are
//! [`crate::indicators::Shifted`] views.

use std::collections::HashMap;

use crate::domain::{IndicatorSpec, Signal, StrategySpec};
use crate::errors::{EngineError, EngineResult};
use crate::indicators::{ColumnSet, IndicatorEngine};

/// A strategy produces one discrete `{-1, 0, +1}` signal per bar, reading
/// only causally-shifted feature columns. Which indicators a strategy needs
/// and how their columns get aliased is owned by that strategy's entry in
/// [`feature_columns`] (e.g. [`dual_sma_columns`]), not by this trait —
/// two same-named indicator calls at different params (two `sma`s) can't be
/// disambiguated by indicator name alone, so the aliasing has to live next
/// to the params that produce it.
pub trait Strategy {
    fn evaluate(&self, bar_count: usize, features: &ColumnSet) -> EngineResult<Vec<Signal>>;
}

/// Crossover strategy: `+1` when the fast SMA crosses above the slow SMA,
/// `-1` when it crosses below, `0` otherwise (including warm-up bars where
/// either average is undefined).
pub struct DualSma;

impl Strategy for DualSma {
    /// Expects `sma_fast` and `sma_slow` keys, produced by
    /// [`dual_sma_columns`] merging two separate `sma` indicator calls.
    fn evaluate(&self, bar_count: usize, features: &ColumnSet) -> EngineResult<Vec<Signal>> {
        let fast = features.get("sma_fast").ok_or_else(|| {
            EngineError::InvalidParam("dual_sma requires sma_fast column".to_string())
        })?;
        let slow = features.get("sma_slow").ok_or_else(|| {
            EngineError::InvalidParam("dual_sma requires sma_slow column".to_string())
        })?;

        let mut signals = Vec::with_capacity(bar_count);
        let mut prev_diff: Option<f64> = None;
        for t in 0..bar_count {
            let (f, s) = (fast.at(t), slow.at(t));
            let direction = match (f, s) {
                (Some(f), Some(s)) => {
                    let diff = f - s;
                    let dir = match prev_diff {
                        Some(prev) if prev <= 0.0 && diff > 0.0 => 1,
                        Some(prev) if prev >= 0.0 && diff < 0.0 => -1,
                        _ => 0,
                    };
                    prev_diff = Some(diff);
                    dir
                }
                _ => {
                    prev_diff = None;
                    0
                }
            };
            signals.push(Signal {
                ts: t as i64,
                direction,
            });
        }
        Ok(signals)
    }
}

/// Resolve a [`StrategySpec`] to a concrete [`Strategy`] implementation.
pub fn resolve(spec: &StrategySpec) -> EngineResult<Box<dyn Strategy>> {
    match spec.name.as_str() {
        "dual_sma" => Ok(Box::new(DualSma)),
        other => Err(EngineError::InvalidParam(format!(
            "unknown strategy: {other}"
        ))),
    }
}

/// Build the `ColumnSet` a strategy can consume from the engine's
/// single-key-per-call output, keyed by the orchestrator-chosen alias
/// (`"sma_fast"`, `"sma_slow"`, ...) rather than the raw indicator name.
pub fn merge_columns(pairs: Vec<(String, ColumnSet)>) -> ColumnSet {
    let mut merged = ColumnSet::new();
    for (alias, cols) in pairs {
        for (_, series) in cols {
            merged.insert(alias.clone(), series);
        }
    }
    merged
}

pub fn dual_sma_columns(
    engine: &IndicatorEngine,
    dataset_hash: &str,
    candles: &[crate::domain::Candle],
    params: &HashMap<String, f64>,
) -> EngineResult<ColumnSet> {
    let fast_window = params.get("fast").copied().unwrap_or(10.0);
    let slow_window = params.get("slow").copied().unwrap_or(30.0);
    let fast_spec = IndicatorSpec {
        name: "sma".to_string(),
        params: HashMap::from([("window".to_string(), fast_window)]),
    };
    let slow_spec = IndicatorSpec {
        name: "sma".to_string(),
        params: HashMap::from([("window".to_string(), slow_window)]),
    };
    // The two SMA windows are independent pure computations over the same
    // candle slice; running them on rayon's pool costs nothing in
    // determinism since each result is keyed and merged by name, not by
    // completion order.
    let (fast_cols, slow_cols) = rayon::join(
        || engine.compute(dataset_hash, candles, &fast_spec),
        || engine.compute(dataset_hash, candles, &slow_spec),
    );
    let (fast_cols, slow_cols) = (fast_cols?, slow_cols?);
    Ok(merge_columns(vec![
        ("sma_fast".to_string(), fast_cols),
        ("sma_slow".to_string(), slow_cols),
    ]))
}

/// Build the feature columns a resolved strategy needs, keyed the way that
/// strategy expects (orchestrator-facing dispatcher companion to
/// [`resolve`]). `dataset_hash` feeds [`IndicatorEngine`]'s feature cache key
/// so repeated evaluation against the same dataset reuses already-computed
/// columns instead of recomputing them.
pub fn feature_columns(
    spec: &crate::domain::StrategySpec,
    engine: &IndicatorEngine,
    dataset_hash: &str,
    candles: &[crate::domain::Candle],
) -> EngineResult<ColumnSet> {
    match spec.name.as_str() {
        "dual_sma" => dual_sma_columns(engine, dataset_hash, candles, &spec.params),
        other => Err(EngineError::InvalidParam(format!(
            "unknown strategy: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Candle;

    fn candle(ts: i64, c: f64) -> Candle {
        Candle {
            ts,
            o: c,
            h: c,
            l: c,
            c,
            v: 10,
            zero_volume: false,
        }
    }

    #[test]
    fn dual_sma_signals_crossover_up() {
        let engine = IndicatorEngine::new();
        // Downtrend then sharp uptrend so the fast average crosses above
        // the slow average partway through.
        let mut prices: Vec<f64> = (0..10).map(|i| 10.0 - i as f64 * 0.5).collect();
        prices.extend((0..10).map(|i| 5.5 + i as f64 * 2.0));
        let candles: Vec<Candle> = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| candle(i as i64 * 60_000, p))
            .collect();
        let mut params = HashMap::new();
        params.insert("fast".to_string(), 2.0);
        params.insert("slow".to_string(), 5.0);
        let cols = dual_sma_columns(&engine, "ds1", &candles, &params).unwrap();
        let strategy = DualSma;
        let signals = strategy.evaluate(candles.len(), &cols).unwrap();
        assert!(signals.iter().any(|s| s.direction == 1));
    }

    #[test]
    fn unknown_strategy_name_rejected() {
        let spec = StrategySpec {
            name: "nope".to_string(),
            params: HashMap::new(),
        };
        assert!(resolve(&spec).is_err());
    }
}
