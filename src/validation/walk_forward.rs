//! Walk-forward validation (§4.7): partition the bar range into `W`
//! sequential segments; for segment `i > 0`, report metrics computed only
//! on that segment (history 0..i-1 is never re-optimized against — no
//! parameter search happens here in v1).

use crate::domain::{Candle, EquityBar, ExecutionSpec, RiskSpec, Signal, Trade};
use crate::errors::{EngineError, EngineResult};
use crate::execution;
use crate::metrics;
use crate::risk;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SegmentResult {
    pub segment_index: u32,
    pub start_ts: i64,
    pub end_ts: i64,
    pub total_return: f64,
    pub trade_count: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WalkForwardResult {
    pub segments: Vec<SegmentResult>,
    pub proportion_profitable: f64,
    pub oos_return_std: f64,
}

pub fn run(
    candles: &[Candle],
    signals: &[Signal],
    risk_spec: &RiskSpec,
    exec_spec: &ExecutionSpec,
    initial_equity: f64,
    windows: u32,
) -> EngineResult<WalkForwardResult> {
    if windows < 2 {
        return Err(EngineError::InvalidParam(
            "walk_forward requires at least 2 windows".to_string(),
        ));
    }
    if candles.len() < windows as usize {
        return Err(EngineError::StatsInsufficientTrades(
            "not enough bars to form the requested walk-forward windows".to_string(),
        ));
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
    let segment_len = candles.len() / windows as usize;

    let mut segments = Vec::new();
    for i in 1..windows {
        let start = i as usize * segment_len;
        let end = if i as usize == windows as usize - 1 {
            candles.len()
        } else {
            (i as usize + 1) * segment_len
        };
        if start >= end {
            continue;
        }
        let seg_candles = &candles[start..end];
        let seg_signals = &signals[start..end];
        let seg_closes = &closes[start..end];
        let targets = risk::apply(risk_spec, seg_signals, seg_closes);
        let (equity, trades) = run_segment(seg_candles, &targets, exec_spec, initial_equity)?;
        let summary = metrics::summarize(&equity, &trades, initial_equity);
        segments.push(SegmentResult {
            segment_index: i,
            start_ts: seg_candles.first().map(|c| c.ts).unwrap_or(0),
            end_ts: seg_candles.last().map(|c| c.ts).unwrap_or(0),
            total_return: summary.total_return,
            trade_count: summary.trade_count,
        });
    }

    let profitable = segments.iter().filter(|s| s.total_return > 0.0).count();
    let proportion_profitable = if segments.is_empty() {
        0.0
    } else {
        profitable as f64 / segments.len() as f64
    };

    let mean_return = if segments.is_empty() {
        0.0
    } else {
        segments.iter().map(|s| s.total_return).sum::<f64>() / segments.len() as f64
    };
    let oos_return_std = if segments.len() < 2 {
        0.0
    } else {
        let variance = segments
            .iter()
            .map(|s| (s.total_return - mean_return).powi(2))
            .sum::<f64>()
            / (segments.len() as f64 - 1.0);
        variance.sqrt()
    };

    Ok(WalkForwardResult {
        segments,
        proportion_profitable,
        oos_return_std,
    })
}

fn run_segment(
    candles: &[Candle],
    targets: &[crate::domain::TargetPosition],
    exec_spec: &ExecutionSpec,
    initial_equity: f64,
) -> EngineResult<(Vec<EquityBar>, Vec<Trade>)> {
    let result = execution::simulate(candles, targets, exec_spec, initial_equity)?;
    Ok((result.equity, result.trades))
}
