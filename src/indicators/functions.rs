//! Pure indicator implementations. Each returns raw, unshifted,
//! index-aligned columns; [`super::IndicatorEngine::compute`] applies the
//! causality shift before handing anything to a caller.

use std::collections::{BTreeMap, HashMap};

use crate::domain::Candle;
use crate::errors::{EngineError, EngineResult};

fn window_param(params: &BTreeMap<String, f64>) -> EngineResult<usize> {
    let w = *params
        .get("window")
        .ok_or_else(|| EngineError::InvalidParam("missing window param".to_string()))?;
    if w < 1.0 || w.fract() != 0.0 {
        return Err(EngineError::InvalidParam(format!(
            "window must be a positive integer, got {w}"
        )));
    }
    Ok(w as usize)
}

pub fn sma(
    candles: &[Candle],
    params: &BTreeMap<String, f64>,
) -> EngineResult<HashMap<String, Vec<Option<f64>>>> {
    let window = window_param(params)?;
    let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
    let mut out = vec![None; closes.len()];
    for i in 0..closes.len() {
        if i + 1 >= window {
            let sum: f64 = closes[i + 1 - window..=i].iter().sum();
            out[i] = Some(sum / window as f64);
        }
    }
    let mut map = HashMap::new();
    map.insert("sma".to_string(), out);
    Ok(map)
}

pub fn ema(
    candles: &[Candle],
    params: &BTreeMap<String, f64>,
) -> EngineResult<HashMap<String, Vec<Option<f64>>>> {
    let window = window_param(params)?;
    let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
    let mut out = vec![None; closes.len()];
    if closes.len() >= window {
        let alpha = 2.0 / (window as f64 + 1.0);
        let seed: f64 = closes[..window].iter().sum::<f64>() / window as f64;
        out[window - 1] = Some(seed);
        let mut prev = seed;
        for i in window..closes.len() {
            let value = alpha * closes[i] + (1.0 - alpha) * prev;
            out[i] = Some(value);
            prev = value;
        }
    }
    let mut map = HashMap::new();
    map.insert("ema".to_string(), out);
    Ok(map)
}

pub fn rsi(
    candles: &[Candle],
    params: &BTreeMap<String, f64>,
) -> EngineResult<HashMap<String, Vec<Option<f64>>>> {
    let window = window_param(params)?;
    let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
    let mut out = vec![None; closes.len()];
    if closes.len() > window {
        let mut gains = 0.0;
        let mut losses = 0.0;
        for i in 1..=window {
            let delta = closes[i] - closes[i - 1];
            if delta >= 0.0 {
                gains += delta;
            } else {
                losses -= delta;
            }
        }
        let mut avg_gain = gains / window as f64;
        let mut avg_loss = losses / window as f64;
        out[window] = Some(rsi_from_averages(avg_gain, avg_loss));
        for i in (window + 1)..closes.len() {
            let delta = closes[i] - closes[i - 1];
            let (gain, loss) = if delta >= 0.0 { (delta, 0.0) } else { (0.0, -delta) };
            avg_gain = (avg_gain * (window as f64 - 1.0) + gain) / window as f64;
            avg_loss = (avg_loss * (window as f64 - 1.0) + loss) / window as f64;
            out[i] = Some(rsi_from_averages(avg_gain, avg_loss));
        }
    }
    let mut map = HashMap::new();
    map.insert("rsi".to_string(), out);
    Ok(map)
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

pub fn atr(
    candles: &[Candle],
    params: &BTreeMap<String, f64>,
) -> EngineResult<HashMap<String, Vec<Option<f64>>>> {
    let window = window_param(params)?;
    let mut true_ranges = vec![0.0; candles.len()];
    for i in 0..candles.len() {
        let hl = candles[i].h - candles[i].l;
        true_ranges[i] = if i == 0 {
            hl
        } else {
            let prev_close = candles[i - 1].c;
            hl.max((candles[i].h - prev_close).abs())
                .max((candles[i].l - prev_close).abs())
        };
    }
    let mut out = vec![None; candles.len()];
    for i in 0..candles.len() {
        if i + 1 >= window {
            let sum: f64 = true_ranges[i + 1 - window..=i].iter().sum();
            out[i] = Some(sum / window as f64);
        }
    }
    let mut map = HashMap::new();
    map.insert("atr".to_string(), out);
    Ok(map)
}

/// Sample standard deviation of simple bar-over-bar returns over `window`
/// trailing bars. Used directly by `risk::volatility_target` as well as
/// exposed as a named indicator.
pub fn realized_vol(
    candles: &[Candle],
    params: &BTreeMap<String, f64>,
) -> EngineResult<HashMap<String, Vec<Option<f64>>>> {
    let window = window_param(params)?;
    let returns: Vec<f64> = candles
        .windows(2)
        .map(|pair| {
            if pair[0].c == 0.0 {
                0.0
            } else {
                (pair[1].c - pair[0].c) / pair[0].c
            }
        })
        .collect();
    let mut out = vec![None; candles.len()];
    for i in 0..candles.len() {
        // returns[i-1] is the return ending at candle i; need `window`
        // trailing returns, i.e. returns[i-window..i].
        if i >= window {
            let slice = &returns[i - window..i];
            let mean = slice.iter().sum::<f64>() / window as f64;
            let variance =
                slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (window as f64 - 1.0).max(1.0);
            out[i] = Some(variance.sqrt());
        }
    }
    let mut map = HashMap::new();
    map.insert("realized_vol".to_string(), out);
    Ok(map)
}
