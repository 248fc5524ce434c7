//! Indicator registry & engine (C3, §4.3).
//!
//! Every indicator is a pure function over candles. Its output never
//! reaches a strategy directly: [`IndicatorEngine::compute`] always returns
//! [`Shifted`], a newtype with no unshifted accessor, so the causality
//! guard (shift-by-one-bar) is a type-system property rather than a
//! convention callers must remember to apply.

pub mod functions;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::canon;
use crate::domain::{Candle, IndicatorSpec};
use crate::errors::{EngineError, EngineResult};

/// A feature column that has already been shifted forward by one bar and
/// had its warm-up prefix nulled out. There is deliberately no way to get
/// the unshifted series back out of this type: strategies can only read
/// `at(t)`, which for row 0 is always `None`.
#[derive(Debug, Clone)]
pub struct Shifted<T> {
    values: Vec<Option<T>>,
}

impl<T: Copy> Shifted<T> {
    /// Shift a raw, index-aligned series forward by one bar: row `t` becomes
    /// the raw value that was at row `t - 1`; row 0 becomes `None`.
    fn from_raw(raw: &[Option<T>]) -> Self {
        let mut values = Vec::with_capacity(raw.len());
        values.push(None);
        if raw.len() > 1 {
            values.extend_from_slice(&raw[..raw.len() - 1]);
        }
        Self { values }
    }

    pub fn at(&self, index: usize) -> Option<T> {
        self.values.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The set of shifted columns one indicator call produces (most indicators
/// are single-column; a few, e.g. future bands, could be multi-column).
pub type ColumnSet = HashMap<String, Shifted<f64>>;

type IndicatorFn = fn(&[Candle], &BTreeMap<String, f64>) -> EngineResult<HashMap<String, Vec<Option<f64>>>>;

struct IndicatorEntry {
    func: IndicatorFn,
    required_params: &'static [&'static str],
}

/// Registry of known indicators, keyed by name. Built once; read-only
/// thereafter, a tagged-factory-table. `cache` is the §4.3 feature cache:
/// keyed by [`IndicatorEngine::cache_key`], populated on first computation
/// for a given `(dataset_hash, indicator_name, params, code_version)` tuple
/// and served from then on without recomputation.
pub struct IndicatorEngine {
    registry: HashMap<&'static str, IndicatorEntry>,
    cache: Mutex<HashMap<String, Arc<ColumnSet>>>,
}

const CODE_VERSION: &str = "1";

impl IndicatorEngine {
    pub fn new() -> Self {
        let mut registry: HashMap<&'static str, IndicatorEntry> = HashMap::new();
        registry.insert(
            "sma",
            IndicatorEntry {
                func: functions::sma,
                required_params: &["window"],
            },
        );
        registry.insert(
            "ema",
            IndicatorEntry {
                func: functions::ema,
                required_params: &["window"],
            },
        );
        registry.insert(
            "rsi",
            IndicatorEntry {
                func: functions::rsi,
                required_params: &["window"],
            },
        );
        registry.insert(
            "atr",
            IndicatorEntry {
                func: functions::atr,
                required_params: &["window"],
            },
        );
        registry.insert(
            "realized_vol",
            IndicatorEntry {
                func: functions::realized_vol,
                required_params: &["window"],
            },
        );
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Feature cache key per §4.3: `digest({dataset_hash, indicator_name,
    /// version, params_sorted, code_version})`.
    pub fn cache_key(&self, dataset_hash: &str, spec: &IndicatorSpec) -> EngineResult<String> {
        let params_sorted: BTreeMap<String, f64> = spec.params.clone().into_iter().collect();
        let keyed = serde_json::json!({
            "dataset_hash": dataset_hash,
            "indicator_name": spec.name,
            "version": 1,
            "params_sorted": params_sorted,
            "code_version": CODE_VERSION,
        });
        canon::digest_value(&keyed)
    }

    /// Compute one indicator's columns over `candles`, returning the
    /// causally-shifted view. Unknown params or a missing required param is
    /// `InvalidIndicatorParams`; an unknown indicator name is also rejected
    /// here since it has no registered dependency to satisfy. A cache hit on
    /// `cache_key(dataset_hash, spec)` returns an already-computed column set
    /// without touching `candles` again; a miss computes once and populates
    /// the cache for subsequent calls against the same dataset.
    pub fn compute(
        &self,
        dataset_hash: &str,
        candles: &[Candle],
        spec: &IndicatorSpec,
    ) -> EngineResult<ColumnSet> {
        let entry = self.registry.get(spec.name.as_str()).ok_or_else(|| {
            EngineError::InvalidParam(format!("unknown indicator: {}", spec.name))
        })?;
        let params_sorted: BTreeMap<String, f64> = spec.params.clone().into_iter().collect();
        for required in entry.required_params {
            if !params_sorted.contains_key(*required) {
                return Err(EngineError::InvalidParam(format!(
                    "indicator {} missing required param {}",
                    spec.name, required
                )));
            }
        }

        let key = self.cache_key(dataset_hash, spec)?;
        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok((**cached).clone());
        }

        let raw = (entry.func)(candles, &params_sorted)?;
        let columns: ColumnSet = raw
            .into_iter()
            .map(|(col, series)| (col, Shifted::from_raw(&series)))
            .collect();
        let shared = Arc::new(columns);
        self.cache.lock().insert(key, shared.clone());
        Ok((*shared).clone())
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

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
    fn shifted_row_zero_is_always_none() {
        let raw = vec![Some(1.0), Some(2.0), Some(3.0)];
        let shifted = Shifted::from_raw(&raw);
        assert_eq!(shifted.at(0), None);
        assert_eq!(shifted.at(1), Some(1.0));
        assert_eq!(shifted.at(2), Some(2.0));
    }

    #[test]
    fn unknown_indicator_is_invalid_param() {
        let engine = IndicatorEngine::new();
        let candles: Vec<Candle> = (0..5).map(|i| candle(i * 60_000, 1.0 + i as f64)).collect();
        let spec = IndicatorSpec {
            name: "nope".to_string(),
            params: StdHashMap::new(),
        };
        let err = engine.compute("ds1", &candles, &spec).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParam(_)));
    }

    #[test]
    fn missing_required_param_is_invalid_param() {
        let engine = IndicatorEngine::new();
        let candles: Vec<Candle> = (0..5).map(|i| candle(i * 60_000, 1.0 + i as f64)).collect();
        let spec = IndicatorSpec {
            name: "sma".to_string(),
            params: StdHashMap::new(),
        };
        let err = engine.compute("ds1", &candles, &spec).unwrap_err();
        assert!(matches!(err, EngineError::InvalidParam(_)));
    }

    #[test]
    fn cache_key_is_stable_under_param_reordering() {
        let engine = IndicatorEngine::new();
        let mut p1 = StdHashMap::new();
        p1.insert("window".to_string(), 3.0);
        p1.insert("extra".to_string(), 1.0);
        let mut p2 = StdHashMap::new();
        p2.insert("extra".to_string(), 1.0);
        p2.insert("window".to_string(), 3.0);
        let s1 = IndicatorSpec {
            name: "sma".to_string(),
            params: p1,
        };
        let s2 = IndicatorSpec {
            name: "sma".to_string(),
            params: p2,
        };
        assert_eq!(
            engine.cache_key("hash", &s1).unwrap(),
            engine.cache_key("hash", &s2).unwrap()
        );
    }

    #[test]
    fn sma_respects_warmup_window() {
        let engine = IndicatorEngine::new();
        let candles: Vec<Candle> = (0..5).map(|i| candle(i * 60_000, (i + 1) as f64)).collect();
        let mut params = StdHashMap::new();
        params.insert("window".to_string(), 3.0);
        let spec = IndicatorSpec {
            name: "sma".to_string(),
            params,
        };
        let cols = engine.compute("ds1", &candles, &spec).unwrap();
        let sma = &cols["sma"];
        // raw sma[2] = mean(1,2,3) = 2.0; after +1 shift it lands at index 3.
        assert_eq!(sma.at(0), None);
        assert_eq!(sma.at(1), None);
        assert_eq!(sma.at(2), None);
        assert_eq!(sma.at(3), Some(2.0));
    }

    #[test]
    fn compute_populates_and_serves_the_feature_cache() {
        let engine = IndicatorEngine::new();
        let candles: Vec<Candle> = (0..5).map(|i| candle(i * 60_000, (i + 1) as f64)).collect();
        let mut params = StdHashMap::new();
        params.insert("window".to_string(), 3.0);
        let spec = IndicatorSpec {
            name: "sma".to_string(),
            params,
        };

        assert_eq!(engine.cache_len(), 0);
        let first = engine.compute("ds1", &candles, &spec).unwrap();
        assert_eq!(engine.cache_len(), 1);

        // Same dataset_hash + spec: served from cache, same values, no
        // growth in cache size.
        let second = engine.compute("ds1", &candles, &spec).unwrap();
        assert_eq!(engine.cache_len(), 1);
        assert_eq!(first["sma"].at(3), second["sma"].at(3));

        // A different dataset_hash is a distinct cache key.
        engine.compute("ds2", &candles, &spec).unwrap();
        assert_eq!(engine.cache_len(), 2);
    }
}
