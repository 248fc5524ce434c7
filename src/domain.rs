//! Core data model (§3): candles, configuration, signals, trades,
//! equity, metrics, validation artifacts, events, manifests.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One OHLCV observation at a fixed UTC-ms timestamp. Immutable post-ingest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: i64,
    pub zero_volume: bool,
}

/// Per-`(symbol, timeframe)` dataset provenance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub symbol: String,
    pub timeframe: String,
    pub data_hash: String,
    pub calendar_id: String,
    pub first_ts: i64,
    pub last_ts: i64,
    pub row_count: usize,
    pub anomaly_counters: AnomalyCounters,
    pub observed_bar_seconds: f64,
    pub declared_bar_seconds: f64,
    pub timeframe_ok: bool,
}

/// Counters accumulated during ingestion (§4.2 steps 1,3,4,5,7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyCounters {
    pub rows_dropped_missing: u64,
    pub duplicates_dropped: u64,
    pub duplicate_sample_ts: Vec<i64>,
    pub future_rows_dropped: u64,
    pub zero_volume_rows: u64,
    pub expected_closures: u64,
    pub unexpected_gaps: u64,
}

/// Direction a strategy wants to hold, `-1`, `0`, or `+1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub ts: i64,
    pub direction: i8,
}

/// Post-risk-clamp target position, `fraction in [-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetPosition {
    pub ts: i64,
    pub fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// An executed fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ts: i64,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub fees: f64,
    pub slippage: f64,
    /// Set to `"vwap_fallback_open"` when `vwap_next` pricing fell back to
    /// `open_next` because the fill bar had zero volume (§9 Open
    /// Question resolution); `None` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Per-bar account state after mark-to-market.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityBar {
    pub ts: i64,
    pub nav: f64,
    pub peak_nav: f64,
    pub drawdown: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub position_after: f64,
    pub trade_count_cum: u64,
}

/// Pure aggregate metrics over equity/trades. `None` is the defined
/// sentinel for degenerate (zero-trade / zero-volatility) cases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_return: f64,
    pub sharpe: Option<f64>,
    pub sortino: Option<f64>,
    pub max_drawdown: f64,
    pub trade_count: u64,
    pub win_rate: Option<f64>,
    pub exposure_pct: f64,
    pub turnover: f64,
}

/// `{ run_hash, id, ts, type, payload }` — see `events.rs` for the buffer
/// that owns the monotonic `id` sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_hash: String,
    pub id: u64,
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    DataLoaded,
    FeaturesReady,
    StrategyDone,
    RiskDone,
    ExecutionDone,
    MetricsDone,
    ValidationDone,
    ArtifactsFinalized,
    Completed,
    Heartbeat,
    Cancelled,
    Failed,
}

impl EventType {
    /// Whether this event type ends the stream (§4.9 stream mode).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One content-addressed file inside a run's artifact directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// The chained, content-addressed manifest for a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub run_hash: String,
    pub created_at: String,
    pub symbol: String,
    pub timeframe: String,
    pub data_hash: String,
    pub calendar_id: String,
    pub files: Vec<ArtifactDescriptor>,
    pub chain_prev: Option<String>,
    pub manifest_hash: String,
}

/// Retention tier assigned to a completed run (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTier {
    Full,
    ManifestOnly,
    Pinned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionState {
    pub tier: RetentionTier,
    pub primary_metric: Option<f64>,
    pub rank_within_strategy: Option<u32>,
    pub pinned_by: Option<String>,
    pub pinned_at: Option<String>,
}

// ---------------------------------------------------------------------
// RunConfig
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    pub params: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    pub params: HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum RiskSpec {
    FixedFraction { fraction: f64 },
    VolatilityTarget {
        base: f64,
        target_vol: f64,
        lookback: usize,
    },
    KellyFraction { base: f64, p: f64, r: f64 },
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPrice {
    OpenNext,
    MidNext,
    VwapNext,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlippageModel {
    None,
    SpreadPct { half_spread: f64 },
    ParticipationRate { participation_pct: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub fill_price: FillPrice,
    pub slippage_model: SlippageModel,
    pub slippage_bps: f64,
    pub fee_bps: f64,
    pub commission_per_share: f64,
    pub skip_zero_volume: bool,
    pub auto_flatten_end: bool,
    pub borrow_bps_per_year: f64,
}

impl Default for ExecutionSpec {
    fn default() -> Self {
        Self {
            fill_price: FillPrice::OpenNext,
            slippage_model: SlippageModel::None,
            slippage_bps: 0.0,
            fee_bps: 0.0,
            commission_per_share: 0.0,
            skip_zero_volume: true,
            auto_flatten_end: true,
            borrow_bps_per_year: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PermutationSpec {
    pub trials: u64,
    pub metric: MetricKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    TotalReturn,
    Sharpe,
    Sortino,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSpec {
    pub trials: u64,
    pub ci_level: f64,
    pub width_threshold: Option<f64>,
    pub metric: MetricKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkForwardSpec {
    pub windows: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    pub permutation: Option<PermutationSpec>,
    pub bootstrap: Option<BootstrapSpec>,
    pub walk_forward: Option<WalkForwardSpec>,
    pub strict: bool,
}

/// Canonicalized client submission. Mutated only before hashing; never
/// after (§3 RunConfig invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub symbol: String,
    pub timeframe: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub indicators: Vec<IndicatorSpec>,
    pub strategy: StrategySpec,
    pub risk: RiskSpec,
    pub execution: ExecutionSpec,
    pub validation: ValidationSpec,
    pub seed: u64,
}
