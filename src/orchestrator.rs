//! Run orchestrator (C10, §4.10): the state machine that turns a
//! submitted [`RunConfig`] into a completed, artifact-backed run.
//!
//! Phase sequencing and cooperative-cancel checks follow the same
//! discipline a single-process multi-phase backtest loop would use,
//! generalized here from book/queue replay phases to the eight
//! data->artifact phases this module's state machine names. Single-flight
//! dataset loading and idempotent submit are this engine's own additions
//! for running many concurrent submitted backtests against a long-lived
//! server process, rather than one backtest per invocation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use crate::artifacts::{self, RunArtifacts};
use crate::canon;
use crate::config::EngineConfig;
use crate::dataset::{ingest_csv, Dataset, SourceDeclaration};
use crate::domain::{Event, EventType, Manifest, RunConfig};
use crate::errors::{EngineError, EngineResult};
use crate::events::EventBuffer;
use crate::indicators::IndicatorEngine;
use crate::registry::{ErrorRecord, Hashes, RunRecord, RunRegistry, RunStatus};
use crate::retention::{self, RetentionPolicy};
use crate::validation::cancel::CancellationToken;

/// Equity every run starts from. Not exposed in `RunConfig` — §3
/// leaves starting capital out of the hashed identity, and backtests are
/// compared on returns/ratios, not absolute NAV, so this is a process-wide
/// constant rather than a per-run parameter.
pub const DEFAULT_INITIAL_EQUITY: f64 = 100_000.0;

/// Version string folded into `run_hash` and indicator cache keys. Bump
/// whenever a change to this crate could change a run's output for the
/// same `RunConfig`.
pub const CODE_VERSION: &str = "1";

/// Compute `run_hash = digest(RunConfig ⊕ {_dataset: data_hash, code_version})`
/// (§4.10 step 1). The two extra keys are merged directly into the
/// top-level serialized object, not nested under a wrapper key, so that
/// adding them doesn't change the shape clients already send.
pub fn compute_run_hash(config: &RunConfig, data_hash: &str) -> EngineResult<String> {
    let mut value = serde_json::to_value(config)
        .map_err(|e| EngineError::InvalidParam(format!("RunConfig not JSON-representable: {e}")))?;
    let obj = value
        .as_object_mut()
        .ok_or_else(|| EngineError::internal("RunConfig did not serialize to an object"))?;
    obj.insert("_dataset".to_string(), json!(data_hash));
    obj.insert("code_version".to_string(), json!(CODE_VERSION));
    canon::digest_value(&value)
}

/// Result of [`Engine::submit`].
#[derive(Debug, Clone)]
pub struct SubmitResponse {
    pub run_hash: String,
    pub run_id: String,
    /// `true` if this call created a new run; `false` if it attached to an
    /// existing (possibly already-completed) run with the same `run_hash`.
    pub attached_existing: bool,
    pub status: RunStatus,
}

/// Shared engine state. One instance per process, held behind `Arc` by the
/// API layer and the CLI binary alike.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<RunRegistry>,
    indicators: IndicatorEngine,
    dataset_cache: AsyncMutex<HashMap<String, Arc<Dataset>>>,
    event_buffers: RwLock<HashMap<String, Arc<SyncMutex<EventBuffer>>>>,
    cancel_tokens: RwLock<HashMap<String, CancellationToken>>,
    inflight: SyncMutex<HashSet<String>>,
}

impl Engine {
    pub fn new(config: EngineConfig, registry: Arc<RunRegistry>) -> Self {
        Self {
            config,
            registry,
            indicators: IndicatorEngine::new(),
            dataset_cache: AsyncMutex::new(HashMap::new()),
            event_buffers: RwLock::new(HashMap::new()),
            cancel_tokens: RwLock::new(HashMap::new()),
            inflight: SyncMutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// `{dataset_root}/{symbol}.csv`-by-convention path, so callers never
    /// have to send a filesystem path over the wire.
    pub fn dataset_path(&self, symbol: &str) -> std::path::PathBuf {
        self.config.dataset_root.join(format!("{symbol}.csv"))
    }

    /// Single-flight dataset loader: concurrent submits for the same symbol
    /// ingest once and share the result. Holding `dataset_cache`'s lock
    /// across the ingest `.await` point (the lock itself just guards a
    /// plain `HashMap`, but the surrounding function is async) is why this
    /// is a `tokio::sync::Mutex` rather than `parking_lot` here.
    pub async fn get_or_load_dataset(&self, symbol: &str, decl: &SourceDeclaration, now_utc_ms: i64) -> EngineResult<Arc<Dataset>> {
        let mut cache = self.dataset_cache.lock().await;
        if let Some(existing) = cache.get(symbol) {
            return Ok(existing.clone());
        }
        let path = self.dataset_path(symbol);
        let ingested = ingest_csv(&path, decl, now_utc_ms, self.config.timeframe_strict)?;
        let dataset = Arc::new(Dataset::from(ingested));
        cache.insert(symbol.to_string(), dataset.clone());
        Ok(dataset)
    }

    /// Idempotent submit (§4.10 step 2): same `run_hash` twice attaches
    /// to the existing run rather than re-running. A limitation accepted
    /// for this engine: an in-flight run recorded in `inflight` is only
    /// known for the lifetime of this process — after a restart, a
    /// `status=running` row with no live task is surfaced as-is (clients
    /// resubmitting see `running` and should poll, not assume progress).
    pub async fn submit(
        self: &Arc<Self>,
        config: RunConfig,
        data_hash: &str,
        symbol: &str,
        created_at: impl Into<String>,
    ) -> EngineResult<SubmitResponse> {
        let run_hash = compute_run_hash(&config, data_hash)?;

        if let Some(existing) = self.registry.find(&run_hash)? {
            return Ok(SubmitResponse {
                run_hash: existing.run_hash.clone(),
                run_id: existing.run_id.clone(),
                attached_existing: true,
                status: existing.status,
            });
        }

        {
            let mut inflight = self.inflight.lock();
            if !inflight.insert(run_hash.clone()) {
                return Ok(SubmitResponse {
                    run_hash: run_hash.clone(),
                    run_id: String::new(),
                    attached_existing: true,
                    status: RunStatus::Queued,
                });
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let config_json = serde_json::to_string(&config)
            .map_err(|e| EngineError::InvalidParam(format!("RunConfig not serializable: {e}")))?;
        let created_at = created_at.into();

        match self.registry.create_queued(
            &run_hash,
            &run_id,
            &config_json,
            symbol,
            &config.strategy.name,
            data_hash,
            &created_at,
        ) {
            Ok(()) => {}
            Err(EngineError::Conflict(_)) => {
                self.inflight.lock().remove(&run_hash);
                let existing = self
                    .registry
                    .find(&run_hash)?
                    .ok_or_else(|| EngineError::internal("run vanished after conflict"))?;
                return Ok(SubmitResponse {
                    run_hash: existing.run_hash,
                    run_id: existing.run_id,
                    attached_existing: true,
                    status: existing.status,
                });
            }
            Err(e) => {
                self.inflight.lock().remove(&run_hash);
                return Err(e);
            }
        }

        let buffer = Arc::new(SyncMutex::new(EventBuffer::new(run_hash.clone())));
        self.event_buffers.write().insert(run_hash.clone(), buffer.clone());
        let cancel = CancellationToken::new();
        self.cancel_tokens.write().insert(run_hash.clone(), cancel.clone());

        let engine = self.clone();
        let run_hash_for_task = run_hash.clone();
        let run_id_for_task = run_id.clone();
        tokio::spawn(async move {
            engine
                .run_pipeline(run_hash_for_task, run_id_for_task, config, symbol.to_string(), buffer, cancel)
                .await;
        });

        Ok(SubmitResponse {
            run_hash,
            run_id,
            attached_existing: false,
            status: RunStatus::Queued,
        })
    }

    /// Request cooperative cancellation. A no-op if the run is already
    /// terminal or unknown (§4.10: cancel is idempotent).
    pub fn cancel(&self, run_hash: &str) -> EngineResult<()> {
        let tokens = self.cancel_tokens.read();
        if let Some(token) = tokens.get(run_hash) {
            token.cancel();
        }
        Ok(())
    }

    pub fn get_event_buffer(&self, run_hash: &str) -> Option<Arc<SyncMutex<EventBuffer>>> {
        self.event_buffers.read().get(run_hash).cloned()
    }

    /// Rehydrate a `manifest_only` run (§4.11): deterministically rebuild
    /// its bulk artifacts from the stored config and the still-cached
    /// dataset, then promote it back to `full`. Fails with
    /// [`EngineError::RehydrateUnavailable`] if the source dataset can no
    /// longer be ingested, if its content has drifted from the `data_hash`
    /// this run was identified against, or if the rebuild doesn't
    /// reproduce the original `manifest_hash` — any of those means the
    /// inputs this run depended on are no longer available unchanged.
    pub async fn rehydrate(self: &Arc<Self>, run_hash: &str, actor: &str, now: &str) -> EngineResult<()> {
        let record = self
            .registry
            .find(run_hash)?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_hash}")))?;

        if record.status != RunStatus::Completed {
            return Err(EngineError::InvalidParam(format!(
                "run {run_hash} is not completed (status={:?}); only completed runs can be rehydrated",
                record.status
            )));
        }
        if record.retention_tier == crate::domain::RetentionTier::Full {
            return Ok(()); // already full: rehydrate is a no-op, per idempotent-operation discipline.
        }

        let config: RunConfig = serde_json::from_str(&record.config_json)
            .map_err(|e| EngineError::internal(format!("stored config corrupt: {e}")))?;
        let stored_manifest: Manifest = serde_json::from_str(
            record
                .manifest_json
                .as_deref()
                .ok_or_else(|| EngineError::internal("completed run missing manifest_json"))?,
        )
        .map_err(|e| EngineError::internal(format!("stored manifest corrupt: {e}")))?;

        let decl = SourceDeclaration {
            symbol: record.symbol.clone(),
            timeframe: config.timeframe.clone(),
            source_tz_offset_minutes: 0,
            calendar_id: stored_manifest.calendar_id.clone(),
        };
        let dataset = self
            .get_or_load_dataset(&record.symbol, &decl, now_ms())
            .await
            .map_err(|e| EngineError::RehydrateUnavailable(format!("source dataset unavailable: {e}")))?;
        if dataset.metadata.data_hash != record.data_hash {
            return Err(EngineError::RehydrateUnavailable(format!(
                "source dataset content has drifted (expected data_hash={}, found {})",
                record.data_hash, dataset.metadata.data_hash
            )));
        }

        let candles = dataset.slice(config.start_ms, config.end_ms);
        let features = crate::strategy::feature_columns(
            &config.strategy,
            &self.indicators,
            &dataset.metadata.data_hash,
            &candles,
        )?;
        let strategy = crate::strategy::resolve(&config.strategy)?;
        let signals = strategy.evaluate(candles.len(), &features)?;
        let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
        let targets = crate::risk::apply(&config.risk, &signals, &closes);
        let exec_result = crate::execution::simulate(&candles, &targets, &config.execution, DEFAULT_INITIAL_EQUITY)?;
        crate::execution::verify_drawdown_invariant(&exec_result.equity, self.config.drawdown_epsilon)?;
        let metrics = crate::metrics::summarize(&exec_result.equity, &exec_result.trades, DEFAULT_INITIAL_EQUITY);
        let cancel = CancellationToken::new();
        let validation = crate::validation::run(
            &config.validation,
            &candles,
            &signals,
            &config.risk,
            &config.execution,
            DEFAULT_INITIAL_EQUITY,
            &exec_result.equity,
            &exec_result.trades,
            config.seed,
            &cancel,
            self.config.boot_ci_width_max,
        )?;

        let summary = json!({"run_hash": run_hash, "metrics": metrics});
        let run_artifacts = RunArtifacts {
            run_id: &record.run_id,
            run_hash,
            created_at: &stored_manifest.created_at,
            symbol: &dataset.metadata.symbol,
            timeframe: &dataset.metadata.timeframe,
            data_hash: &dataset.metadata.data_hash,
            calendar_id: &dataset.metadata.calendar_id,
            equity: &exec_result.equity,
            trades: &exec_result.trades,
            metrics: &metrics,
            validation: &validation,
            summary: &summary,
            chain_prev: stored_manifest.chain_prev.clone(),
        };
        let rebuilt = artifacts::rehydrate_run(&self.config.artifacts_root, &run_artifacts)?;
        if rebuilt.manifest_hash != stored_manifest.manifest_hash {
            return Err(EngineError::RehydrateUnavailable(
                "rebuilt manifest_hash diverged from the original; inputs are not reproducible".to_string(),
            ));
        }

        let hashes = compute_attestation_hashes(&rebuilt, &metrics, &exec_result.equity)?;
        let manifest_json = serde_json::to_string(&rebuilt)
            .map_err(|e| EngineError::Persist(format!("manifest not serializable: {e}")))?;
        self.registry.mark_completed(
            run_hash,
            &manifest_json,
            &hashes,
            record.primary_metric,
            now,
        )?;
        self.registry.set_retention_tier(run_hash, crate::domain::RetentionTier::Full)?;
        self.registry.audit_rehydrate(run_hash, now, actor)?;
        Ok(())
    }

    /// Walk all eight phases, emitting one event per phase boundary and
    /// checking `cancel` before each. Never returns an error to the
    /// caller — failure and cancellation are both recorded into the
    /// registry and the event buffer, since this runs detached on a spawned
    /// task with nobody awaiting its result.
    async fn run_pipeline(
        self: Arc<Self>,
        run_hash: String,
        run_id: String,
        config: RunConfig,
        symbol: String,
        buffer: Arc<SyncMutex<EventBuffer>>,
        cancel: CancellationToken,
    ) {
        let result = self.run_pipeline_inner(&run_hash, &run_id, &config, &symbol, &buffer, &cancel).await;
        self.inflight.lock().remove(&run_hash);

        let now = now_iso();
        match result {
            Ok(()) => {}
            Err(EngineError::Cancelled) => {
                let _ = self.registry.mark_cancelled(&run_hash, &now);
                buffer.lock().push(EventType::Cancelled, json!({}), now);
            }
            Err(e) => {
                let error = ErrorRecord {
                    code: e.code().to_string(),
                    phase: e.phase().map(str::to_string),
                    message: e.to_string(),
                };
                let _ = self.registry.mark_failed(&run_hash, &error, &now);
                buffer.lock().push(
                    EventType::Failed,
                    json!({"code": error.code, "phase": error.phase, "message": error.message}),
                    now,
                );
            }
        }
    }

    async fn run_pipeline_inner(
        &self,
        run_hash: &str,
        run_id: &str,
        config: &RunConfig,
        symbol: &str,
        buffer: &Arc<SyncMutex<EventBuffer>>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.registry.mark_running(run_hash)?;
        let created_at = now_iso();
        buffer.lock().push(EventType::Started, json!({}), created_at.clone());
        cancel.check()?;

        // Phase 1: data loading.
        let decl = SourceDeclaration {
            symbol: symbol.to_string(),
            timeframe: config.timeframe.clone(),
            source_tz_offset_minutes: 0,
            calendar_id: "24x7".to_string(),
        };
        let dataset = self.get_or_load_dataset(symbol, &decl, now_ms()).await?;
        let candles = dataset.slice(config.start_ms, config.end_ms);
        if candles.is_empty() {
            return Err(EngineError::SchemaMismatch(
                "no candles in requested [start_ms, end_ms] window".to_string(),
            ));
        }
        buffer.lock().push(
            EventType::DataLoaded,
            json!({"row_count": candles.len(), "data_hash": dataset.metadata.data_hash}),
            now_iso(),
        );
        cancel.check()?;

        // Phase 2: feature compute.
        let features = crate::strategy::feature_columns(
            &config.strategy,
            &self.indicators,
            &dataset.metadata.data_hash,
            &candles,
        )?;
        buffer.lock().push(EventType::FeaturesReady, json!({}), now_iso());
        cancel.check()?;

        // Phase 3: strategy evaluation.
        let strategy = crate::strategy::resolve(&config.strategy)?;
        let signals = strategy.evaluate(candles.len(), &features)?;
        buffer.lock().push(EventType::StrategyDone, json!({}), now_iso());
        cancel.check()?;

        // Phase 4: risk sizing.
        let closes: Vec<f64> = candles.iter().map(|c| c.c).collect();
        let targets = crate::risk::apply(&config.risk, &signals, &closes);
        buffer.lock().push(EventType::RiskDone, json!({}), now_iso());
        cancel.check()?;

        // Phase 5: execution simulation.
        let exec_result = crate::execution::simulate(&candles, &targets, &config.execution, DEFAULT_INITIAL_EQUITY)?;
        crate::execution::verify_drawdown_invariant(&exec_result.equity, self.config.drawdown_epsilon)?;
        buffer.lock().push(
            EventType::ExecutionDone,
            json!({"trade_count": exec_result.trades.len()}),
            now_iso(),
        );
        cancel.check()?;

        // Phase 6: metrics.
        let metrics = crate::metrics::summarize(&exec_result.equity, &exec_result.trades, DEFAULT_INITIAL_EQUITY);
        buffer.lock().push(EventType::MetricsDone, json!({}), now_iso());
        cancel.check()?;

        // Phase 7: validation.
        let validation = crate::validation::run(
            &config.validation,
            &candles,
            &signals,
            &config.risk,
            &config.execution,
            DEFAULT_INITIAL_EQUITY,
            &exec_result.equity,
            &exec_result.trades,
            config.seed,
            cancel,
            self.config.boot_ci_width_max,
        )?;
        buffer.lock().push(EventType::ValidationDone, json!({}), now_iso());
        cancel.check()?;

        // Phase 8: artifact finalization.
        let chain_prev = self.registry.latest_completed_manifest_hash()?;
        let summary = json!({
            "run_hash": run_hash,
            "metrics": metrics,
        });
        let run_artifacts = RunArtifacts {
            run_id,
            run_hash,
            created_at: &created_at,
            symbol: &dataset.metadata.symbol,
            timeframe: &dataset.metadata.timeframe,
            data_hash: &dataset.metadata.data_hash,
            calendar_id: &dataset.metadata.calendar_id,
            equity: &exec_result.equity,
            trades: &exec_result.trades,
            metrics: &metrics,
            validation: &validation,
            summary: &summary,
            chain_prev,
        };
        let manifest = artifacts::write_run(&self.config.artifacts_root, &run_artifacts)?;
        let hashes = compute_attestation_hashes(&manifest, &metrics, &exec_result.equity)?;
        let manifest_json = serde_json::to_string(&manifest)
            .map_err(|e| EngineError::Persist(format!("manifest not serializable: {e}")))?;

        self.registry.mark_completed(
            run_hash,
            &manifest_json,
            &hashes,
            Some(metrics.total_return),
            &now_iso(),
        )?;
        buffer.lock().push(
            EventType::ArtifactsFinalized,
            json!({"manifest_hash": manifest.manifest_hash}),
            now_iso(),
        );
        buffer.lock().push(EventType::Completed, json!({}), now_iso());

        // Spec §4.11: retention policy is applied at finalize. A periodic
        // background sweep (see `main.rs`) also re-applies it so that a
        // run's ranking can still shift as *other* runs complete later.
        let policy = RetentionPolicy {
            global_keep: self.config.retention_n_global,
            per_strategy_keep: self.config.retention_k_per_strategy,
        };
        if let Err(e) = retention::apply(&self.registry, &self.config.artifacts_root, policy, &now_iso()) {
            tracing::warn!(error = %e, run_hash = %run_hash, "retention pass at finalize failed");
        }

        Ok(())
    }
}

/// Attestation bundle (§4.10 step 8 / §6 `GET /runs/{run_hash}/hashes`):
/// `manifest_hash` comes straight from the chained manifest; the other
/// three are independent digests over the slices an auditor would want to
/// verify without re-running the whole pipeline.
fn compute_attestation_hashes(
    manifest: &Manifest,
    metrics: &crate::domain::MetricsSummary,
    equity: &[crate::domain::EquityBar],
) -> EngineResult<Hashes> {
    let metrics_hash = canon::digest(metrics)?;
    let equity_curve_hash = canon::digest(equity)?;
    let provenance = json!({
        "manifest_hash": manifest.manifest_hash,
        "metrics_hash": metrics_hash,
        "chain_prev": manifest.chain_prev,
    });
    let provenance_hash = canon::digest_value(&provenance)?;
    Ok(Hashes {
        manifest_hash: manifest.manifest_hash.clone(),
        metrics_hash,
        equity_curve_hash,
        provenance_hash,
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Summarize a registry row for the `GET /runs` / `GET /runs/{run_hash}`
/// endpoints, parsing its stored JSON blobs back into structured events the
/// API layer can serialize directly.
pub fn describe(record: &RunRecord) -> serde_json::Value {
    json!({
        "run_hash": record.run_hash,
        "run_id": record.run_id,
        "status": record.status,
        "symbol": record.symbol,
        "strategy_id": record.strategy_id,
        "data_hash": record.data_hash,
        "retention_tier": record.retention_tier,
        "primary_metric": record.primary_metric,
        "created_at": record.created_at,
        "completed_at": record.completed_at,
        "error": record.error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionSpec, IndicatorSpec, RiskSpec, StrategySpec, ValidationSpec};
    use std::collections::HashMap as StdHashMap;

    fn sample_config() -> RunConfig {
        RunConfig {
            symbol: "TEST".to_string(),
            timeframe: "1m".to_string(),
            start_ms: 0,
            end_ms: 1_000_000,
            indicators: vec![IndicatorSpec {
                name: "sma".to_string(),
                params: StdHashMap::from([("window".to_string(), 3.0)]),
            }],
            strategy: StrategySpec {
                name: "dual_sma".to_string(),
                params: StdHashMap::from([("fast".to_string(), 2.0), ("slow".to_string(), 5.0)]),
            },
            risk: RiskSpec::FixedFraction { fraction: 1.0 },
            execution: ExecutionSpec::default(),
            validation: ValidationSpec::default(),
            seed: 7,
        }
    }

    #[test]
    fn run_hash_is_deterministic_for_same_inputs() {
        let config = sample_config();
        let h1 = compute_run_hash(&config, "datahash").unwrap();
        let h2 = compute_run_hash(&config, "datahash").unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn run_hash_changes_with_data_hash() {
        let config = sample_config();
        let h1 = compute_run_hash(&config, "datahash1").unwrap();
        let h2 = compute_run_hash(&config, "datahash2").unwrap();
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn submit_twice_for_same_config_attaches_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.artifacts_root = tmp.path().join("artifacts");
        config.dataset_root = tmp.path().to_path_buf();
        let csv_path = config.dataset_root.join("TEST.csv");
        let mut contents = String::from("timestamp,open,high,low,close,volume\n");
        for i in 0..20 {
            let ts = i * 60_000;
            let price = 100.0 + i as f64;
            contents.push_str(&format!("{ts},{price},{price},{price},{price},10\n"));
        }
        std::fs::write(&csv_path, contents).unwrap();

        let registry = Arc::new(RunRegistry::in_memory().unwrap());
        let engine = Arc::new(Engine::new(config, registry));
        let run_config = sample_config();

        let first = engine
            .submit(run_config.clone(), "datahash", "TEST", now_iso())
            .await
            .unwrap();
        assert!(!first.attached_existing);

        let second = engine.submit(run_config, "datahash", "TEST", now_iso()).await.unwrap();
        assert!(second.attached_existing);
        assert_eq!(second.run_hash, first.run_hash);
    }
}
