//! Content-addressed artifact writer & manifest (C8, §4.8).
//!
//! Emission order is fixed: `metrics.json -> equity.csv -> drawdown.csv ->
//! trades.csv -> validation.json -> summary.json -> manifest.json`
//! (manifest last). Every file is written to a tempdir and renamed into
//! place atomically; nothing partially-written is ever visible at the
//! final path. Tabular stages are `.csv`, not `.parquet` — see
//! SPEC_FULL.md §4.8 for why.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::canon;
use crate::domain::{ArtifactDescriptor, EquityBar, Manifest, MetricsSummary, Trade};
use crate::errors::{EngineError, EngineResult};
use crate::validation::ValidationReport;

const WHITELIST: &[&str] = &[
    "metrics.json",
    "equity.csv",
    "drawdown.csv",
    "trades.csv",
    "validation.json",
    "summary.json",
    "manifest.json",
];

pub struct RunArtifacts<'a> {
    pub run_id: &'a str,
    pub run_hash: &'a str,
    pub created_at: &'a str,
    pub symbol: &'a str,
    pub timeframe: &'a str,
    pub data_hash: &'a str,
    pub calendar_id: &'a str,
    pub equity: &'a [EquityBar],
    pub trades: &'a [Trade],
    pub metrics: &'a MetricsSummary,
    pub validation: &'a ValidationReport,
    pub summary: &'a serde_json::Value,
    pub chain_prev: Option<String>,
}

/// Write every whitelisted artifact for one run under
/// `artifacts_root/{run_hash}/`, returning the completed manifest.
/// Writes to a sibling tempdir first and renames atomically so a crash
/// mid-write never leaves a half-populated run directory visible. Fails if
/// the final directory already exists — a fresh run never reuses a
/// `run_hash` directory (idempotent submit short-circuits before this is
/// ever called twice for the same run).
pub fn write_run(artifacts_root: &Path, run: &RunArtifacts) -> EngineResult<Manifest> {
    let final_dir = artifacts_root.join(run.run_hash);
    if final_dir.exists() {
        return Err(EngineError::Conflict(format!(
            "artifact directory already exists for run {}",
            run.run_hash
        )));
    }
    build_and_place(artifacts_root, run, &final_dir)
}

/// Rebuild every whitelisted artifact for a `manifest_only` run and replace
/// its existing directory (§4.11 `rehydrate`). Unlike [`write_run`], the
/// final directory is expected to already exist — retention demotion only
/// ever removes the bulk files, never the directory or `manifest.json` —
/// so this replaces it instead of refusing. Still tempdir-then-rename, so
/// the old (demoted) directory stays intact until the rebuild fully
/// succeeds.
pub fn rehydrate_run(artifacts_root: &Path, run: &RunArtifacts) -> EngineResult<Manifest> {
    let final_dir = artifacts_root.join(run.run_hash);
    let manifest = build_and_place(artifacts_root, run, &final_dir)?;
    Ok(manifest)
}

fn build_and_place(artifacts_root: &Path, run: &RunArtifacts, final_dir: &Path) -> EngineResult<Manifest> {
    let tmp_dir = artifacts_root.join(format!(".{}.tmp", run.run_hash));
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir).map_err(|e| EngineError::Persist(e.to_string()))?;
    }
    fs::create_dir_all(&tmp_dir).map_err(|e| EngineError::Persist(e.to_string()))?;

    let mut files = Vec::new();

    files.push(write_json(&tmp_dir, "metrics.json", run.metrics)?);
    files.push(write_equity_csv(&tmp_dir, run.equity)?);
    files.push(write_drawdown_csv(&tmp_dir, run.equity)?);
    files.push(write_trades_csv(&tmp_dir, run.trades)?);
    files.push(write_json(&tmp_dir, "validation.json", run.validation)?);
    files.push(write_json(&tmp_dir, "summary.json", run.summary)?);

    let manifest_hash = compute_manifest_hash(run, &files)?;
    let manifest = Manifest {
        run_id: run.run_id.to_string(),
        run_hash: run.run_hash.to_string(),
        created_at: run.created_at.to_string(),
        symbol: run.symbol.to_string(),
        timeframe: run.timeframe.to_string(),
        data_hash: run.data_hash.to_string(),
        calendar_id: run.calendar_id.to_string(),
        files: files.clone(),
        chain_prev: run.chain_prev.clone(),
        manifest_hash,
    };
    files.push(write_json(&tmp_dir, "manifest.json", &manifest)?);

    if final_dir.exists() {
        fs::remove_dir_all(final_dir).map_err(|e| EngineError::Persist(e.to_string()))?;
    }
    fs::rename(&tmp_dir, final_dir).map_err(|e| EngineError::Persist(e.to_string()))?;

    Ok(manifest)
}

fn compute_manifest_hash(run: &RunArtifacts, files: &[ArtifactDescriptor]) -> EngineResult<String> {
    let without_hash = serde_json::json!({
        "run_id": run.run_id,
        "run_hash": run.run_hash,
        "created_at": run.created_at,
        "symbol": run.symbol,
        "timeframe": run.timeframe,
        "data_hash": run.data_hash,
        "calendar_id": run.calendar_id,
        "files": files,
        "chain_prev": run.chain_prev,
    });
    canon::digest_value(&without_hash)
}

fn write_json<T: serde::Serialize>(dir: &Path, name: &str, value: &T) -> EngineResult<ArtifactDescriptor> {
    debug_assert!(WHITELIST.contains(&name));
    let bytes = canon::canonicalize(value)?;
    write_bytes(dir, name, &bytes)
}

fn write_equity_csv(dir: &Path, equity: &[EquityBar]) -> EngineResult<ArtifactDescriptor> {
    let mut writer = csv::Writer::from_writer(vec![]);
    for bar in equity {
        writer
            .serialize(bar)
            .map_err(|e| EngineError::Persist(e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| EngineError::Persist(e.to_string()))?;
    write_bytes(dir, "equity.csv", &bytes)
}

#[derive(serde::Serialize)]
struct DrawdownRow {
    ts: i64,
    drawdown: f64,
    peak_nav: f64,
}

fn write_drawdown_csv(dir: &Path, equity: &[EquityBar]) -> EngineResult<ArtifactDescriptor> {
    let mut writer = csv::Writer::from_writer(vec![]);
    for bar in equity {
        writer
            .serialize(DrawdownRow {
                ts: bar.ts,
                drawdown: bar.drawdown,
                peak_nav: bar.peak_nav,
            })
            .map_err(|e| EngineError::Persist(e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| EngineError::Persist(e.to_string()))?;
    write_bytes(dir, "drawdown.csv", &bytes)
}

fn write_trades_csv(dir: &Path, trades: &[Trade]) -> EngineResult<ArtifactDescriptor> {
    let mut writer = csv::Writer::from_writer(vec![]);
    for trade in trades {
        writer
            .serialize(trade)
            .map_err(|e| EngineError::Persist(e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| EngineError::Persist(e.to_string()))?;
    write_bytes(dir, "trades.csv", &bytes)
}

fn write_bytes(dir: &Path, name: &str, bytes: &[u8]) -> EngineResult<ArtifactDescriptor> {
    let path: PathBuf = dir.join(name);
    let mut file = fs::File::create(&path).map_err(|e| EngineError::Persist(e.to_string()))?;
    file.write_all(bytes).map_err(|e| EngineError::Persist(e.to_string()))?;
    let sha256 = hex::encode(Sha256::digest(bytes));
    Ok(ArtifactDescriptor {
        name: name.to_string(),
        path: name.to_string(),
        sha256,
        size: bytes.len() as u64,
    })
}

/// List the whitelisted artifact names a manifest may legally reference.
/// Non-whitelisted files may physically exist in a run directory (e.g.
/// leftover debug output) but are never surfaced by the listing API.
pub fn whitelist() -> &'static [&'static str] {
    WHITELIST
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::validation::ValidationReport;

    fn sample_metrics() -> MetricsSummary {
        MetricsSummary {
            total_return: 0.1,
            sharpe: Some(1.0),
            sortino: None,
            max_drawdown: 0.05,
            trade_count: 1,
            win_rate: None,
            exposure_pct: 0.5,
            turnover: 1.0,
        }
    }

    fn sample_equity() -> Vec<EquityBar> {
        vec![EquityBar {
            ts: 0,
            nav: 1000.0,
            peak_nav: 1000.0,
            drawdown: 0.0,
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            position_after: 0.0,
            trade_count_cum: 0,
        }]
    }

    fn sample_trades() -> Vec<Trade> {
        vec![Trade {
            ts: 0,
            side: Side::Buy,
            qty: 1.0,
            price: 100.0,
            fees: 0.0,
            slippage: 0.0,
            notes: None,
        }]
    }

    #[test]
    fn write_run_emits_whitelisted_files_and_chains_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = sample_metrics();
        let equity = sample_equity();
        let trades = sample_trades();
        let validation = ValidationReport::default();
        let summary = serde_json::json!({"ok": true});

        let run = RunArtifacts {
            run_id: "run-1",
            run_hash: "abc123",
            created_at: "2026-01-01T00:00:00Z",
            symbol: "TEST",
            timeframe: "1m",
            data_hash: "datahash",
            calendar_id: "24x7",
            equity: &equity,
            trades: &trades,
            metrics: &metrics,
            validation: &validation,
            summary: &summary,
            chain_prev: None,
        };

        let manifest = write_run(tmp.path(), &run).unwrap();
        assert_eq!(manifest.files.len(), WHITELIST.len() - 1);
        let run_dir = tmp.path().join("abc123");
        for name in WHITELIST {
            assert!(run_dir.join(name).exists(), "missing {name}");
        }
    }

    #[test]
    fn second_write_with_same_run_hash_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = sample_metrics();
        let equity = sample_equity();
        let trades = sample_trades();
        let validation = ValidationReport::default();
        let summary = serde_json::json!({"ok": true});
        let run = RunArtifacts {
            run_id: "run-1",
            run_hash: "dup",
            created_at: "2026-01-01T00:00:00Z",
            symbol: "TEST",
            timeframe: "1m",
            data_hash: "datahash",
            calendar_id: "24x7",
            equity: &equity,
            trades: &trades,
            metrics: &metrics,
            validation: &validation,
            summary: &summary,
            chain_prev: None,
        };
        write_run(tmp.path(), &run).unwrap();
        let err = write_run(tmp.path(), &run).unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn rehydrate_replaces_an_existing_demoted_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let metrics = sample_metrics();
        let equity = sample_equity();
        let trades = sample_trades();
        let validation = ValidationReport::default();
        let summary = serde_json::json!({"ok": true});
        let run = RunArtifacts {
            run_id: "run-1",
            run_hash: "rehydrated",
            created_at: "2026-01-01T00:00:00Z",
            symbol: "TEST",
            timeframe: "1m",
            data_hash: "datahash",
            calendar_id: "24x7",
            equity: &equity,
            trades: &trades,
            metrics: &metrics,
            validation: &validation,
            summary: &summary,
            chain_prev: None,
        };
        let first = write_run(tmp.path(), &run).unwrap();

        // Simulate retention demotion: bulk files gone, manifest.json left behind.
        let run_dir = tmp.path().join("rehydrated");
        for name in ["equity.csv", "drawdown.csv", "trades.csv", "validation.json"] {
            std::fs::remove_file(run_dir.join(name)).unwrap();
        }
        assert!(run_dir.join("manifest.json").exists());
        assert!(!run_dir.join("equity.csv").exists());

        let rebuilt = rehydrate_run(tmp.path(), &run).unwrap();
        assert_eq!(rebuilt.manifest_hash, first.manifest_hash);
        for name in WHITELIST {
            assert!(run_dir.join(name).exists(), "missing {name} after rehydrate");
        }
    }
}
