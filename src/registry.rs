//! Run registry & store (C12, §4.12).
//!
//! Persists per-run metadata keyed by `run_hash`: canonical config blob,
//! manifest blob + hash, attestation hashes, retention state, primary
//! metric, timestamps, and the error record for failed runs. Mirrors
//! `backtest_v2::artifact_store`'s WAL-mode rusqlite + `parking_lot::Mutex
//! <Connection>` shape, generalized from a blob-keyed artifact cache to the
//! run-identity ledger idempotent submission needs.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::domain::RetentionTier;
use crate::errors::{EngineError, EngineResult};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub phase: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_hash: String,
    pub run_id: String,
    pub status: RunStatus,
    pub config_json: String,
    pub symbol: String,
    pub strategy_id: String,
    pub data_hash: String,
    pub manifest_json: Option<String>,
    pub manifest_hash: Option<String>,
    pub metrics_hash: Option<String>,
    pub equity_curve_hash: Option<String>,
    pub provenance_hash: Option<String>,
    pub retention_tier: RetentionTier,
    pub primary_metric: Option<f64>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub error: Option<ErrorRecord>,
}

/// Attestation bundle for `GET /runs/{run_hash}/hashes` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hashes {
    pub manifest_hash: String,
    pub metrics_hash: String,
    pub equity_curve_hash: String,
    pub provenance_hash: String,
}

pub struct RunRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl RunRegistry {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Persist(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| EngineError::Persist(e.to_string()))?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| EngineError::Persist(e.to_string()))?;
        let registry = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    fn init_schema(&self) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY);
             CREATE TABLE IF NOT EXISTS runs (
                 run_hash TEXT PRIMARY KEY,
                 run_id TEXT NOT NULL,
                 status TEXT NOT NULL,
                 config_json TEXT NOT NULL,
                 symbol TEXT NOT NULL,
                 strategy_id TEXT NOT NULL,
                 data_hash TEXT NOT NULL,
                 manifest_json TEXT,
                 manifest_hash TEXT,
                 metrics_hash TEXT,
                 equity_curve_hash TEXT,
                 provenance_hash TEXT,
                 retention_tier TEXT NOT NULL DEFAULT 'full',
                 primary_metric REAL,
                 created_at TEXT NOT NULL,
                 completed_at TEXT,
                 error_json TEXT,
                 pinned_by TEXT,
                 pinned_at TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);
             CREATE INDEX IF NOT EXISTS idx_runs_strategy ON runs(strategy_id, primary_metric DESC);
             CREATE TABLE IF NOT EXISTS audit_log (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 event TEXT NOT NULL,
                 run_id TEXT NOT NULL,
                 ts TEXT NOT NULL,
                 actor TEXT NOT NULL,
                 reason TEXT
             );",
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
            params![SCHEMA_VERSION],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        Ok(())
    }

    /// Look up a run by its `run_hash` (§4.10 idempotent submit, step 2).
    pub fn find(&self, run_hash: &str) -> EngineResult<Option<RunRecord>> {
        let conn = self.conn.lock();
        conn.query_row(SELECT_COLUMNS, [run_hash], row_to_record)
            .optional()
            .map_err(|e| EngineError::Persist(e.to_string()))
    }

    /// Insert a new `status=queued` row. Errors with `Conflict` if the
    /// `run_hash` already has a row (guards the check-then-insert race when
    /// two submitters race past `find` for the same config).
    #[allow(clippy::too_many_arguments)]
    pub fn create_queued(
        &self,
        run_hash: &str,
        run_id: &str,
        config_json: &str,
        symbol: &str,
        strategy_id: &str,
        data_hash: &str,
        created_at: &str,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO runs (run_hash, run_id, status, config_json, symbol, strategy_id, data_hash, retention_tier, created_at)
             VALUES (?, ?, 'queued', ?, ?, ?, ?, 'full', ?)",
            params![run_hash, run_id, config_json, symbol, strategy_id, data_hash, created_at],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => Err(
                EngineError::Conflict(format!("run {run_hash} already exists")),
            ),
            Err(e) => Err(EngineError::Persist(e.to_string())),
        }
    }

    pub fn mark_running(&self, run_hash: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = 'running' WHERE run_hash = ?",
            params![run_hash],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn mark_completed(
        &self,
        run_hash: &str,
        manifest_json: &str,
        hashes: &Hashes,
        primary_metric: Option<f64>,
        completed_at: &str,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = 'completed', manifest_json = ?, manifest_hash = ?,
                    metrics_hash = ?, equity_curve_hash = ?, provenance_hash = ?,
                    primary_metric = ?, completed_at = ? WHERE run_hash = ?",
            params![
                manifest_json,
                hashes.manifest_hash,
                hashes.metrics_hash,
                hashes.equity_curve_hash,
                hashes.provenance_hash,
                primary_metric,
                completed_at,
                run_hash,
            ],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        Ok(())
    }

    pub fn mark_failed(&self, run_hash: &str, error: &ErrorRecord, completed_at: &str) -> EngineResult<()> {
        let error_json = serde_json::to_string(error).map_err(|e| EngineError::Persist(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = 'failed', error_json = ?, completed_at = ? WHERE run_hash = ?",
            params![error_json, completed_at, run_hash],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        Ok(())
    }

    pub fn mark_cancelled(&self, run_hash: &str, completed_at: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET status = 'cancelled', completed_at = ? WHERE run_hash = ?",
            params![completed_at, run_hash],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        Ok(())
    }

    /// Newest-first listing, bounded by `limit` (§6 `GET /runs`).
    pub fn list_recent(&self, limit: usize) -> EngineResult<Vec<RunRecord>> {
        let conn = self.conn.lock();
        let sql = format!("{SELECT_COLUMNS_BASE} ORDER BY created_at DESC, run_hash ASC LIMIT ?");
        let mut stmt = conn.prepare(&sql).map_err(|e| EngineError::Persist(e.to_string()))?;
        let rows = stmt
            .query_map([limit as i64], row_to_record)
            .map_err(|e| EngineError::Persist(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Persist(e.to_string()))
    }

    /// Every run known to the registry, used by the retention manager,
    /// which needs the full population to rank per-strategy and globally.
    pub fn list_all(&self) -> EngineResult<Vec<RunRecord>> {
        self.list_recent(i64::MAX as usize)
    }

    pub fn hashes(&self, run_hash: &str) -> EngineResult<Option<Hashes>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT manifest_hash, metrics_hash, equity_curve_hash, provenance_hash FROM runs WHERE run_hash = ?",
            [run_hash],
            |row| {
                let manifest_hash: Option<String> = row.get(0)?;
                let metrics_hash: Option<String> = row.get(1)?;
                let equity_curve_hash: Option<String> = row.get(2)?;
                let provenance_hash: Option<String> = row.get(3)?;
                Ok(manifest_hash.zip(metrics_hash).zip(equity_curve_hash).zip(provenance_hash).map(
                    |(((manifest_hash, metrics_hash), equity_curve_hash), provenance_hash)| Hashes {
                        manifest_hash,
                        metrics_hash,
                        equity_curve_hash,
                        provenance_hash,
                    },
                ))
            },
        )
        .optional()
        .map(Option::flatten)
        .map_err(|e| EngineError::Persist(e.to_string()))
    }

    pub fn latest_completed_manifest_hash(&self) -> EngineResult<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT manifest_hash FROM runs WHERE status = 'completed' AND manifest_hash IS NOT NULL
             ORDER BY completed_at DESC, run_hash DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| EngineError::Persist(e.to_string()))
    }

    pub fn set_retention_tier(&self, run_hash: &str, tier: RetentionTier) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET retention_tier = ? WHERE run_hash = ?",
            params![tier_str(tier), run_hash],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        Ok(())
    }

    pub fn pin(&self, run_hash: &str, actor: &str, ts: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET retention_tier = 'pinned', pinned_by = ?, pinned_at = ? WHERE run_hash = ?",
            params![actor, ts, run_hash],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        audit(&conn, "pin", run_hash, ts, actor, None)
    }

    /// Unpin back to `fallback_tier` (the caller decides `full` vs
    /// `manifest_only` based on whether the run is still due for a global
    /// or per-strategy slot on next `retention::apply`).
    pub fn unpin(&self, run_hash: &str, actor: &str, ts: &str, fallback_tier: RetentionTier) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET retention_tier = ?, pinned_by = NULL, pinned_at = NULL WHERE run_hash = ?",
            params![tier_str(fallback_tier), run_hash],
        )
        .map_err(|e| EngineError::Persist(e.to_string()))?;
        audit(&conn, "unpin", run_hash, ts, actor, None)
    }

    pub fn audit_evict(&self, run_hash: &str, ts: &str, reason: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        audit(&conn, "evict", run_hash, ts, "retention_manager", Some(reason))
    }

    pub fn audit_rehydrate(&self, run_hash: &str, ts: &str, actor: &str) -> EngineResult<()> {
        let conn = self.conn.lock();
        audit(&conn, "rehydrate", run_hash, ts, actor, None)
    }
}

fn tier_str(tier: RetentionTier) -> &'static str {
    match tier {
        RetentionTier::Full => "full",
        RetentionTier::ManifestOnly => "manifest_only",
        RetentionTier::Pinned => "pinned",
    }
}

fn audit(conn: &Connection, event: &str, run_id: &str, ts: &str, actor: &str, reason: Option<&str>) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO audit_log (event, run_id, ts, actor, reason) VALUES (?, ?, ?, ?, ?)",
        params![event, run_id, ts, actor, reason],
    )
    .map_err(|e| EngineError::Persist(e.to_string()))?;
    Ok(())
}

const SELECT_COLUMNS_BASE: &str = "SELECT run_hash, run_id, status, config_json, symbol, strategy_id, data_hash,
            manifest_json, manifest_hash, metrics_hash, equity_curve_hash, provenance_hash,
            retention_tier, primary_metric, created_at, completed_at, error_json
     FROM runs";
const SELECT_COLUMNS: &str = "SELECT run_hash, run_id, status, config_json, symbol, strategy_id, data_hash,
            manifest_json, manifest_hash, metrics_hash, equity_curve_hash, provenance_hash,
            retention_tier, primary_metric, created_at, completed_at, error_json
     FROM runs WHERE run_hash = ?";

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
    let status: String = row.get(2)?;
    let retention_tier: String = row.get(12)?;
    let error_json: Option<String> = row.get(16)?;
    Ok(RunRecord {
        run_hash: row.get(0)?,
        run_id: row.get(1)?,
        status: RunStatus::from_str(&status),
        config_json: row.get(3)?,
        symbol: row.get(4)?,
        strategy_id: row.get(5)?,
        data_hash: row.get(6)?,
        manifest_json: row.get(7)?,
        manifest_hash: row.get(8)?,
        metrics_hash: row.get(9)?,
        equity_curve_hash: row.get(10)?,
        provenance_hash: row.get(11)?,
        retention_tier: match retention_tier.as_str() {
            "manifest_only" => RetentionTier::ManifestOnly,
            "pinned" => RetentionTier::Pinned,
            _ => RetentionTier::Full,
        },
        primary_metric: row.get(13)?,
        created_at: row.get(14)?,
        completed_at: row.get(15)?,
        error: error_json.and_then(|j| serde_json::from_str(&j).ok()),
    })
}
