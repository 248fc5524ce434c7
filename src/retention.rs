//! Tiered retention manager (C11, §4.11).
//!
//! Demotes completed runs that fall outside the global or per-strategy
//! "keep full" window to `manifest_only`, leaving the manifest and its
//! chain link intact while the bulk artifacts (trades/equity/events csv)
//! are removed from disk. Pinned runs are never touched. Ranking mirrors
//! `backtest_v2::artifact_store`'s deterministic secondary sort
//! (`ORDER BY field DESC, run_id ASC`) so two runs tied on the ranking key
//! always resolve the same way.

use std::path::{Path, PathBuf};

use crate::domain::RetentionTier;
use crate::errors::{EngineError, EngineResult};
use crate::registry::{RunRecord, RunRegistry, RunStatus};

/// `full` tier budgets (§4.11): keep the newest `global_keep` runs
/// overall, plus the best `per_strategy_keep` runs (by `primary_metric`)
/// within each `strategy_id`, unioned together.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub global_keep: usize,
    pub per_strategy_keep: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            global_keep: 100,
            per_strategy_keep: 10,
        }
    }
}

/// One decision made by a retention pass, recorded so the caller can log
/// and the audit trail can explain itself without re-deriving the ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    KeptFull,
    Demoted,
    AlreadyManifestOnly,
    Pinned,
}

#[derive(Debug, Clone)]
pub struct RetentionOutcome {
    pub run_hash: String,
    pub decision: Decision,
}

/// Names of the bulk artifact files removed on demotion. `manifest.json`
/// and the chain are never touched.
const BULK_FILES: &[&str] = &["trades.csv", "equity.csv", "validation.json"];

/// Apply `policy` against every completed run the registry knows about, at
/// the given wall-clock timestamp (used only for the audit log). Idempotent:
/// re-running against an already-demoted population changes nothing and
/// reports `AlreadyManifestOnly` for those runs.
pub fn apply(registry: &RunRegistry, artifacts_root: &Path, policy: RetentionPolicy, now: &str) -> EngineResult<Vec<RetentionOutcome>> {
    let all = registry.list_all()?;
    let completed: Vec<&RunRecord> = all
        .iter()
        .filter(|r| r.status == RunStatus::Completed)
        .collect();

    let keep_hashes = keep_set(&completed, policy);

    let mut outcomes = Vec::with_capacity(completed.len());
    for record in &completed {
        let outcome = if record.retention_tier == RetentionTier::Pinned {
            Decision::Pinned
        } else if keep_hashes.contains(&record.run_hash) {
            if record.retention_tier == RetentionTier::ManifestOnly {
                // Re-promotion is not implemented: a run demoted once stays
                // demoted even if it later re-qualifies, since its bulk
                // artifacts are already gone from disk.
                Decision::AlreadyManifestOnly
            } else {
                Decision::KeptFull
            }
        } else if record.retention_tier == RetentionTier::ManifestOnly {
            Decision::AlreadyManifestOnly
        } else {
            demote(registry, artifacts_root, &record.run_hash, now)?;
            Decision::Demoted
        };
        outcomes.push(RetentionOutcome {
            run_hash: record.run_hash.clone(),
            decision: outcome,
        });
    }
    Ok(outcomes)
}

/// Union of the global newest-`N` set and each strategy's best-`K` set.
/// Ties broken by `created_at desc, run_hash asc` (global) and
/// `primary_metric desc, run_hash asc` (per-strategy), matching the
/// registry's own deterministic ordering so retention and listing never
/// disagree about which run is "first".
fn keep_set(completed: &[&RunRecord], policy: RetentionPolicy) -> std::collections::HashSet<String> {
    let mut keep = std::collections::HashSet::new();

    let mut by_recency: Vec<&&RunRecord> = completed.iter().collect();
    by_recency.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.run_hash.cmp(&b.run_hash)));
    for record in by_recency.into_iter().take(policy.global_keep) {
        keep.insert(record.run_hash.clone());
    }

    let mut by_strategy: std::collections::BTreeMap<&str, Vec<&&RunRecord>> = std::collections::BTreeMap::new();
    for record in completed {
        by_strategy.entry(record.strategy_id.as_str()).or_default().push(record);
    }
    for records in by_strategy.values_mut() {
        records.sort_by(|a, b| {
            let am = a.primary_metric.unwrap_or(f64::NEG_INFINITY);
            let bm = b.primary_metric.unwrap_or(f64::NEG_INFINITY);
            bm.partial_cmp(&am)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.run_hash.cmp(&b.run_hash))
        });
        for record in records.iter().take(policy.per_strategy_keep) {
            keep.insert(record.run_hash.clone());
        }
    }
    keep
}

fn demote(registry: &RunRegistry, artifacts_root: &Path, run_hash: &str, now: &str) -> EngineResult<()> {
    let dir = artifacts_root.join(run_hash);
    for file in BULK_FILES {
        let path = dir.join(file);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| EngineError::Persist(e.to_string()))?;
        }
    }
    registry.set_retention_tier(run_hash, RetentionTier::ManifestOnly)?;
    registry.audit_evict(run_hash, now, "retention_policy")?;
    Ok(())
}

/// Pin a run, exempting it from future demotion until explicitly unpinned.
pub fn pin(registry: &RunRegistry, run_hash: &str, actor: &str, ts: &str) -> EngineResult<()> {
    registry.pin(run_hash, actor, ts)
}

/// Unpin a run. It falls back to `manifest_only` immediately — whether it
/// re-qualifies for `full` is decided on the next [`apply`] pass, not here.
pub fn unpin(registry: &RunRegistry, run_hash: &str, actor: &str, ts: &str) -> EngineResult<()> {
    registry.unpin(run_hash, actor, ts, RetentionTier::ManifestOnly)
}

/// Paths a `manifest_only` run would need restored to serve a full
/// artifact request again. The caller (API layer) uses this to produce a
/// 410-with-rehydration-hint response rather than a bare 404.
pub fn rehydrate_paths(artifacts_root: &Path, run_hash: &str) -> Vec<PathBuf> {
    let dir = artifacts_root.join(run_hash);
    BULK_FILES.iter().map(|f| dir.join(f)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed(registry: &RunRegistry, hash: &str, strategy: &str, created_at: &str, metric: Option<f64>) {
        registry
            .create_queued(hash, &format!("run-{hash}"), "{}", "TEST", strategy, "data", created_at)
            .unwrap();
        registry
            .mark_completed(
                hash,
                "{}",
                &crate::registry::Hashes {
                    manifest_hash: format!("m-{hash}"),
                    metrics_hash: format!("me-{hash}"),
                    equity_curve_hash: format!("e-{hash}"),
                    provenance_hash: format!("p-{hash}"),
                },
                metric,
                created_at,
            )
            .unwrap();
    }

    #[test]
    fn global_keep_retains_newest_n() {
        let registry = RunRegistry::in_memory().unwrap();
        let dir = tempdir().unwrap();
        seed(&registry, "h1", "s", "2026-01-01T00:00:00Z", Some(1.0));
        seed(&registry, "h2", "s", "2026-01-02T00:00:00Z", Some(1.0));
        seed(&registry, "h3", "s", "2026-01-03T00:00:00Z", Some(1.0));
        let policy = RetentionPolicy { global_keep: 2, per_strategy_keep: 0 };
        let outcomes = apply(&registry, dir.path(), policy, "2026-01-01T00:00:00Z").unwrap();
        let decision_for = |h: &str| outcomes.iter().find(|o| o.run_hash == h).unwrap().decision.clone();
        assert_eq!(decision_for("h3"), Decision::KeptFull);
        assert_eq!(decision_for("h2"), Decision::KeptFull);
        assert_eq!(decision_for("h1"), Decision::Demoted);
        assert_eq!(registry.find("h1").unwrap().unwrap().retention_tier, RetentionTier::ManifestOnly);
    }

    #[test]
    fn per_strategy_keep_retains_best_metric() {
        let registry = RunRegistry::in_memory().unwrap();
        let dir = tempdir().unwrap();
        seed(&registry, "h1", "strat_a", "2026-01-01T00:00:00Z", Some(0.1));
        seed(&registry, "h2", "strat_a", "2026-01-01T00:00:01Z", Some(2.0));
        let policy = RetentionPolicy { global_keep: 0, per_strategy_keep: 1 };
        let outcomes = apply(&registry, dir.path(), policy, "2026-01-01T00:00:00Z").unwrap();
        let decision_for = |h: &str| outcomes.iter().find(|o| o.run_hash == h).unwrap().decision.clone();
        assert_eq!(decision_for("h2"), Decision::KeptFull);
        assert_eq!(decision_for("h1"), Decision::Demoted);
    }

    #[test]
    fn pinned_runs_are_never_demoted() {
        let registry = RunRegistry::in_memory().unwrap();
        let dir = tempdir().unwrap();
        seed(&registry, "h1", "s", "2026-01-01T00:00:00Z", Some(0.1));
        registry.pin("h1", "operator", "2026-01-01T00:01:00Z").unwrap();
        let policy = RetentionPolicy { global_keep: 0, per_strategy_keep: 0 };
        let outcomes = apply(&registry, dir.path(), policy, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(outcomes[0].decision, Decision::Pinned);
        assert_eq!(registry.find("h1").unwrap().unwrap().retention_tier, RetentionTier::Pinned);
    }

    #[test]
    fn already_demoted_run_reports_already_manifest_only() {
        let registry = RunRegistry::in_memory().unwrap();
        let dir = tempdir().unwrap();
        seed(&registry, "h1", "s", "2026-01-01T00:00:00Z", Some(0.1));
        let policy = RetentionPolicy { global_keep: 0, per_strategy_keep: 0 };
        apply(&registry, dir.path(), policy, "2026-01-01T00:00:00Z").unwrap();
        let outcomes = apply(&registry, dir.path(), policy, "2026-01-01T00:00:00Z").unwrap();
        assert_eq!(outcomes[0].decision, Decision::AlreadyManifestOnly);
    }
}
