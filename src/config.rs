//! Process-wide engine configuration.
//!
//! Constructed once at process init (see `main.rs` / `bin/alphaforge_cli.rs`)
//! and threaded explicitly through `AppState` — no ambient globals, per the
//! redesign note in §9.

use std::path::PathBuf;

/// Feature flags and tunables read from the environment exactly once.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `AF_TIMEFRAME_STRICT=1`: fail ingestion on observed/declared timeframe
    /// mismatch instead of recording an anomaly counter.
    pub timeframe_strict: bool,
    /// `AF_DRAWDOWN_EPSILON`: tolerance for the `drawdown` invariant check.
    pub drawdown_epsilon: f64,
    /// `AF_OPTIMIZATION_MAX_COMBINATIONS`: guard rail for any future
    /// parameter-sweep tooling built atop this engine.
    pub optimization_max_combinations: u64,
    /// `BOOT_CI_WIDTH_MAX`: strict-mode bootstrap CI width gate.
    pub boot_ci_width_max: f64,
    /// Root directory under which `{run_hash}/` artifact directories live.
    pub artifacts_root: PathBuf,
    /// Path to the sqlite run registry database.
    pub registry_db_path: PathBuf,
    /// Directory CSV datasets are resolved relative to.
    pub dataset_root: PathBuf,
    /// Address the HTTP server binds to.
    pub bind_addr: String,
    /// Global retention: newest N runs kept at `full` fidelity.
    pub retention_n_global: usize,
    /// Per-strategy retention: top K runs by primary metric kept `full`.
    pub retention_k_per_strategy: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeframe_strict: false,
            drawdown_epsilon: 1e-9,
            optimization_max_combinations: 10_000,
            boot_ci_width_max: f64::INFINITY,
            artifacts_root: PathBuf::from("./artifacts"),
            registry_db_path: PathBuf::from("./data/registry.sqlite"),
            dataset_root: PathBuf::from("./data"),
            bind_addr: "0.0.0.0:8080".to_string(),
            retention_n_global: 50,
            retention_k_per_strategy: 5,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset. Mirrors `main.rs`'s `dotenv().ok()`
    /// followed by `env::var(...)` reads.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeframe_strict: env_bool("AF_TIMEFRAME_STRICT", defaults.timeframe_strict),
            drawdown_epsilon: env_f64("AF_DRAWDOWN_EPSILON", defaults.drawdown_epsilon),
            optimization_max_combinations: env_u64(
                "AF_OPTIMIZATION_MAX_COMBINATIONS",
                defaults.optimization_max_combinations,
            ),
            boot_ci_width_max: env_f64("BOOT_CI_WIDTH_MAX", defaults.boot_ci_width_max),
            artifacts_root: std::env::var("AF_ARTIFACTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_root),
            registry_db_path: std::env::var("AF_REGISTRY_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_db_path),
            dataset_root: std::env::var("AF_DATASET_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_root),
            bind_addr: std::env::var("AF_BIND_ADDR").unwrap_or(defaults.bind_addr),
            retention_n_global: env_u64(
                "AF_RETENTION_N_GLOBAL",
                defaults.retention_n_global as u64,
            ) as usize,
            retention_k_per_strategy: env_u64(
                "AF_RETENTION_K_PER_STRATEGY",
                defaults.retention_k_per_strategy as u64,
            ) as usize,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
