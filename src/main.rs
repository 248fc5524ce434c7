//! AlphaForge — deterministic backtest & validation engine HTTP server.

use std::sync::Arc;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alphaforge_engine::config::EngineConfig;
use alphaforge_engine::orchestrator::Engine;
use alphaforge_engine::registry::RunRegistry;
use alphaforge_engine::{api, resources, retention};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(bind_addr = %config.bind_addr, artifacts_root = ?config.artifacts_root, "starting alphaforge engine");

    let registry = Arc::new(
        RunRegistry::open(&config.registry_db_path).context("failed to open run registry")?,
    );
    std::fs::create_dir_all(&config.artifacts_root).context("failed to create artifacts root")?;

    let retention_policy = retention::RetentionPolicy {
        global_keep: config.retention_n_global,
        per_strategy_keep: config.retention_k_per_strategy,
    };
    let artifacts_root = config.artifacts_root.clone();
    let registry_for_sweep = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().to_rfc3339();
            match retention::apply(&registry_for_sweep, &artifacts_root, retention_policy, &now) {
                Ok(outcomes) => {
                    let demoted = outcomes
                        .iter()
                        .filter(|o| o.decision == retention::Decision::Demoted)
                        .count();
                    if demoted > 0 {
                        info!(demoted, "retention sweep demoted runs to manifest_only");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "retention sweep failed"),
            }
            resources::check_rss_ceiling();
        }
    });

    let engine = Arc::new(Engine::new(config.clone(), registry));
    let app = api::router(engine);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
