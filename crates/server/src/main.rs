mod api;
mod cli;
mod router;
mod shutdown;
mod startup;
mod state;
mod upload;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use convertd_core::Config;
use convertd_storage::Janitor;
use convertd_tool_runtime::ToolRegistry;

use cli::{Cli, Command};

fn load_config() -> Config {
    convertd_core::config::load_dotenv();
    Config::from_env()
}

async fn check(config: &Config) -> anyhow::Result<()> {
    let registry = ToolRegistry::from_config(config).context("failed to build tool registry")?;
    info!("Tool preflight:");
    startup::preflight(&registry, true).await?;
    info!("All tools present");
    Ok(())
}

async fn sweep(config: &Config) -> anyhow::Result<()> {
    let storage = startup::prepare_storage(config).await?;
    let report = Janitor::from_config(storage, &config.storage)
        .sweep()
        .await
        .context("retention sweep failed")?;
    info!(
        "Sweep complete: scanned={} deleted={} skipped_active={} failed={}",
        report.scanned, report.deleted, report.skipped_active, report.failed
    );
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    config.log_summary();
    let state = startup::build_app_state(&config).await?;

    let janitor_cancel = CancellationToken::new();
    let janitor = Janitor::from_config(state.executor.storage().clone(), &config.storage)
        .spawn(janitor_cancel.clone());

    let app = router::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);
    info!("API docs at http://{}/docs", addr);

    let grace = Duration::from_secs(config.server.shutdown_grace_secs);
    shutdown::serve_until(listener, app, state.executor.clone(), grace, shutdown::signal()).await?;

    janitor_cancel.cancel();
    if let Err(e) = janitor.await {
        warn!("Janitor task ended abnormally: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let mut config = load_config();

    match cli.command() {
        Command::Serve { host, port } => {
            cli::apply_overrides(&mut config, host, port);
            serve(config).await
        }
        Command::Check => check(&config).await,
        Command::Sweep => sweep(&config).await,
    }
}
