use anyhow::{Context, Result};
use mantle::config::{load_config, MantleConfig};
use mantle::{ManagementContext, TypeRegistry};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mantle=info".into()),
        )
        .init();

    info!("Mantle starting...");

    let mut config = match std::env::var("MANTLE_CONFIG") {
        Ok(path) => {
            info!(path = %path, "Loading configuration");
            load_config(&path)?
        }
        Err(_) => MantleConfig::default(),
    };
    config.apply_env()?;

    info!(
        snapshot_dir = %config.snapshot.directory.display(),
        snapshots_enabled = config.snapshot.enabled,
        auto_rebind = config.rebind.auto_rebind,
        "Configuration loaded"
    );

    let ctx = ManagementContext::init(config, TypeRegistry::with_builtin_types())?;

    if ctx.config().rebind.auto_rebind {
        match ctx.rebind_latest() {
            Ok(Some(report)) => info!(
                rebound = report.rebound.len(),
                dangling = report.dangling.len(),
                unrebindable = report.unrebindable.len(),
                "Rebound from snapshot"
            ),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Rebind failed, starting empty"),
        }
    }

    ctx.start_snapshots();

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    ctx.teardown().await?;
    info!("Mantle stopped");

    Ok(())
}
