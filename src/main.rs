use mcsm_core::{GlobalConfig, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("Server manager daemon starting");

    let config = GlobalConfig::load()?;
    tracing::info!("Data directory: {}", config.data_dir.display());

    let supervisor = Supervisor::load(config)?;
    for summary in supervisor.list()? {
        let inst = &summary.instance;
        tracing::info!(
            "  - {} [{}] {} {} port {} ({})",
            inst.name,
            inst.id,
            inst.core_type,
            inst.mc_version,
            inst.port,
            inst.startup_mode
        );
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping instances...");
    supervisor.shutdown_all().await;

    tracing::info!("Server manager daemon shutting down");
    Ok(())
}
