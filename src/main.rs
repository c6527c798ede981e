use acontext_storage::{AppConfig, Deadline, StorageCore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acontext_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().map_err(anyhow::Error::msg)?;
    tracing::info!("Data directory: {:?}", config.data_dir);

    let core = StorageCore::open(&config).await?;
    tracing::info!(
        "Reconcile sweep every {:?} with a {:?} deadline",
        config.sweep_interval,
        config.op_timeout
    );

    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match core.ledger.reconcile(Deadline::after(config.op_timeout)).await {
                    Ok(report) if !report.drift.is_empty() => {
                        tracing::warn!("{} ledger entries disagree with artifacts", report.drift.len());
                    }
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => tracing::warn!("Reconcile pass failed, retrying next tick: {}", e),
                    Err(e) => tracing::error!("Reconcile pass failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                return Ok(());
            }
        }
    }
}
