use anyhow::Context;
use tracing::{error, info};

use courier::config::CourierConfig;
use courier::logging;
use courier::notification::channels::HealthStatus;
use courier::services::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CourierConfig::from_env().context("failed to load configuration")?;

    let (logging_handle, _log_guard) =
        logging::init_logging(&config.logging).context("failed to initialize logging")?;
    info!(filter = %logging_handle.get_filter(), "courier starting");

    let ctx = AppContext::new(config).context("failed to build application context")?;
    logging_handle.start_retention_cleanup(ctx.config.logging.retention_days, ctx.cancellation_token());

    let started = ctx.start().await;
    if !started.values().any(|ok| *ok) {
        error!("No notification channel could be started");
    }

    for (service, health) in ctx.dispatcher.service_health().await {
        match health.status {
            HealthStatus::Healthy => info!(service = %service, "Channel healthy"),
            _ => error!(
                service = %service,
                status = ?health.status,
                error = health.error.as_deref().unwrap_or(""),
                "Channel unhealthy"
            ),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    ctx.shutdown().await?;
    Ok(())
}
