use vigia_common::config::AppConfig;
use vigia_common::db;
use vigia_engine::source::PgAlertSource;
use vigia_notifier::delivery::Deliverer;
use vigia_notifier::pipeline::AlertPipeline;
use vigia_notifier::scheduler::AlertScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigia_notifier=info,vigia_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Vigia notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let source = PgAlertSource::new(pool.clone());
    let deliverer = Deliverer::new()?;
    let pipeline = AlertPipeline::new(pool, Box::new(source), deliverer, &config);
    tracing::info!(owner_id = %pipeline.owner_id(), "Alert pipeline initialized");
    let scheduler = AlertScheduler::new(pipeline, &config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut scheduler_task = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        result = &mut scheduler_task => {
            if let Err(e) = result? {
                tracing::error!(error = %e, "Alert scheduler exited with error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            let _ = shutdown_tx.send(true);
            match scheduler_task.await {
                Ok(Err(e)) => tracing::error!(error = %e, "Alert scheduler exited with error during shutdown"),
                Err(e) => tracing::error!(error = %e, "Alert scheduler task panicked"),
                Ok(Ok(())) => {}
            }
        }
    }

    tracing::info!("Vigia notifier stopped.");
    Ok(())
}
