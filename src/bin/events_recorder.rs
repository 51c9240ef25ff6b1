use std::path::Path;
use std::sync::Arc;

use betting_backend::{AlloyBettingClient, Config, EventRecorder, PgEventStore, Role};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg_path = std::env::args().nth(1);
    let cfg = Config::load(cfg_path.as_deref())?;

    // logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    cfg.validate(Role::Recorder)?;

    let db_schema = std::fs::read_to_string(Path::new(&cfg.postgres.schema))?;

    // deps
    let store = PgEventStore::connect(&cfg.postgres.dsn, &db_schema).await?;
    store.test_connection().await?;
    let client = Arc::new(AlloyBettingClient::connect(&cfg, None).await?);

    let cancel = CancellationToken::new();
    let recorder = EventRecorder::new(Arc::new(store), &cfg.recorder);
    let handle = match recorder.start(client, cfg.subscribe_policy(), cancel.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error starting event listener: {}", e);
            return Err(e.into());
        }
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let summary = handle.await?;
    info!(
        received = summary.received,
        recorded = summary.recorded,
        duplicates = summary.duplicates,
        failed = summary.failed,
        undecodable = summary.undecodable,
        resubscriptions = summary.resubscriptions,
        "Event recorder exited"
    );

    if !cancel.is_cancelled() {
        anyhow::bail!("Event recorder stopped without a shutdown request");
    }
    Ok(())
}
