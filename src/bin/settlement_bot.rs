use std::sync::Arc;

use betting_backend::{AlloyBettingClient, Config, Role, SettlementScanner};
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

    cfg.validate(Role::Settler)?;

    let signer = cfg.signer()?;
    let client = Arc::new(AlloyBettingClient::connect(&cfg, Some(signer)).await?);
    info!("Settling bets of contract {}", client.contract_address());

    let cancel = CancellationToken::new();
    let scanner = Arc::new(SettlementScanner::new(client.clone(), &cfg.settlement));
    let handle = match scanner.start(client.clone(), cfg.subscribe_policy(), cancel.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error starting settlement bot: {}", e);
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

    handle.await?;
    if !cancel.is_cancelled() {
        anyhow::bail!("Settlement bot stopped without a shutdown request");
    }
    Ok(())
}
