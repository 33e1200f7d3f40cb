use outpost::{Config, delivery::MxResolver};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    outpost::init_tracing();

    let config = Config::from_env()?;
    let shutdown = CancellationToken::new();

    let resolver = MxResolver::new(config.mx_cache_ttl);
    let pipeline = outpost::run(config, resolver, shutdown.clone()).await?;
    info!("delivery pipeline running");

    outpost::shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    pipeline.shutdown().await;

    Ok(())
}
