use clap::Parser;
use distributed_cache::{launch, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Config::parse();
    tracing::info!(
        "Starting node {} (bootstrap: {}, join: {:?})",
        config.node_id,
        config.bootstrap,
        config.join
    );

    let node = launch(config).await?;

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    node.shutdown().await;
    Ok(())
}
