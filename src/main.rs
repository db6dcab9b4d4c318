use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use networkdb::api;
use networkdb::cli;
use networkdb::cluster::StaticCluster;
use networkdb::networkdb::NetworkDb;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "networkdb=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings();
    let http_address = settings.http_addr()?;

    // Membership layer first: the store sends through its queue
    let (cluster, sender) = StaticCluster::new(settings.cluster_config()?);
    let db = Arc::new(NetworkDb::new(settings.networkdb_config()?, Arc::new(sender))?);
    let mut cluster_handle = cluster.start(Arc::clone(&db)).await?;
    db.start()?;

    // Build Axum Router
    let api = api::api(Arc::clone(&db)).await?;

    // Start server
    info!(
        "Starting NetworkDB node {} on {} (cluster on {})",
        db.node_name(),
        http_address,
        cluster_handle.local_addr
    );
    let listener = tokio::net::TcpListener::bind(http_address).await?;
    axum::serve(listener, api)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down NetworkDB node {}", db.node_name());
    if let Err(e) = db.leave_cluster() {
        tracing::warn!("Failed to announce leave: {}", e);
    }
    // Give the leave a couple of gossip rounds to go out
    tokio::time::sleep(2 * db.config().gossip_interval).await;
    db.close();
    cluster_handle.shutdown();
    Ok(())
}
