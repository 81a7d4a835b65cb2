use nodesync::global;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    // Configuration comes from nodesync.toml and NODESYNC_* variables
    let instance = global::register("demo-basic").await?;
    info!(
        "Registered {} as {} (status {})",
        instance.name(),
        instance.instance_id(),
        instance.status()
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received"),
        _ = instance.cancelled() => info!("Stopped remotely"),
    }

    global::shutdown().await;
    info!("Demo finished");
    Ok(())
}
