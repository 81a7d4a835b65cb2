use nodesync::{BuildInfo, Instance, NodeConfig, ShutdownReason};
use std::time::Duration;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let mut config = NodeConfig::load()?;
    config.heartbeat.interval_secs = 5;
    config.reconnect.interval_secs = 30;
    config
        .metadata
        .insert("environment".to_string(), "demo".to_string());
    config.metadata.insert("zone".to_string(), "lab-1".to_string());

    let instance = Instance::builder("demo-advanced")
        .config(config)
        .version(env!("CARGO_PKG_VERSION"))
        .build_info(BuildInfo::current())
        .start()
        .await?;

    instance.add_shutdown_hook(|| info!("Flushing application state"));

    // Watch command results handled by this process
    let mut results = instance.subscribe_results();
    tokio::spawn(async move {
        while let Ok(result) = results.recv().await {
            info!(
                "Result for '{}': success={} message={}",
                result.request_id, result.success, result.message
            );
        }
    });

    // Print a status line until shut down
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let info = instance.info();
                info!(
                    "status={} connected={} uptime={}s commands={:?}",
                    info.status, info.connected, info.uptime_secs, info.commands
                );
            }
            _ = tokio::signal::ctrl_c() => {
                instance.request_stop(ShutdownReason::Signal("SIGINT".to_string()));
                break;
            }
            _ = instance.cancelled() => break,
        }
    }

    let reason = instance.shutdown_reason();
    instance.stop().await;

    if reason.as_ref().is_some_and(ShutdownReason::wants_restart) {
        warn!("Restart requested, exiting so the supervisor can start us again");
    }
    Ok(())
}
