use nodesync::{global, NodeSyncError};
use tracing::{error, info, Level};

const APP_NAME: &str = "demo-locked";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Lock file: {}", global::lock_file_path(APP_NAME)?.display());
    if let (true, pid) = global::is_another_instance_running(APP_NAME)? {
        info!("Lock currently held by {:?}", pid);
    }

    // Run this demo twice: the second copy exits here
    let instance = match global::register_with_lock(APP_NAME).await {
        Ok(instance) => instance,
        Err(NodeSyncError::AlreadyRunning { name, pid }) => {
            error!("{} is already running (pid {:?})", name, pid);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    info!("Holding the lock as pid {}", instance.pid());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = instance.cancelled() => {}
    }

    // Releases the lock file
    global::shutdown().await;
    Ok(())
}
