use nodesync::{
    Command, CommandContext, CommandResult, CustomHandler, Instance, NodeConfig, NodeSyncError,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    // Replies on the status topic, then answers the dispatcher
    let reload = CustomHandler::new(
        "reload",
        |ctx: CommandContext, command: Command| async move {
            let section = command.parameter_str("section").unwrap_or("all").to_string();
            info!("Reloading {}", section);
            ctx.report_status(json!({ "reloaded": section })).await?;
            Ok::<_, NodeSyncError>(CommandResult::success(format!("reloaded {}", section)))
        },
    );

    let ping = CustomHandler::sync("ping", |_, command| {
        CommandResult::success("pong").for_command(command)
    });

    let instance = Instance::builder("demo-handlers")
        .config(NodeConfig::load()?)
        .version("1.0.0")
        .handler(reload)
        .handler(ping)
        .start()
        .await?;

    // Handlers can also be added after start
    instance.register_handler(Arc::new(CustomHandler::sync("uptime", |ctx, _| {
        CommandResult::success(format!("{}s", ctx.instance().uptime().as_secs()))
    })));

    info!(
        "Send commands to {}, e.g. {{\"command\":\"reload\",\"parameters\":{{\"section\":\"cache\"}}}}",
        instance.topics().control
    );
    info!("Available commands: {:?}", instance.commands());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = instance.cancelled() => {}
    }

    instance.stop().await;
    Ok(())
}
