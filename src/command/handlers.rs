use super::{Command, CommandContext, CommandHandler, CommandResult};
use crate::error::Result;
use crate::instance::ShutdownReason;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

/// Handlers every instance starts with: stop, restart, status and query
pub fn builtin_handlers() -> Vec<Arc<dyn CommandHandler>> {
    vec![
        Arc::new(StopHandler),
        Arc::new(RestartHandler),
        Arc::new(StatusHandler),
        Arc::new(QueryHandler),
    ]
}

/// `stop`: move to stopping and cancel the instance's background work
#[derive(Debug, Default)]
pub struct StopHandler;

#[async_trait]
impl CommandHandler for StopHandler {
    fn name(&self) -> &str {
        "stop"
    }

    async fn handle(&self, ctx: &CommandContext, command: &Command) -> Result<CommandResult> {
        info!(
            "[{}] Stop command received, shutting down",
            ctx.instance().instance_id()
        );
        ctx.request_stop(ShutdownReason::RemoteStop);
        Ok(CommandResult::success("Shutdown signal sent").for_command(command))
    }
}

/// `restart`: like stop, but tells the host to start again afterwards
#[derive(Debug, Default)]
pub struct RestartHandler;

#[async_trait]
impl CommandHandler for RestartHandler {
    fn name(&self) -> &str {
        "restart"
    }

    async fn handle(&self, ctx: &CommandContext, command: &Command) -> Result<CommandResult> {
        info!(
            "[{}] Restart command received",
            ctx.instance().instance_id()
        );
        ctx.request_stop(ShutdownReason::RemoteRestart);
        Ok(CommandResult::success("Restart initiated").for_command(command))
    }
}

/// `status`: current lifecycle status as the message
#[derive(Debug, Default)]
pub struct StatusHandler;

#[async_trait]
impl CommandHandler for StatusHandler {
    fn name(&self) -> &str {
        "status"
    }

    async fn handle(&self, ctx: &CommandContext, command: &Command) -> Result<CommandResult> {
        Ok(CommandResult::success(ctx.status().as_str()).for_command(command))
    }
}

/// `query`: one-line snapshot of the instance
#[derive(Debug, Default)]
pub struct QueryHandler;

#[async_trait]
impl CommandHandler for QueryHandler {
    fn name(&self) -> &str {
        "query"
    }

    async fn handle(&self, ctx: &CommandContext, command: &Command) -> Result<CommandResult> {
        let instance = ctx.instance();
        let message = format!(
            "node_name={},version={},status={},pid={},uptime={}",
            instance.name(),
            instance.version(),
            instance.status(),
            instance.pid(),
            instance.uptime().as_secs()
        );
        Ok(CommandResult::success(message).for_command(command))
    }
}

type BoxedResult = Pin<Box<dyn Future<Output = Result<CommandResult>> + Send>>;
type HandlerFn = dyn Fn(CommandContext, Command) -> BoxedResult + Send + Sync;

/// Caller-supplied function registered under a chosen command name
pub struct CustomHandler {
    name: String,
    handler: Box<HandlerFn>,
}

impl CustomHandler {
    /// Wrap an async function
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(CommandContext, Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandResult>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handler: Box::new(move |ctx, command| Box::pin(handler(ctx, command))),
        }
    }

    /// Wrap a plain function that answers immediately
    pub fn sync<F>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&CommandContext, &Command) -> CommandResult + Send + Sync + 'static,
    {
        Self::new(name, move |ctx, command| {
            let result = handler(&ctx, &command);
            async move { Ok(result) }
        })
    }
}

impl std::fmt::Debug for CustomHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomHandler")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl CommandHandler for CustomHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &CommandContext, command: &Command) -> Result<CommandResult> {
        (self.handler)(ctx.clone(), command.clone()).await
    }
}
