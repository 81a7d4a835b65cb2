use super::{Command, CommandContext, CommandResult};
use crate::error::NodeSyncError;
use crate::instance::Instance;
use crate::transport::Subscription;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Routes control messages to the instance's registered handlers.
///
/// Results are logged and broadcast to in-process subscribers; nothing is
/// sent back over the transport. Malformed payloads, unknown commands and
/// anything arriving after the instance was asked to stop are dropped.
#[derive(Clone)]
pub struct CommandDispatcher {
    instance: Instance,
}

impl CommandDispatcher {
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }

    /// Handle one raw control payload. `None` when the message was dropped.
    pub async fn dispatch(&self, payload: &[u8]) -> Option<CommandResult> {
        let id = self.instance.instance_id();

        let command = match Command::decode(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("[{}] Dropping control message: {}", id, e);
                return None;
            }
        };

        if self.instance.is_cancelled() {
            warn!(
                "[{}] Shutting down, dropping command '{}' (request_id='{}')",
                id, command.command, command.request_id
            );
            return None;
        }

        info!(
            "[{}] Received command '{}' (request_id='{}')",
            id, command.command, command.request_id
        );

        let Some(handler) = self.instance.handler(&command.command) else {
            warn!(
                "[{}] {}",
                id,
                NodeSyncError::UnknownCommand(command.command.clone())
            );
            return None;
        };

        let _activity = self.instance.track_activity();
        let ctx = CommandContext::new(self.instance.clone());

        let mut result = match handler.handle(&ctx, &command).await {
            Ok(result) => {
                info!(
                    "[{}] Command '{}' finished: success={} message='{}'",
                    id, command.command, result.success, result.message
                );
                result
            }
            Err(e) => {
                error!("[{}] Command '{}' failed: {}", id, command.command, e);
                CommandResult::failure(e.to_string())
            }
        };

        if result.request_id.is_empty() {
            result.request_id = command.request_id.clone();
        }

        self.instance.publish_result(&result);
        Some(result)
    }

    /// Consume a control subscription until it closes or `cancel` fires.
    ///
    /// Each message is handled in its own task so a slow handler does not
    /// hold up the next command. Messages arriving after cancellation are
    /// not started.
    pub async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        let _activity = self.instance.track_activity();
        let id = self.instance.instance_id().to_string();
        debug!("[{}] Command dispatcher started", id);

        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                payload = subscription.recv() => payload,
            };

            let Some(payload) = payload else {
                debug!("[{}] Control subscription closed", id);
                break;
            };

            if cancel.is_cancelled() {
                break;
            }

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(&payload).await;
            });
        }

        debug!("[{}] Command dispatcher stopped", id);
    }
}
