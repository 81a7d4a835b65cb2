use super::types::InstanceInfo;
use super::Instance;
use crate::command::{CommandDispatcher, CommandHandler, CommandResult};
use crate::error::Result;
use crate::status::Status;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

impl Instance {
    /// Current lifecycle status
    pub fn status(&self) -> Status {
        self.inner.state.read().status
    }

    /// Move to `next` if the transition table allows it.
    ///
    /// Every status change goes through here. Returns false, leaving the
    /// status untouched, when the move is not allowed.
    pub fn transition(&self, next: Status) -> bool {
        let mut state = self.inner.state.write();
        let current = state.status;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            drop(state);
            warn!(
                "[{}] Ignoring status change {} -> {}",
                self.instance_id(),
                current,
                next
            );
            return false;
        }
        state.status = next;
        drop(state);

        debug!("[{}] Status {} -> {}", self.instance_id(), current, next);
        true
    }

    /// Whether the lifecycle manager holds a live session
    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    pub(super) fn set_connected(&self, connected: bool) {
        self.inner.state.write().connected = connected;
    }

    /// Register or replace a command handler, including while dispatching
    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        let name = handler.name().to_string();
        if self.inner.state.write().handlers.register(handler).is_some() {
            debug!("[{}] Replaced handler for '{}'", self.instance_id(), name);
        }
    }

    pub fn handler(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.inner.state.read().handlers.get(command)
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.state.read().handlers.names()
    }

    /// Path of the held lock record, if the lock is enabled and still held
    pub fn lock_path(&self) -> Option<PathBuf> {
        self.inner
            .lock
            .lock()
            .as_ref()
            .filter(|handle| !handle.is_released())
            .map(|handle| handle.path().to_path_buf())
    }

    pub fn info(&self) -> InstanceInfo {
        let (status, connected, commands) = {
            let state = self.inner.state.read();
            (state.status, state.connected, state.handlers.names())
        };

        InstanceInfo {
            identity: self.identity().clone(),
            version: self.version().to_string(),
            status,
            connected,
            uptime_secs: self.uptime().as_secs(),
            started_at: self.started_at(),
            lock_path: self.lock_path(),
            commands,
        }
    }

    /// Publish through the instance's transport session
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.transport().publish(topic, payload).await
    }

    /// Publish `{status, pid, details}` on the status topic
    pub async fn report_status(&self, details: Value) -> Result<()> {
        let payload = json!({
            "status": self.status(),
            "pid": self.pid(),
            "details": details,
        });
        let payload = serde_json::to_vec(&payload)?;
        self.publish(&self.topics().status, payload).await
    }

    /// Publish `{level, message, source}` on the log topic
    pub async fn send_log(&self, level: &str, message: &str) -> Result<()> {
        let payload = json!({
            "level": level,
            "message": message,
            "source": self.name(),
        });
        let payload = serde_json::to_vec(&payload)?;
        self.publish(&self.topics().log, payload).await
    }

    /// Handle a raw control payload as if it had arrived on the control topic.
    /// Nothing is handled once the instance has been asked to stop.
    pub async fn dispatch(&self, payload: &[u8]) -> Option<CommandResult> {
        CommandDispatcher::new(self.clone()).dispatch(payload).await
    }
}
