//! Remote control commands: wire types, the handler registry and the
//! dispatcher that routes inbound control messages to handlers.

mod dispatcher;
mod handlers;


pub use dispatcher::CommandDispatcher;
pub use handlers::{
    builtin_handlers, CustomHandler, QueryHandler, RestartHandler, StatusHandler, StopHandler,
};

use crate::error::{NodeSyncError, Result};
use crate::instance::{Instance, ShutdownReason};
use crate::status::Status;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// Inbound control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: String::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Decode a control payload
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let command: Command =
            serde_json::from_slice(payload).map_err(|e| NodeSyncError::Decode(e.to_string()))?;
        if command.command.trim().is_empty() {
            return Err(NodeSyncError::Decode("empty command name".to_string()));
        }
        Ok(command)
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Outcome of one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub request_id: String,
}

impl CommandResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            request_id: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            request_id: String::new(),
        }
    }

    /// Echo the request id of `command`
    pub fn for_command(mut self, command: &Command) -> Self {
        self.request_id = command.request_id.clone();
        self
    }
}

/// Produces a [`CommandResult`] for one command name
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Command name this handler answers to
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &CommandContext, command: &Command) -> Result<CommandResult>;
}

/// Command name to handler. The last registration for a name wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the handler's own name, returning the handler it replaced
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.insert(handler.name().to_string(), handler)
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command).cloned()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

/// What a handler sees of the instance while handling a command
#[derive(Clone)]
pub struct CommandContext {
    instance: Instance,
    received_at: Instant,
}

impl CommandContext {
    pub fn new(instance: Instance) -> Self {
        Self {
            instance,
            received_at: Instant::now(),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn status(&self) -> Status {
        self.instance.status()
    }

    /// Ask the instance to shut down; the host decides what follows
    pub fn request_stop(&self, reason: ShutdownReason) {
        self.instance.request_stop(reason);
    }

    /// Publish on an arbitrary topic through the instance's session
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.instance.publish(topic, payload).await
    }

    /// Publish a status report on the instance's status topic
    pub async fn report_status(&self, details: Value) -> Result<()> {
        self.instance.report_status(details).await
    }

    /// Forward a log line to the management plane
    pub async fn send_log(&self, level: &str, message: &str) -> Result<()> {
        self.instance.send_log(level, message).await
    }
}
