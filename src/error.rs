use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeSyncError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Another instance of '{name}' is already running{}", owner_suffix(.pid))]
    AlreadyRunning { name: String, pid: Option<u32> },

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("No handler registered for command '{0}'")]
    UnknownCommand(String),

    #[error("Command '{command}' failed: {message}")]
    Handler { command: String, message: String },

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("System error: {message}")]
    System { message: String },
}

/// Lock record errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {} is held{}", .path.display(), owner_suffix(.pid))]
    Busy { path: PathBuf, pid: Option<u32> },

    #[error("Lock {} could not be created: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn owner_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {})", pid),
        None => String::new(),
    }
}

impl NodeSyncError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn handler<S: Into<String>>(command: S, message: S) -> Self {
        Self::Handler {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Errors the agent degrades around instead of surfacing to the caller of start
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            NodeSyncError::Connect(_)
                | NodeSyncError::Decode(_)
                | NodeSyncError::Publish(_)
                | NodeSyncError::UnknownCommand(_)
                | NodeSyncError::Handler { .. }
                | NodeSyncError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_message_names_owner() {
        let err = NodeSyncError::AlreadyRunning {
            name: "svc-a".to_string(),
            pid: Some(4242),
        };
        assert_eq!(
            err.to_string(),
            "Another instance of 'svc-a' is already running (pid 4242)"
        );

        let err = NodeSyncError::AlreadyRunning {
            name: "svc-a".to_string(),
            pid: None,
        };
        assert_eq!(err.to_string(), "Another instance of 'svc-a' is already running");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(NodeSyncError::Connect("refused".into()).is_recoverable());
        assert!(NodeSyncError::Publish("timeout".into()).is_recoverable());
        assert!(!NodeSyncError::InvalidArgument("empty name".into()).is_recoverable());
        assert!(!NodeSyncError::AlreadyRunning {
            name: "x".into(),
            pid: None
        }
        .is_recoverable());
    }
}
