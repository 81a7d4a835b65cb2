use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Who an instance is: application name, host and process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub name: String,
    /// `<name>-<hostname>-<pid>`, unique per host and process
    pub instance_id: String,
    pub hostname: String,
    pub pid: u32,
}

impl Identity {
    /// Identity of the current process
    pub fn current(name: &str) -> Self {
        Self::new(name, &crate::metrics::hostname(), std::process::id())
    }

    pub fn new(name: &str, hostname: &str, pid: u32) -> Self {
        Self {
            name: name.to_string(),
            instance_id: instance_id(name, hostname, pid),
            hostname: hostname.to_string(),
            pid,
        }
    }
}

pub fn instance_id(name: &str, hostname: &str, pid: u32) -> String {
    format!("{}-{}-{}", name, hostname, pid)
}

/// Why an instance was asked to shut down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    Signal(String),
    RemoteStop,
    RemoteRestart,
    Requested,
}

impl ShutdownReason {
    /// Whether the host should start the application again
    pub fn wants_restart(&self) -> bool {
        matches!(self, ShutdownReason::RemoteRestart)
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    #[serde(flatten)]
    pub identity: Identity,
    pub version: String,
    pub status: Status,
    pub connected: bool,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
    pub lock_path: Option<PathBuf>,
    pub commands: Vec<String>,
}
