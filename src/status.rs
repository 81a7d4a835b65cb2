use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Discovered,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Discovered => "discovered",
            Status::Pending => "pending",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Error => "error",
            Status::Unknown => "unknown",
        }
    }

    /// Position on the forward path; `None` for states outside it
    fn rank(&self) -> Option<u8> {
        match self {
            Status::Discovered => Some(0),
            Status::Pending => Some(1),
            Status::Starting => Some(2),
            Status::Running => Some(3),
            Status::Stopping => Some(4),
            Status::Stopped => Some(5),
            Status::Error | Status::Unknown => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Status::Stopped
    }

    /// Whether a move from `self` to `next` is allowed.
    ///
    /// Forward moves along discovered → pending → starting → running →
    /// stopping → stopped are allowed, skipping steps included. `error` can
    /// be entered from any live state and left only towards running or the
    /// shutdown states. `stopped` is terminal. Re-asserting the current
    /// state is always allowed.
    pub fn can_transition_to(&self, next: Status) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Status::Unknown) => false,
            (Status::Unknown, _) => true,
            (Status::Stopping, Status::Error) => false,
            (_, Status::Error) => true,
            (Status::Error, Status::Running | Status::Stopping | Status::Stopped) => true,
            (Status::Error, _) => false,
            (current, next) => match (current.rank(), next.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(Status::Discovered),
            "pending" => Ok(Status::Pending),
            "starting" => Ok(Status::Starting),
            "running" => Ok(Status::Running),
            "stopping" => Ok(Status::Stopping),
            "stopped" => Ok(Status::Stopped),
            "error" => Ok(Status::Error),
            "unknown" => Ok(Status::Unknown),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}
