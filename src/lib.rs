pub mod command;
pub mod config;
pub mod error;
pub mod global;
pub mod heartbeat;
pub mod instance;
pub mod lock;
pub mod metrics;
pub mod registration;
pub mod status;
pub mod transport;
pub mod version;

pub use command::{
    Command, CommandContext, CommandDispatcher, CommandHandler, CommandResult, CustomHandler,
    HandlerRegistry,
};
pub use config::NodeConfig;
pub use error::{LockError, NodeSyncError, Result};
pub use heartbeat::{Heartbeat, HeartbeatPublisher};
pub use instance::{Identity, Instance, InstanceBuilder, InstanceInfo, ShutdownReason};
pub use lock::{CorruptRecordPolicy, LivenessPolicy, LockGuard, LockHandle};
pub use metrics::{MetricsSource, ProcessMetrics, StaticMetrics, SysinfoMetrics};
pub use status::Status;
pub use transport::{MemoryTransport, MqttTransport, Topics, Transport};
pub use version::BuildInfo;
