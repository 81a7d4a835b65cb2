use super::types::{Identity, ShutdownReason};
use crate::command::{CommandHandler, CommandResult, HandlerRegistry};
use crate::config::NodeConfig;
use crate::lock::{LockGuard, LockHandle};
use crate::metrics::MetricsSource;
use crate::status::Status;
use crate::transport::{Topics, Transport};
use crate::version::BuildInfo;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RESULT_CHANNEL_CAPACITY: usize = 32;

pub(super) type ShutdownHook = Box<dyn FnOnce() + Send + Sync>;

/// Handle to one registered application instance.
///
/// Cloning is cheap and every clone refers to the same instance. Background
/// work keeps running until [`Instance::stop`] is called.
#[derive(Clone)]
pub struct Instance {
    pub(super) inner: Arc<InstanceInner>,
}

pub(super) struct InstanceInner {
    pub(super) identity: Identity,
    pub(super) version: String,
    pub(super) build_info: Option<BuildInfo>,
    pub(super) config: NodeConfig,
    pub(super) topics: Topics,
    pub(super) started_at: Instant,
    pub(super) started_at_utc: DateTime<Utc>,

    // Shared mutable state, one lock for all of it
    pub(super) state: RwLock<InstanceState>,

    // Collaborators
    pub(super) transport: Arc<dyn Transport>,
    pub(super) metrics: Arc<dyn MetricsSource>,

    // Lifecycle management
    pub(super) cancel: CancellationToken,
    pub(super) tasks: Mutex<BackgroundTasks>,
    pub(super) lock: Mutex<Option<LockHandle>>,
    pub(super) stopped: AtomicBool,
    pub(super) activity: Arc<AtomicUsize>,
    pub(super) results: broadcast::Sender<CommandResult>,
}

pub(super) struct InstanceState {
    pub(super) status: Status,
    pub(super) connected: bool,
    pub(super) handlers: HandlerRegistry,
    pub(super) hooks: Vec<ShutdownHook>,
    pub(super) shutdown_reason: Option<ShutdownReason>,
}

#[derive(Default)]
pub(super) struct BackgroundTasks {
    pub(super) reconnect: Option<JoinHandle<()>>,
    pub(super) dispatcher: Option<JoinHandle<()>>,
    pub(super) heartbeat: Option<JoinHandle<()>>,
    pub(super) registration: Option<JoinHandle<()>>,
}

/// Counts one running activity for as long as it is alive
pub struct ActivityGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Configures and starts an [`Instance`]
pub struct InstanceBuilder {
    pub(super) name: String,
    pub(super) config: NodeConfig,
    pub(super) version: String,
    pub(super) build_info: Option<BuildInfo>,
    pub(super) transport: Option<Arc<dyn Transport>>,
    pub(super) metrics: Option<Arc<dyn MetricsSource>>,
    pub(super) handlers: Vec<Arc<dyn CommandHandler>>,
    pub(super) lock_guard: Option<LockGuard>,
}

impl InstanceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: NodeConfig::default(),
            version: String::new(),
            build_info: None,
            transport: None,
            metrics: None,
            handlers: Vec::new(),
            lock_guard: None,
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Version string reported in register, heartbeat and query output
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn build_info(mut self, build_info: BuildInfo) -> Self {
        self.build_info = Some(build_info);
        self
    }

    /// Use this transport instead of an MQTT session built from the config
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a command handler; it replaces a built-in of the same name
    pub fn handler<H: CommandHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Enable the single-instance lock
    pub fn with_lock(mut self, enabled: bool) -> Self {
        self.config.lock.enabled = enabled;
        self
    }

    /// Use this guard instead of one built from the lock config. Enables the lock.
    pub fn lock_guard(mut self, guard: LockGuard) -> Self {
        self.config.lock.enabled = true;
        self.lock_guard = Some(guard);
        self
    }
}

impl Instance {
    pub fn builder(name: impl Into<String>) -> InstanceBuilder {
        InstanceBuilder::new(name)
    }

    /// Start with the MQTT transport and process metrics described by `config`
    pub async fn start(name: impl Into<String>, config: NodeConfig) -> crate::Result<Self> {
        InstanceBuilder::new(name).config(config).start().await
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn name(&self) -> &str {
        &self.inner.identity.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.identity.instance_id
    }

    pub fn hostname(&self) -> &str {
        &self.inner.identity.hostname
    }

    pub fn pid(&self) -> u32 {
        self.inner.identity.pid
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn build_info(&self) -> Option<&BuildInfo> {
        self.inner.build_info.as_ref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn topics(&self) -> &Topics {
        &self.inner.topics
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn metrics_source(&self) -> &Arc<dyn MetricsSource> {
        &self.inner.metrics
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at_utc
    }

    /// Time since start on the monotonic clock
    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Number of background activities and in-flight commands
    pub fn active_tasks(&self) -> usize {
        self.inner.activity.load(Ordering::SeqCst)
    }

    pub fn track_activity(&self) -> ActivityGuard {
        self.inner.activity.fetch_add(1, Ordering::SeqCst);
        ActivityGuard {
            counter: Arc::clone(&self.inner.activity),
        }
    }

    /// Completes once the instance has been asked to stop
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Token cancelled together with the instance
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    /// Receive every command result produced from now on
    pub fn subscribe_results(&self) -> broadcast::Receiver<CommandResult> {
        self.inner.results.subscribe()
    }

    pub(crate) fn publish_result(&self, result: &CommandResult) {
        // No subscribers is fine
        let _ = self.inner.results.send(result.clone());
    }
}

impl InstanceInner {
    pub(super) fn new(
        identity: Identity,
        version: String,
        build_info: Option<BuildInfo>,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<dyn MetricsSource>,
        lock: Option<LockHandle>,
    ) -> Self {
        let topics = Topics::new(&config.mqtt.topic_prefix, &identity.name);
        let (results, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);

        Self {
            identity,
            version,
            build_info,
            config,
            topics,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            state: RwLock::new(InstanceState {
                status: Status::Pending,
                connected: false,
                handlers: HandlerRegistry::new(),
                hooks: Vec::new(),
                shutdown_reason: None,
            }),
            transport,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(BackgroundTasks::default()),
            lock: Mutex::new(lock),
            stopped: AtomicBool::new(false),
            activity: Arc::new(AtomicUsize::new(0)),
            results,
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("instance_id", &self.instance_id())
            .field("status", &self.status())
            .field("connected", &self.is_connected())
            .finish()
    }
}
