use super::handle::{InstanceBuilder, InstanceInner};
use super::types::Identity;
use super::Instance;
use crate::command::{builtin_handlers, CommandDispatcher};
use crate::error::{LockError, NodeSyncError, Result};
use crate::heartbeat::HeartbeatPublisher;
use crate::lock::LockGuard;
use crate::metrics::{MetricsSource, SysinfoMetrics};
use crate::registration::{HttpRegistrar, HttpRegistration, RegisterMessage};
use crate::status::Status;
use crate::transport::{MqttTransport, Subscription, Transport};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl InstanceBuilder {
    /// Start the instance.
    ///
    /// Only an empty name, an invalid config or a busy lock fail here. An
    /// unreachable broker is logged and left to the background reconnect
    /// loop, so this returns after at most one connection attempt.
    pub async fn start(self) -> Result<Instance> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(NodeSyncError::InvalidArgument(
                "application name must not be empty".to_string(),
            ));
        }
        self.config.validate()?;

        let identity = Identity::current(&name);

        let lock = if self.config.lock.enabled {
            let guard = self
                .lock_guard
                .unwrap_or_else(|| LockGuard::from_config(&self.config.lock));
            match guard.acquire(&name) {
                Ok(handle) => {
                    info!("[{}] Lock acquired: {}", identity.instance_id, handle.path().display());
                    Some(handle)
                }
                Err(LockError::Busy { pid, .. }) => {
                    return Err(NodeSyncError::AlreadyRunning { name, pid });
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(MqttTransport::new(
                self.config.mqtt.clone(),
                identity.instance_id.clone(),
            )?),
        };
        let metrics: Arc<dyn MetricsSource> = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(SysinfoMetrics::new()),
        };

        let instance = Instance {
            inner: Arc::new(InstanceInner::new(
                identity,
                self.version,
                self.build_info,
                self.config,
                transport,
                metrics,
                lock,
            )),
        };

        info!(
            "Instance info: name={}, instance_id={}, hostname={}, pid={}",
            instance.name(),
            instance.instance_id(),
            instance.hostname(),
            instance.pid()
        );

        instance.transition(Status::Starting);

        {
            let mut state = instance.inner.state.write();
            for handler in builtin_handlers().into_iter().chain(self.handlers) {
                state.handlers.register(handler);
            }
        }

        match instance.connect_session().await {
            Ok(()) => info!("[{}] Connected", instance.instance_id()),
            Err(e) => {
                warn!(
                    "[{}] Initial connection failed: {}, retrying in the background",
                    instance.instance_id(),
                    e
                );
                instance.transition(Status::Error);
            }
        }

        instance.spawn_reconnect_loop();

        if instance.config().engine.http_registration {
            instance.spawn_http_registration();
        }

        Ok(instance)
    }
}

impl Instance {
    /// Open a transport session and bring up everything that rides on it:
    /// the control subscription, the dispatcher, the register message and
    /// the heartbeat loop.
    pub(super) async fn connect_session(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(NodeSyncError::system("instance is shutting down"));
        }

        let transport = self.transport();
        transport.connect().await?;

        let subscription = match transport.subscribe(&self.topics().control).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = transport.disconnect().await;
                return Err(e);
            }
        };

        if self.is_cancelled() {
            let _ = transport.disconnect().await;
            return Err(NodeSyncError::system("instance is shutting down"));
        }

        self.set_connected(true);
        self.transition(Status::Running);

        self.spawn_dispatcher(subscription);
        self.publish_register().await;
        self.ensure_heartbeat();

        Ok(())
    }

    fn spawn_dispatcher(&self, subscription: Subscription) {
        let dispatcher = CommandDispatcher::new(self.clone());
        let handle = tokio::spawn(dispatcher.run(subscription, self.inner.cancel.clone()));

        if let Some(previous) = self.inner.tasks.lock().dispatcher.replace(handle) {
            previous.abort();
        }
        debug!("[{}] Listening on {}", self.instance_id(), self.topics().control);
    }

    fn ensure_heartbeat(&self) {
        let mut tasks = self.inner.tasks.lock();
        if tasks.heartbeat.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let publisher = HeartbeatPublisher::new(self.clone());
        tasks.heartbeat = Some(tokio::spawn(publisher.run(self.inner.cancel.clone())));
    }

    async fn publish_register(&self) {
        let message = RegisterMessage::new(
            self.identity(),
            self.version(),
            self.started_at(),
            &self.config().metadata,
            self.build_info(),
        );

        let result = match serde_json::to_vec(&message) {
            Ok(payload) => self.transport().publish(&self.topics().register, payload).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => info!("[{}] Register message sent", self.instance_id()),
            Err(e) => warn!("[{}] Failed to send register message: {}", self.instance_id(), e),
        }
    }

    fn spawn_http_registration(&self) {
        let registrar = match HttpRegistrar::new(&self.config().engine) {
            Ok(registrar) => registrar,
            Err(e) => {
                warn!("[{}] HTTP registration unavailable: {}", self.instance_id(), e);
                return;
            }
        };

        let body = HttpRegistration::new(self.identity(), &self.config().metadata);
        let handle = registrar.spawn(body);
        self.inner.tasks.lock().registration = Some(handle);
    }
}
