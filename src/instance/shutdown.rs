use super::types::ShutdownReason;
use super::Instance;
use crate::status::Status;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Upper bound for a background task to notice cancellation
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl Instance {
    /// Ask the instance to stop without waiting for teardown.
    ///
    /// Moves to `stopping`, records the first reason given and fires the
    /// cancellation signal. The host is expected to call [`Instance::stop`].
    pub fn request_stop(&self, reason: ShutdownReason) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            debug!("[{}] Stop already completed, ignoring {:?}", self.instance_id(), reason);
            return;
        }

        info!("[{}] Stop requested: {:?}", self.instance_id(), reason);
        self.inner
            .state
            .write()
            .shutdown_reason
            .get_or_insert(reason);
        self.transition(Status::Stopping);
        self.inner.cancel.cancel();
    }

    /// First recorded shutdown reason, if any
    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.inner.state.read().shutdown_reason.clone()
    }

    /// Register a function to run during [`Instance::stop`]. Hooks run in
    /// reverse registration order.
    pub fn add_shutdown_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.inner.state.write().hooks.push(Box::new(hook));
    }

    /// Tear the instance down. Safe to call more than once and after a
    /// partial start; only the first call does anything.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!("[{}] Already stopped", self.instance_id());
            return;
        }

        info!("[{}] Beginning shutdown", self.instance_id());

        self.inner
            .state
            .write()
            .shutdown_reason
            .get_or_insert(ShutdownReason::Requested);
        self.transition(Status::Stopping);

        // Cancel all background tasks
        self.inner.cancel.cancel();

        // The reconnect loop may still be bringing a session up; let it
        // finish before collecting what that session spawned
        let reconnect = self.inner.tasks.lock().reconnect.take();
        if let Some(handle) = reconnect {
            self.join_task("reconnect", handle).await;
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        if let Some(handle) = tasks.registration {
            handle.abort();
        }
        if let Some(handle) = tasks.dispatcher {
            self.join_task("dispatcher", handle).await;
        }
        if let Some(handle) = tasks.heartbeat {
            self.join_task("heartbeat", handle).await;
        }

        let transport = self.transport();
        match timeout(self.config().mqtt.publish_timeout(), transport.disconnect()).await {
            Ok(Ok(())) => debug!("[{}] Transport disconnected", self.instance_id()),
            Ok(Err(e)) => warn!("[{}] Error disconnecting: {}", self.instance_id(), e),
            Err(_) => warn!("[{}] Disconnect timed out", self.instance_id()),
        }
        self.set_connected(false);

        if let Some(mut lock) = self.inner.lock.lock().take() {
            lock.release();
            info!("[{}] Lock released: {}", self.instance_id(), lock.path().display());
        }

        let hooks = std::mem::take(&mut self.inner.state.write().hooks);
        debug!("[{}] Running {} shutdown hooks", self.instance_id(), hooks.len());
        for (index, hook) in hooks.into_iter().enumerate().rev() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "[{}] Shutdown hook {} panicked: {}",
                    self.instance_id(),
                    index,
                    reason
                );
            }
        }

        self.transition(Status::Stopped);
        info!("[{}] Shutdown complete", self.instance_id());
    }

    async fn join_task(&self, task: &str, mut handle: JoinHandle<()>) {
        match timeout(TASK_STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => debug!("[{}] {} task stopped", self.instance_id(), task),
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!("[{}] {} task failed: {}", self.instance_id(), task, e),
            Err(_) => {
                warn!(
                    "[{}] {} task did not stop within {:?}, aborting",
                    self.instance_id(),
                    task,
                    TASK_STOP_TIMEOUT
                );
                handle.abort();
            }
        }
    }
}
