use super::Instance;
use crate::status::Status;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Instance {
    pub(super) fn spawn_reconnect_loop(&self) {
        let instance = self.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move { instance.reconnect_loop(cancel).await });

        if let Some(previous) = self.inner.tasks.lock().reconnect.replace(handle) {
            previous.abort();
        }
    }

    /// Fixed-period recovery loop. Runs for the lifetime of the instance.
    async fn reconnect_loop(self, cancel: CancellationToken) {
        let _activity = self.track_activity();
        let period = self.config().reconnect.interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "[{}] Reconnect supervisor started, interval {:?}",
            self.instance_id(),
            period
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            self.reconnect_tick().await;
        }

        info!("[{}] Reconnect supervisor stopped", self.instance_id());
    }

    /// One supervisor pass. Returns whether a session is up afterwards.
    pub(super) async fn reconnect_tick(&self) -> bool {
        let id = self.instance_id();

        if self.is_connected() {
            if self.transport().is_connected() {
                debug!("[{}] Session healthy", id);
                return true;
            }
            warn!("[{}] Transport session lost", id);
            self.set_connected(false);
            self.transition(Status::Error);
        }

        info!("[{}] Attempting to reconnect", id);
        match self.connect_session().await {
            Ok(()) => {
                info!("[{}] Reconnected", id);
                true
            }
            Err(e) => {
                warn!(
                    "[{}] Reconnect failed: {}, next attempt in {:?}",
                    id,
                    e,
                    self.config().reconnect.interval()
                );
                false
            }
        }
    }
}
