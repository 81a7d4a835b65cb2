//! Periodic liveness and telemetry publication.

use crate::instance::Instance;
use crate::status::Status;
use crate::version::BuildInfo;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Published to `<prefix>/<name>/heartbeat` once per tick
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub timestamp: String,
    pub app_name: String,
    pub instance_id: String,
    pub status: Status,
    pub pid: u32,
    /// Whole seconds since the instance started
    pub uptime: u64,
    pub version: String,
    pub hostname: String,
    pub metrics: HeartbeatMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<BuildInfo>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatMetrics {
    /// Formatted with two decimals
    pub process_cpu_usage_percent: String,
    pub process_memory_usage_mb: u64,
    /// Background activities and in-flight commands of this instance
    pub process_task_count: usize,
}

/// Emits a heartbeat after an initial delay and then on a fixed period.
///
/// Publishing is lossy: a failed or skipped tick is not retried and the
/// next tick proceeds as usual.
pub struct HeartbeatPublisher {
    instance: Instance,
    interval: Duration,
    initial_delay: Duration,
}

impl HeartbeatPublisher {
    pub fn new(instance: Instance) -> Self {
        let config = &instance.config().heartbeat;
        let interval = config.interval();
        let initial_delay = config.initial_delay();
        Self {
            instance,
            interval,
            initial_delay,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Snapshot of the instance as a heartbeat; uptime is computed now
    pub fn build(&self) -> Heartbeat {
        let instance = &self.instance;
        let sample = instance.metrics_source().sample();

        Heartbeat {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            app_name: instance.name().to_string(),
            instance_id: instance.instance_id().to_string(),
            status: instance.status(),
            pid: instance.pid(),
            uptime: instance.uptime().as_secs(),
            version: instance.version().to_string(),
            hostname: instance.hostname().to_string(),
            metrics: HeartbeatMetrics {
                process_cpu_usage_percent: format!("{:.2}", sample.cpu_percent),
                process_memory_usage_mb: sample.memory_mb,
                process_task_count: instance.active_tasks(),
            },
            app_version: instance.build_info().cloned(),
            metadata: instance.config().metadata.clone(),
        }
    }

    /// Publish a single heartbeat. Returns whether it reached the transport.
    pub async fn publish_once(&self) -> bool {
        let id = self.instance.instance_id();
        let transport = self.instance.transport();

        if !transport.is_connected() {
            debug!("[{}] Not connected, skipping heartbeat", id);
            return false;
        }

        let payload = match serde_json::to_vec(&self.build()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("[{}] Failed to encode heartbeat: {}", id, e);
                return false;
            }
        };

        match transport
            .publish(&self.instance.topics().heartbeat, payload)
            .await
        {
            Ok(()) => {
                debug!("[{}] Heartbeat sent", id);
                true
            }
            Err(e) => {
                warn!("[{}] Heartbeat failed: {}", id, e);
                false
            }
        }
    }

    /// Tick until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let _activity = self.instance.track_activity();
        let mut ticker = interval_at(Instant::now() + self.initial_delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(
            "[{}] Heartbeat loop started, interval {:?}",
            self.instance.instance_id(),
            self.interval
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

            self.publish_once().await;
        }

        debug!("[{}] Heartbeat loop stopped", self.instance.instance_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::metrics::{ProcessMetrics, StaticMetrics};
    use crate::transport::{MemoryTransport, Transport};
    use std::sync::Arc;

    async fn start(name: &str, transport: &Arc<MemoryTransport>) -> Instance {
        let mut config = NodeConfig::default();
        config.engine.http_registration = false;
        config.heartbeat.interval_secs = 10;
        config.heartbeat.initial_delay_ms = 1000;

        Instance::builder(name)
            .config(config)
            .version("2.0.0")
            .transport(transport.clone())
            .metrics(Arc::new(StaticMetrics(ProcessMetrics {
                cpu_percent: 12.345,
                memory_mb: 128,
            })))
            .start()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_fields() {
        let transport = Arc::new(MemoryTransport::new());
        let instance = start("svc-hb-fields", &transport).await;

        let heartbeat = HeartbeatPublisher::new(instance.clone()).build();
        let value = serde_json::to_value(&heartbeat).unwrap();

        assert_eq!(value["app_name"], "svc-hb-fields");
        assert_eq!(value["instance_id"], instance.instance_id());
        assert_eq!(value["status"], "running");
        assert_eq!(value["pid"], std::process::id());
        assert_eq!(value["version"], "2.0.0");
        assert_eq!(value["metrics"]["process_cpu_usage_percent"], "12.35");
        assert_eq!(value["metrics"]["process_memory_usage_mb"], 128);
        assert!(value.get("app_version").is_none());
        assert!(value.get("metadata").is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());

        instance.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence_and_uptime() {
        let transport = Arc::new(MemoryTransport::new());
        let instance = start("svc-hb-cadence", &transport).await;
        let topic = instance.topics().heartbeat.clone();

        // Ticks at 1s, 11s, 21s and 31s
        tokio::time::sleep(Duration::from_millis(31_500)).await;

        let uptimes: Vec<u64> = transport
            .published_on(&topic)
            .iter()
            .map(|m| m.json().unwrap()["uptime"].as_u64().unwrap())
            .collect();
        assert_eq!(uptimes, vec![1, 11, 21, 31]);

        instance.stop().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.published_on(&topic).len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_does_not_stop_the_loop() {
        let transport = Arc::new(MemoryTransport::new());
        let instance = start("svc-hb-failing", &transport).await;
        let topic = instance.topics().heartbeat.clone();

        transport.set_fail_publishes(true);
        tokio::time::sleep(Duration::from_millis(11_500)).await;
        assert!(transport.published_on(&topic).is_empty());

        transport.set_fail_publishes(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.published_on(&topic).len(), 1);

        instance.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_skipped_while_disconnected() {
        let transport = Arc::new(MemoryTransport::new());
        let instance = start("svc-hb-offline", &transport).await;
        let publisher = HeartbeatPublisher::new(instance.clone());

        assert!(publisher.publish_once().await);
        transport.disconnect().await.unwrap();
        assert!(!publisher.publish_once().await);
        assert_eq!(transport.published_on(&instance.topics().heartbeat).len(), 1);

        instance.stop().await;
    }
}
