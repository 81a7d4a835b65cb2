//! Publish/subscribe session against a single broker.

mod memory;
mod mqtt;

pub use memory::{MemoryTransport, PublishedMessage};
pub use mqtt::MqttTransport;

use crate::error::{NodeSyncError, Result};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;
use url::Url;

/// Inbound payloads for one subscribed topic
pub type Subscription = mpsc::Receiver<Vec<u8>>;

/// Session with a publish/subscribe broker.
///
/// Implementations bound every blocking step (connect, publish, subscribe)
/// with a timeout so callers observe cancellation promptly.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh session, replacing any previous one
    async fn connect(&self) -> Result<()>;

    /// Close the session; a no-op when not connected
    async fn disconnect(&self) -> Result<()>;

    /// Whether the session is currently usable
    fn is_connected(&self) -> bool;

    /// Publish with at-least-once delivery
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to `topic`. The returned channel closes when the session ends.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Topic set for one application name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub register: String,
    pub heartbeat: String,
    pub control: String,
    pub status: String,
    pub log: String,
}

impl Topics {
    pub fn new(prefix: &str, name: &str) -> Self {
        let base = format!("{}/{}", prefix.trim_end_matches('/'), name);
        Self {
            register: format!("{}/register", base),
            heartbeat: format!("{}/heartbeat", base),
            control: format!("{}/control", base),
            status: format!("{}/status", base),
            log: format!("{}/log", base),
        }
    }
}

/// Host and port of an MQTT broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub const DEFAULT_PORT: u16 = 1883;

    /// Parse `tcp://host:port`, `mqtt://host:port` or a bare `host[:port]`
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(NodeSyncError::InvalidArgument(
                "broker address is empty".to_string(),
            ));
        }

        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("tcp://{}", address)
        };

        let url = Url::parse(&with_scheme).map_err(|e| {
            NodeSyncError::InvalidArgument(format!("broker address '{}': {}", address, e))
        })?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            other => {
                return Err(NodeSyncError::InvalidArgument(format!(
                    "unsupported broker scheme '{}'",
                    other
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                NodeSyncError::InvalidArgument(format!("broker address '{}' has no host", address))
            })?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        Ok(Self {
            host,
            port: url.port().unwrap_or(Self::DEFAULT_PORT),
        })
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_are_derived_from_name() {
        let topics = Topics::new("v1/subapp/pcs", "svc-a");
        assert_eq!(topics.register, "v1/subapp/pcs/svc-a/register");
        assert_eq!(topics.heartbeat, "v1/subapp/pcs/svc-a/heartbeat");
        assert_eq!(topics.control, "v1/subapp/pcs/svc-a/control");
        assert_eq!(topics.status, "v1/subapp/pcs/svc-a/status");
        assert_eq!(topics.log, "v1/subapp/pcs/svc-a/log");

        assert_eq!(Topics::new("v1/subapp/pcs/", "svc-a"), topics);
    }

    #[test]
    fn test_broker_address_parsing() {
        let addr = BrokerAddress::parse("tcp://127.0.0.1:1883").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 1883);

        let addr = BrokerAddress::parse("mqtt://broker.local").unwrap();
        assert_eq!(addr.host, "broker.local");
        assert_eq!(addr.port, BrokerAddress::DEFAULT_PORT);

        let addr = BrokerAddress::parse("10.1.2.3:1884").unwrap();
        assert_eq!(addr.to_string(), "tcp://10.1.2.3:1884");
    }

    #[test]
    fn test_broker_address_rejects_garbage() {
        assert!(BrokerAddress::parse("").is_err());
        assert!(BrokerAddress::parse("http://broker:80").is_err());
        assert!(BrokerAddress::parse("not a broker").is_err());
    }
}
