use super::{Subscription, Transport};
use crate::error::{NodeSyncError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::debug;

/// A message recorded by [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: SystemTime,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
struct MemoryState {
    reachable: bool,
    connected: bool,
    fail_publishes: bool,
    connect_attempts: usize,
    published: Vec<PublishedMessage>,
    subscribers: HashMap<String, mpsc::Sender<Vec<u8>>>,
}

/// In-process broker for tests and demos without a real MQTT server
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    capacity: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a reachable in-memory broker
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                reachable: true,
                ..Default::default()
            }),
            capacity: 64,
        }
    }

    /// Create a broker that refuses connections until made reachable
    pub fn unreachable() -> Self {
        let transport = Self::new();
        transport.set_reachable(false);
        transport
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Make subsequent publishes fail without dropping the session
    pub fn set_fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    /// Simulate losing the broker: the session drops and subscriptions close
    pub fn sever(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.subscribers.clear();
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.state.lock().subscribers.contains_key(topic)
    }

    /// Deliver a message to the subscriber of `topic`, as the broker would.
    /// Returns false when nobody is subscribed.
    pub async fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let sender = self.state.lock().subscribers.get(topic).cloned();
        match sender {
            Some(sender) => sender.send(payload.into()).await.is_ok(),
            None => {
                debug!("No subscriber for {}, message dropped", topic);
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(NodeSyncError::Connect(
                "in-memory broker unreachable".to_string(),
            ));
        }
        state.subscribers.clear();
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.subscribers.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(NodeSyncError::Publish("not connected".to_string()));
        }
        if state.fail_publishes {
            return Err(NodeSyncError::Publish(format!("publish to {} rejected", topic)));
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            timestamp: SystemTime::now(),
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(NodeSyncError::Connect(format!(
                "cannot subscribe to {} while disconnected",
                topic
            )));
        }
        let (sender, receiver) = mpsc::channel(self.capacity);
        state.subscribers.insert(topic.to_string(), sender);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let transport = MemoryTransport::new();
        assert!(transport.publish("t", b"x".to_vec()).await.is_err());

        transport.connect().await.unwrap();
        transport.publish("t", b"x".to_vec()).await.unwrap();
        assert_eq!(transport.published_on("t").len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_counts_attempts() {
        let transport = MemoryTransport::unreachable();
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());

        transport.set_reachable(true);
        transport.connect().await.unwrap();
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_sever_closes_subscriptions() {
        let transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub = transport.subscribe("ctl").await.unwrap();

        assert!(transport.inject("ctl", b"hello".to_vec()).await);
        assert_eq!(sub.recv().await.unwrap(), b"hello".to_vec());

        transport.sever();
        assert!(sub.recv().await.is_none());
        assert!(!transport.inject("ctl", b"again".to_vec()).await);
    }
}
