use super::{BrokerAddress, Subscription, Transport};
use crate::config::MqttConfig;
use crate::error::{NodeSyncError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Pause between event loop polls after a connection error
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

type Subscribers = Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>;

/// MQTT session backed by rumqttc
pub struct MqttTransport {
    config: MqttConfig,
    broker: BrokerAddress,
    client_id: String,
    client: Mutex<Option<AsyncClient>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    subscribers: Subscribers,
}

impl MqttTransport {
    pub fn new(config: MqttConfig, client_id: impl Into<String>) -> Result<Self> {
        let broker = BrokerAddress::parse(&config.broker)?;
        Ok(Self {
            config,
            broker,
            client_id: client_id.into(),
            client: Mutex::new(None),
            event_task: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn broker(&self) -> &BrokerAddress {
        &self.broker
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.client_id.clone(),
            self.broker.host.clone(),
            self.broker.port,
        );
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(true);

        if let Some(username) = &self.config.username {
            let password = self.config.password.clone().unwrap_or_default();
            options.set_credentials(username.clone(), password);
        }

        options
    }

    fn current_client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| NodeSyncError::Connect("MQTT client not initialized".to_string()))
    }

    fn stop_event_task(&self) {
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
    }

    /// Drive the rumqttc event loop: route inbound publishes to subscribers
    /// and restore subscriptions after the client reconnects on its own.
    async fn run_event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        connected: Arc<AtomicBool>,
        subscribers: Subscribers,
        first_connack: oneshot::Sender<Result<()>>,
    ) {
        let mut first_connack = Some(first_connack);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    connected.store(true, Ordering::SeqCst);
                    match first_connack.take() {
                        Some(tx) => {
                            let _ = tx.send(Ok(()));
                        }
                        None => {
                            info!("MQTT session re-established");
                            let topics: Vec<String> = subscribers.lock().keys().cloned().collect();
                            for topic in topics {
                                if let Err(e) = client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                                    warn!("Failed to restore subscription {}: {}", topic, e);
                                }
                            }
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let sender = subscribers.lock().get(&publish.topic).cloned();
                    match sender {
                        Some(sender) => {
                            if let Err(e) = sender.try_send(publish.payload.to_vec()) {
                                warn!("Dropping message on {}: {}", publish.topic, e);
                            }
                        }
                        None => debug!("Message on unsubscribed topic {}", publish.topic),
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!("Broker closed the MQTT session");
                }
                Ok(_) => {}
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    if let Some(tx) = first_connack.take() {
                        let _ = tx.send(Err(NodeSyncError::Connect(e.to_string())));
                        return;
                    }
                    warn!("MQTT connection error: {}", e);
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        // Tear down whatever is left of a previous session
        self.stop_event_task();
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.lock().clear();

        let (client, eventloop) = AsyncClient::new(self.options(), self.config.channel_capacity);
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(Self::run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.subscribers),
            tx,
        ));

        let outcome = match timeout(self.config.connect_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NodeSyncError::Connect(
                "MQTT event loop ended before connecting".to_string(),
            )),
            Err(_) => Err(NodeSyncError::Connect(format!(
                "timed out after {:?} connecting to {}",
                self.config.connect_timeout(),
                self.broker
            ))),
        };

        match outcome {
            Ok(()) => {
                *self.client.lock() = Some(client);
                *self.event_task.lock() = Some(task);
                info!("Connected to MQTT broker {} as {}", self.broker, self.client_id);
                Ok(())
            }
            Err(e) => {
                task.abort();
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let client = self.client.lock().take();
        if let Some(client) = client {
            match timeout(self.config.publish_timeout(), client.disconnect()).await {
                Ok(Ok(())) => debug!("MQTT disconnect requested"),
                Ok(Err(e)) => error!("Error disconnecting from MQTT broker: {}", e),
                Err(_) => warn!("Timed out requesting MQTT disconnect"),
            }
            // Give the event loop a moment to flush the DISCONNECT packet
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.stop_event_task();
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.lock().clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(NodeSyncError::Publish("MQTT client not connected".to_string()));
        }
        let client = self.current_client().map_err(|e| NodeSyncError::Publish(e.to_string()))?;

        match timeout(
            self.config.publish_timeout(),
            client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!("Published message to topic: {}", topic);
                Ok(())
            }
            Ok(Err(e)) => Err(NodeSyncError::Publish(e.to_string())),
            Err(_) => Err(NodeSyncError::Publish(format!(
                "timed out publishing to {}",
                topic
            ))),
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let client = self.current_client()?;
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);
        self.subscribers.lock().insert(topic.to_string(), sender);

        match timeout(
            self.config.publish_timeout(),
            client.subscribe(topic, QoS::AtLeastOnce),
        )
        .await
        {
            Ok(Ok(())) => {
                info!("Subscribed to {}", topic);
                Ok(receiver)
            }
            Ok(Err(e)) => {
                self.subscribers.lock().remove(topic);
                Err(NodeSyncError::Connect(format!("subscribe to {}: {}", topic, e)))
            }
            Err(_) => {
                self.subscribers.lock().remove(topic);
                Err(NodeSyncError::Connect(format!(
                    "timed out subscribing to {}",
                    topic
                )))
            }
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.stop_event_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(broker: &str) -> MqttConfig {
        MqttConfig {
            broker: broker.to_string(),
            connect_timeout_secs: 2,
            ..MqttConfig::default()
        }
    }

    #[test]
    fn test_rejects_invalid_broker() {
        assert!(MqttTransport::new(test_config("http://nope"), "client").is_err());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_within_timeout() {
        // Bind and drop a listener to find a port nobody is serving
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport =
            MqttTransport::new(test_config(&format!("tcp://127.0.0.1:{}", port)), "client").unwrap();

        let started = std::time::Instant::now();
        let result = transport.connect().await;

        assert!(matches!(result, Err(NodeSyncError::Connect(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails_fast() {
        let transport = MqttTransport::new(test_config("tcp://127.0.0.1:1883"), "client").unwrap();
        let result = transport.publish("t", b"payload".to_vec()).await;
        assert!(matches!(result, Err(NodeSyncError::Publish(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let transport = MqttTransport::new(test_config("tcp://127.0.0.1:1883"), "client").unwrap();
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }
}
