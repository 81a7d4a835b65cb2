use crate::lock::{CorruptRecordPolicy, LivenessPolicy};
use crate::transport::BrokerAddress;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub lock: LockConfig,
    /// Free-form labels merged into register and heartbeat payloads
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MqttConfig {
    /// Broker address, e.g. tcp://127.0.0.1:1883
    #[serde(default = "default_broker")]
    pub broker: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Upper bound for a single connection attempt
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound for handing a message to the client
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    /// Topics are `<prefix>/<name>/<kind>`
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    /// Buffered inbound messages per subscription
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub interval_secs: u64,

    /// Delay before the first heartbeat after connecting
    #[serde(default = "default_heartbeat_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// Management engine base URL for HTTP registration
    #[serde(default = "default_engine_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_http_registration")]
    pub http_registration: bool,

    #[serde(default = "default_engine_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LockConfig {
    /// Refuse to start while another live instance holds the lock
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub corrupt_record: CorruptRecordPolicy,

    #[serde(default)]
    pub liveness: LivenessPolicy,

    /// Directory for lock files; the host temp directory when unset
    pub dir: Option<String>,
}

impl NodeConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("nodesync.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("mqtt.broker", default_broker())?
            .set_default("mqtt.keep_alive_secs", default_keep_alive_secs())?
            .set_default("mqtt.connect_timeout_secs", default_connect_timeout_secs())?
            .set_default("mqtt.publish_timeout_secs", default_publish_timeout_secs())?
            .set_default("mqtt.topic_prefix", default_topic_prefix())?
            .set_default("mqtt.channel_capacity", default_channel_capacity() as i64)?
            .set_default("heartbeat.interval_secs", default_heartbeat_interval_secs())?
            .set_default(
                "heartbeat.initial_delay_ms",
                default_heartbeat_initial_delay_ms(),
            )?
            .set_default("reconnect.interval_secs", default_reconnect_interval_secs())?
            .set_default("engine.endpoint", default_engine_endpoint())?
            .set_default("engine.http_registration", default_http_registration())?
            .set_default("engine.timeout_secs", default_engine_timeout_secs())?
            .set_default("lock.enabled", false)?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // NODESYNC_MQTT__BROKER, NODESYNC_LOCK__ENABLED, ...
            .add_source(
                Environment::with_prefix("NODESYNC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            // Variables understood by older agents
            .set_override_option("mqtt.broker", std::env::var("MQTT_BROKER_URL").ok())?
            .set_override_option("engine.endpoint", std::env::var("NODE_ENGINE_URL").ok())?
            .build()?;

        let config: NodeConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerAddress::parse(&self.mqtt.broker)
            .map_err(|e| ConfigError::Message(format!("Invalid MQTT broker: {}", e)))?;

        if self.mqtt.connect_timeout_secs == 0 || self.mqtt.publish_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "MQTT timeouts must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.topic_prefix.trim_matches('/').is_empty() {
            return Err(ConfigError::Message(
                "MQTT topic prefix must not be empty".to_string(),
            ));
        }

        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::Message(
                "MQTT channel capacity must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat.interval_secs == 0 {
            return Err(ConfigError::Message(
                "Heartbeat interval must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.interval_secs == 0 {
            return Err(ConfigError::Message(
                "Reconnect interval must be greater than 0".to_string(),
            ));
        }

        if self.engine.http_registration && self.engine.timeout_secs == 0 {
            return Err(ConfigError::Message(
                "Engine timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl ReconnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            topic_prefix: default_topic_prefix(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval_secs(),
            initial_delay_ms: default_heartbeat_initial_delay_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconnect_interval_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: default_engine_endpoint(),
            http_registration: default_http_registration(),
            timeout_secs: default_engine_timeout_secs(),
        }
    }
}

// Default value functions
fn default_broker() -> String {
    "tcp://127.0.0.1:1883".to_string()
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_publish_timeout_secs() -> u64 {
    5
}
fn default_topic_prefix() -> String {
    "v1/subapp/pcs".to_string()
}
fn default_channel_capacity() -> usize {
    64
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_initial_delay_ms() -> u64 {
    1000
}

fn default_reconnect_interval_secs() -> u64 {
    15 * 60
} // Recovery path, deliberately far coarser than the heartbeat

fn default_engine_endpoint() -> String {
    "http://localhost:9957".to_string()
}
fn default_http_registration() -> bool {
    true
}
fn default_engine_timeout_secs() -> u64 {
    5
}
