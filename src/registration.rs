//! Registration payloads: the register-topic message sent on every connect
//! and the best-effort HTTP registration with the management engine.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::instance::Identity;
use crate::version::BuildInfo;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capabilities advertised in the register message
pub const CAPABILITIES: [&str; 2] = ["mqtt_control", "heartbeat"];

/// Path of the engine's registration endpoint
pub const REGISTER_PATH: &str = "/api/nodes/register";

/// Published to `<prefix>/<name>/register` after each successful connect
#[derive(Debug, Clone, Serialize)]
pub struct RegisterMessage {
    pub timestamp: String,
    pub app_name: String,
    pub instance_id: String,
    pub version: String,
    pub pid: u32,
    pub start_time: String,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<BuildInfo>,
}

impl RegisterMessage {
    pub fn new(
        identity: &Identity,
        version: &str,
        started_at: DateTime<Utc>,
        metadata: &HashMap<String, String>,
        app_version: Option<&BuildInfo>,
    ) -> Self {
        let mut metadata = metadata.clone();
        metadata.insert("hostname".to_string(), identity.hostname.clone());

        Self {
            timestamp: rfc3339(Utc::now()),
            app_name: identity.name.clone(),
            instance_id: identity.instance_id.clone(),
            version: version.to_string(),
            pid: identity.pid,
            start_time: rfc3339(started_at),
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            metadata,
            app_version: app_version.cloned(),
        }
    }
}

/// Body of the HTTP registration call
#[derive(Debug, Clone, Serialize)]
pub struct HttpRegistration {
    pub node_name: String,
    pub instance_id: String,
    pub hostname: String,
    pub pid: u32,
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time: Option<String>,
}

impl HttpRegistration {
    /// Build the body; `APP_BUILD_ID` and `APP_BUILD_TIME` are picked up from the environment
    pub fn new(identity: &Identity, metadata: &HashMap<String, String>) -> Self {
        Self {
            node_name: identity.name.clone(),
            instance_id: identity.instance_id.clone(),
            hostname: identity.hostname.clone(),
            pid: identity.pid,
            metadata: metadata.clone(),
            build_id: non_empty_env("APP_BUILD_ID"),
            build_time: non_empty_env("APP_BUILD_TIME"),
        }
    }
}

/// Posts registrations to the management engine
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistrar {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            url: format!("{}{}", config.endpoint.trim_end_matches('/'), REGISTER_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the registration. Any non-success status is an error.
    pub async fn register(&self, body: &HttpRegistration) -> Result<()> {
        debug!("Registering {} via {}", body.instance_id, self.url);
        self.client
            .post(&self.url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Run the registration in the background; failures are only logged
    pub fn spawn(self, body: HttpRegistration) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.register(&body).await {
                Ok(()) => info!("HTTP registration accepted for {}", body.instance_id),
                Err(e) => warn!("HTTP registration failed: {} (continuing)", e),
            }
        })
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
