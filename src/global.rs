//! Process-wide default instance for applications that register once at
//! startup and do not want to thread the handle through their code.
//!
//! Library code should prefer passing [`Instance`] explicitly.

use crate::config::NodeConfig;
use crate::error::{NodeSyncError, Result};
use crate::instance::Instance;
use crate::lock::LockGuard;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::info;

static CURRENT: OnceLock<Mutex<Option<Instance>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Instance>> {
    CURRENT.get_or_init(|| Mutex::new(None))
}

/// Register `name` with configuration from `nodesync.toml` and the environment
pub async fn register(name: &str) -> Result<Instance> {
    register_with_config(name, NodeConfig::load()?).await
}

/// Like [`register`], with the single-instance lock enabled
pub async fn register_with_lock(name: &str) -> Result<Instance> {
    let mut config = NodeConfig::load()?;
    config.lock.enabled = true;
    register_with_config(name, config).await
}

/// Start an instance and make it the process default.
///
/// Fails while another default instance is registered and not yet shut down.
pub async fn register_with_config(name: &str, config: NodeConfig) -> Result<Instance> {
    let mut current = slot().lock().await;

    if let Some(existing) = current.as_ref() {
        return Err(NodeSyncError::AlreadyRunning {
            name: existing.name().to_string(),
            pid: Some(existing.pid()),
        });
    }

    let instance = Instance::start(name, config).await?;
    *current = Some(instance.clone());
    Ok(instance)
}

/// The process default instance, if one is registered
pub async fn current() -> Option<Instance> {
    slot().lock().await.clone()
}

/// Stop and forget the process default instance. A no-op when none is registered.
pub async fn shutdown() {
    let instance = slot().lock().await.take();
    if let Some(instance) = instance {
        info!("Shutting down default instance {}", instance.instance_id());
        instance.stop().await;
    }
}

/// Read-only check of the lock for `name`, in the lock directory the loaded
/// configuration would use
pub fn is_another_instance_running(name: &str) -> Result<(bool, Option<u32>)> {
    Ok(configured_guard(&NodeConfig::load()?).is_locked(name))
}

/// Lock file location for `name`, in the lock directory the loaded
/// configuration would use
pub fn lock_file_path(name: &str) -> Result<PathBuf> {
    Ok(configured_guard(&NodeConfig::load()?).lock_path(name))
}

fn configured_guard(config: &NodeConfig) -> LockGuard {
    LockGuard::from_config(&config.lock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_rejects_empty_name() {
        let result = register_with_config("  ", NodeConfig::default()).await;
        assert!(matches!(result, Err(NodeSyncError::InvalidArgument(_))));
        assert!(current().await.is_none());
    }

    #[test]
    fn test_lock_helpers_follow_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.lock.dir = Some(dir.path().to_string_lossy().into_owned());

        let guard = configured_guard(&config);
        assert_eq!(guard.lock_path("svc-global"), dir.path().join("svc-global.lock"));
        assert_eq!(guard.is_locked("svc-global"), (false, None));

        // Same record the instance lock would take
        let _handle = LockGuard::from_config(&config.lock).acquire("svc-global").unwrap();
        assert_eq!(
            guard.is_locked("svc-global"),
            (true, Some(std::process::id()))
        );
        assert_ne!(
            LockGuard::new().lock_path("svc-global"),
            guard.lock_path("svc-global")
        );
    }

    #[test]
    fn test_lock_file_path_defaults_to_temp_dir() {
        let path = configured_guard(&NodeConfig::default()).lock_path("svc-global");
        assert_eq!(path, std::env::temp_dir().join("svc-global.lock"));
    }

    #[tokio::test]
    async fn test_shutdown_without_instance_is_noop() {
        shutdown().await;
        assert!(current().await.is_none());
    }
}
