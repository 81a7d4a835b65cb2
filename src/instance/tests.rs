use super::*;
use crate::command::CommandResult;
use crate::config::NodeConfig;
use crate::error::NodeSyncError;
use crate::lock::LockGuard;
use crate::metrics::{ProcessMetrics, StaticMetrics};
use crate::status::Status;
use crate::transport::{MemoryTransport, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const RECONNECT_SECS: u64 = 60;

fn create_test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.engine.http_registration = false;
    config.reconnect.interval_secs = RECONNECT_SECS;
    config.heartbeat.interval_secs = 10;
    config.heartbeat.initial_delay_ms = 1000;
    config
        .metadata
        .insert("region".to_string(), "test".to_string());
    config
}

fn builder(name: &str, transport: &Arc<MemoryTransport>) -> InstanceBuilder {
    Instance::builder(name)
        .config(create_test_config())
        .version("0.9.0")
        .transport(transport.clone())
        .metrics(Arc::new(StaticMetrics(ProcessMetrics {
            cpu_percent: 2.5,
            memory_mb: 64,
        })))
}

#[tokio::test]
async fn test_empty_name_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());

    for name in ["", "   "] {
        let result = builder(name, &transport).start().await;
        assert!(matches!(result, Err(NodeSyncError::InvalidArgument(_))));
    }
    assert_eq!(transport.connect_attempts(), 0);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let mut config = create_test_config();
    config.heartbeat.interval_secs = 0;

    let result = builder("svc-bad-config", &transport).config(config).start().await;
    assert!(matches!(result, Err(NodeSyncError::Config(_))));
}

#[tokio::test]
async fn test_start_connects_and_registers() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-start", &transport).start().await.unwrap();

    assert_eq!(instance.status(), Status::Running);
    assert!(instance.is_connected());
    assert!(transport.is_subscribed("v1/subapp/pcs/svc-start/control"));
    assert_eq!(
        instance.instance_id(),
        format!("svc-start-{}-{}", instance.hostname(), std::process::id())
    );

    let registrations = transport.published_on("v1/subapp/pcs/svc-start/register");
    assert_eq!(registrations.len(), 1);
    let body = registrations[0].json().unwrap();
    assert_eq!(body["app_name"], "svc-start");
    assert_eq!(body["instance_id"], instance.instance_id());
    assert_eq!(body["version"], "0.9.0");
    assert_eq!(body["pid"], std::process::id());
    assert_eq!(body["metadata"]["region"], "test");
    assert_eq!(body["metadata"]["hostname"], instance.hostname());

    instance.stop().await;
}

#[tokio::test]
async fn test_unreachable_broker_does_not_fail_start() {
    let transport = Arc::new(MemoryTransport::unreachable());
    let instance = builder("svc-offline", &transport).start().await.unwrap();

    assert_eq!(instance.status(), Status::Error);
    assert!(!instance.is_connected());
    assert_eq!(transport.connect_attempts(), 1);

    // Still answers locally
    let result = instance.dispatch(br#"{"command":"status"}"#).await.unwrap();
    assert_eq!(result.message, "error");

    instance.stop().await;
    assert_eq!(instance.status(), Status::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_loop_recovers_after_broker_returns() {
    let transport = Arc::new(MemoryTransport::unreachable());
    let instance = builder("svc-recover", &transport).start().await.unwrap();
    assert_eq!(instance.status(), Status::Error);

    // Still down at the first tick
    tokio::time::sleep(Duration::from_secs(RECONNECT_SECS + 1)).await;
    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(instance.status(), Status::Error);

    transport.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(RECONNECT_SECS)).await;

    assert_eq!(transport.connect_attempts(), 3);
    assert_eq!(instance.status(), Status::Running);
    assert!(instance.is_connected());
    assert!(transport.is_subscribed(&instance.topics().control));
    assert_eq!(transport.published_on(&instance.topics().register).len(), 1);

    instance.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_healthy_session_is_left_alone() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-healthy", &transport).start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(RECONNECT_SECS * 3 + 1)).await;

    assert_eq!(transport.connect_attempts(), 1);
    assert_eq!(transport.published_on(&instance.topics().register).len(), 1);
    instance.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_session_is_detected_and_restored() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-lost", &transport).start().await.unwrap();
    let control = instance.topics().control.clone();

    transport.sever();
    assert!(!transport.is_subscribed(&control));
    // The lifecycle flag only changes at the next supervisor pass
    assert!(instance.is_connected());

    tokio::time::sleep(Duration::from_secs(RECONNECT_SECS + 1)).await;

    assert_eq!(transport.connect_attempts(), 2);
    assert_eq!(instance.status(), Status::Running);
    assert!(transport.is_subscribed(&control));
    assert_eq!(transport.published_on(&instance.topics().register).len(), 2);

    // Commands flow through the restored subscription
    let mut results = instance.subscribe_results();
    assert!(transport.inject(&control, br#"{"command":"status"}"#.to_vec()).await);
    let result = tokio::time::timeout(Duration::from_secs(1), results.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.message, "running");

    instance.stop().await;
}

#[tokio::test]
async fn test_reconnect_tick_marks_lost_session() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-tick", &transport).start().await.unwrap();

    transport.sever();
    transport.set_reachable(false);

    assert!(!instance.reconnect_tick().await);
    assert!(!instance.is_connected());
    assert_eq!(instance.status(), Status::Error);

    transport.set_reachable(true);
    assert!(instance.reconnect_tick().await);
    assert_eq!(instance.status(), Status::Running);

    instance.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_runs_hooks_in_reverse() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-hooks", &transport).start().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 1..=3 {
        let order = Arc::clone(&order);
        instance.add_shutdown_hook(move || order.lock().push(i));
    }

    instance.stop().await;
    assert_eq!(*order.lock(), vec![3, 2, 1]);
    assert_eq!(instance.status(), Status::Stopped);
    assert!(!instance.is_connected());
    assert!(!transport.is_connected());
    assert_eq!(instance.shutdown_reason(), Some(ShutdownReason::Requested));

    // Second call does nothing
    instance.stop().await;
    assert_eq!(order.lock().len(), 3);
    assert_eq!(instance.status(), Status::Stopped);

    // Stop requests after teardown are ignored
    instance.request_stop(ShutdownReason::RemoteStop);
    assert_eq!(instance.status(), Status::Stopped);
    assert_eq!(instance.shutdown_reason(), Some(ShutdownReason::Requested));
}

#[tokio::test]
async fn test_panicking_hook_does_not_abort_teardown() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-bad-hook", &transport).start().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&order);
    instance.add_shutdown_hook(move || first.lock().push("first"));
    instance.add_shutdown_hook(|| panic!("hook failed"));
    let last = Arc::clone(&order);
    instance.add_shutdown_hook(move || last.lock().push("last"));

    instance.stop().await;

    assert_eq!(*order.lock(), vec!["last", "first"]);
    assert_eq!(instance.status(), Status::Stopped);
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_concurrent_stop_calls() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-concurrent-stop", &transport).start().await.unwrap();

    let hits = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&hits);
    instance.add_shutdown_hook(move || *counter.lock() += 1);

    let a = instance.clone();
    let b = instance.clone();
    tokio::join!(a.stop(), b.stop());

    assert_eq!(*hits.lock(), 1);
}

#[tokio::test]
async fn test_background_tasks_are_counted_and_released() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-tasks", &transport).start().await.unwrap();
    tokio::task::yield_now().await;

    // dispatcher, heartbeat and reconnect loops
    assert!(instance.active_tasks() >= 3);

    instance.stop().await;
    assert_eq!(instance.active_tasks(), 0);
}

#[tokio::test]
async fn test_lock_blocks_second_instance() {
    let dir = tempfile::tempdir().unwrap();
    let guard = LockGuard::in_dir(dir.path());
    let transport = Arc::new(MemoryTransport::new());

    let first = builder("svc-locked", &transport)
        .lock_guard(guard.clone())
        .start()
        .await
        .unwrap();
    let path = guard.lock_path("svc-locked");
    assert_eq!(first.lock_path(), Some(path.clone()));
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        std::process::id().to_string()
    );

    let second = builder("svc-locked", &Arc::new(MemoryTransport::new()))
        .lock_guard(guard.clone())
        .start()
        .await;
    match second {
        Err(NodeSyncError::AlreadyRunning { name, pid }) => {
            assert_eq!(name, "svc-locked");
            assert_eq!(pid, Some(std::process::id()));
        }
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }

    first.stop().await;
    assert!(!path.exists());
    assert_eq!(guard.is_locked("svc-locked"), (false, None));

    // Free again after release
    let third = builder("svc-locked", &transport)
        .lock_guard(guard)
        .start()
        .await
        .unwrap();
    third.stop().await;
}

#[tokio::test]
async fn test_lock_disabled_by_default() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-nolock", &transport).start().await.unwrap();
    assert!(instance.lock_path().is_none());
    instance.stop().await;
}

#[tokio::test]
async fn test_info_snapshot() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-info", &transport).start().await.unwrap();

    let info = instance.info();
    assert_eq!(info.identity.name, "svc-info");
    assert_eq!(info.version, "0.9.0");
    assert_eq!(info.status, Status::Running);
    assert!(info.connected);
    assert!(info.commands.contains(&"query".to_string()));

    let value = serde_json::to_value(&info).unwrap();
    assert_eq!(value["name"], "svc-info");
    assert_eq!(value["status"], "running");

    instance.stop().await;
}

#[tokio::test]
async fn test_report_status_publishes_on_status_topic() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-report", &transport).start().await.unwrap();

    instance
        .report_status(serde_json::json!({"phase": "warming"}))
        .await
        .unwrap();

    let reports = transport.published_on("v1/subapp/pcs/svc-report/status");
    assert_eq!(reports.len(), 1);
    let body = reports[0].json().unwrap();
    assert_eq!(body["status"], "running");
    assert_eq!(body["details"]["phase"], "warming");

    instance.stop().await;
    assert!(instance.report_status(serde_json::json!({})).await.is_err());
}

#[tokio::test]
async fn test_send_log_publishes_on_log_topic() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-logline", &transport).start().await.unwrap();

    instance.send_log("warn", "disk almost full").await.unwrap();

    let lines = transport.published_on("v1/subapp/pcs/svc-logline/log");
    assert_eq!(lines.len(), 1);
    let body = lines[0].json().unwrap();
    assert_eq!(body["level"], "warn");
    assert_eq!(body["message"], "disk almost full");
    assert_eq!(body["source"], "svc-logline");

    instance.stop().await;
    assert!(instance.send_log("info", "gone").await.is_err());
}

#[tokio::test]
async fn test_transition_table_is_enforced() {
    let transport = Arc::new(MemoryTransport::new());
    let instance = builder("svc-transition", &transport).start().await.unwrap();

    assert!(!instance.transition(Status::Pending));
    assert_eq!(instance.status(), Status::Running);
    assert!(instance.transition(Status::Error));
    assert!(instance.transition(Status::Running));

    instance.stop().await;
    assert!(!instance.transition(Status::Running));
    assert_eq!(instance.status(), Status::Stopped);
}

/// Register "svc-a" with the lock, see the first heartbeat, query it, stop
/// it remotely and check the lock is gone after teardown.
#[tokio::test(start_paused = true)]
async fn test_end_to_end_svc_a() {
    let dir = tempfile::tempdir().unwrap();
    let guard = LockGuard::in_dir(dir.path());
    let transport = Arc::new(MemoryTransport::new());

    let instance = builder("svc-a", &transport)
        .lock_guard(guard.clone())
        .start()
        .await
        .unwrap();

    // Lock at the deterministic path
    let lock_path = dir.path().join("svc-a.lock");
    assert_eq!(guard.lock_path("svc-a"), lock_path);
    assert!(lock_path.exists());
    assert!(transport.is_connected());

    // First heartbeat within the initial delay plus a little
    let heartbeat_topic = instance.topics().heartbeat.clone();
    assert!(transport.published_on(&heartbeat_topic).is_empty());
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let heartbeats = transport.published_on(&heartbeat_topic);
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].json().unwrap()["app_name"], "svc-a");

    // Query over the control topic
    let control = instance.topics().control.clone();
    let mut results = instance.subscribe_results();
    transport
        .inject(&control, br#"{"command":"query","request_id":"r1"}"#.to_vec())
        .await;
    let result: CommandResult = tokio::time::timeout(Duration::from_secs(1), results.recv())
        .await
        .unwrap()
        .unwrap();
    let encoded = serde_json::to_string(&result).unwrap();
    assert!(encoded.contains(r#"request_id":"r1""#));
    assert!(result
        .message
        .contains(&format!("pid={}", std::process::id())));

    // Remote stop
    transport
        .inject(&control, br#"{"command":"stop"}"#.to_vec())
        .await;
    tokio::time::timeout(Duration::from_secs(1), instance.cancelled())
        .await
        .unwrap();
    assert_eq!(instance.status(), Status::Stopping);
    assert!(lock_path.exists());

    instance.stop().await;
    assert_eq!(instance.status(), Status::Stopped);
    assert!(!lock_path.exists());
}
