// Integration test: telemetry of a freshly launched fleet entry reaches the bus

use fleetwarden::adapter::ProcessAdapter;
use fleetwarden::bus::{EventBus, TelemetryKind};
use fleetwarden::config::{BusConfig, ProcessConfig};
use fleetwarden::process::LocalProcessManager;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_relay_started_first_keeps_launch_telemetry() {
    let manager = LocalProcessManager::new();
    let adapter: Arc<dyn ProcessAdapter> = Arc::new(manager.clone());
    let bus = EventBus::new(adapter.clone(), BusConfig::default());
    let relay = bus.start().unwrap();

    let mut config = ProcessConfig::new("greeter", "/bin/sh");
    config.args = vec!["-c".to_string(), "echo ready; exec sleep 30".to_string()];
    config.stop_timeout_secs = 1;
    adapter.start(&config).await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..50 {
        kinds = bus
            .backlog("greeter")
            .into_iter()
            .map(|event| event.kind)
            .collect::<Vec<_>>();
        if kinds.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(kinds.contains(&TelemetryKind::Status {
        status: "online".to_string()
    }));
    assert!(kinds.contains(&TelemetryKind::Log {
        data: "ready".to_string()
    }));

    relay.abort();
    manager.stop_all().await;
}
