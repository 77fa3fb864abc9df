// Shared fixtures for the HTTP integration tests. Everything runs in memory:
// MemoryStore plus the mock cloud adapter, metric source and command runner.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use nimbus_orchestrator::store::MemoryStore;
use nimbus_orchestrator::{routes, ControlPlane, Tuning};
use nimbus_providers::mock::{MockCloudAdapter, MockMetricSource, RecordingCommandRunner};
use serde_json::{json, Value};

pub struct TestApp {
    pub app: Router,
    pub cp: ControlPlane,
    pub cloud: Arc<MockCloudAdapter>,
    pub metrics: Arc<MockMetricSource>,
    pub commands: Arc<RecordingCommandRunner>,
}

pub fn create_test_app() -> TestApp {
    let cloud = Arc::new(MockCloudAdapter::new());
    let metrics = Arc::new(MockMetricSource::new());
    let commands = Arc::new(RecordingCommandRunner::new());
    let cp = ControlPlane::new(
        Arc::new(MemoryStore::new()),
        cloud.clone(),
        metrics.clone(),
        commands.clone(),
    )
    .with_tuning(Tuning {
        control_stagger: Duration::ZERO,
        status_retry_delay: Duration::ZERO,
        hold_poll: Duration::from_millis(10),
        ssh_user: "tester".to_string(),
    });
    TestApp {
        app: routes::router(cp.clone()),
        cp,
        cloud,
        metrics,
        commands,
    }
}

pub fn sub_group(name: &str, size: usize) -> Value {
    json!({
        "name": name,
        "subGroupSize": size,
        "connectionName": "aws-ap-northeast-2",
        "specId": "t3-small",
        "imageId": "ubuntu22"
    })
}

pub fn mci_request(name: &str, groups: &[(&str, usize)]) -> Value {
    json!({
        "name": name,
        "vm": groups.iter().map(|(g, n)| sub_group(g, *n)).collect::<Vec<_>>()
    })
}
