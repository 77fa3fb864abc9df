// Integration tests for MCI, VM and control endpoints.

mod common;

use axum_test::TestServer;
use common::{create_test_app, mci_request, sub_group};
use serde_json::{json, Value};

#[tokio::test]
async fn test_liveness() {
    let t = create_test_app();
    let server = TestServer::new(t.app).unwrap();

    let response = server.get("/").await;
    assert_eq!(response.status_code(), 200);

    let response = server.get("/admin/status").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["store"], "ok");
}

#[tokio::test]
async fn test_mci_lifecycle() {
    let t = create_test_app();
    let server = TestServer::new(t.app).unwrap();

    let response = server
        .post("/ns/default/mci")
        .json(&mci_request("m1", &[("web", 2), ("db", 1)]))
        .await;
    assert_eq!(response.status_code(), 201);
    let body: Value = response.json();
    assert_eq!(body["id"], "m1");
    assert_eq!(body["targetAction"], "Complete");

    let response = server.get("/ns/default/mci/m1/status").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "Running:3 (R:3/3)");
    assert_eq!(body["vm"].as_array().unwrap().len(), 3);
    assert!(!body["masterIp"].as_str().unwrap().is_empty());

    let response = server
        .get("/ns/default/control/mci/m1?action=suspend")
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["message"], "Suspending the MCI 'm1'");

    let body: Value = server.get("/ns/default/mci/m1/status").await.json();
    assert_eq!(body["status"], "Suspended:3 (R:0/3)");

    // Deleting a live MCI needs terminate (or force) first.
    let response = server.delete("/ns/default/mci/m1").await;
    assert_eq!(response.status_code(), 409);

    let response = server
        .get("/ns/default/control/mci/m1?action=terminate")
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = server.get("/ns/default/mci/m1/status").await.json();
    assert_eq!(body["status"], "Terminated:3 (R:0/3)");

    let response = server.delete("/ns/default/mci/m1").await;
    assert_eq!(response.status_code(), 200);
    let response = server.get("/ns/default/mci/m1").await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_duplicate_and_invalid_requests() {
    let t = create_test_app();
    let server = TestServer::new(t.app).unwrap();

    let response = server
        .post("/ns/default/mci")
        .json(&mci_request("m1", &[("web", 1)]))
        .await;
    assert_eq!(response.status_code(), 201);

    let response = server
        .post("/ns/default/mci")
        .json(&mci_request("m1", &[("web", 1)]))
        .await;
    assert_eq!(response.status_code(), 409);
    let body: Value = response.json();
    assert_eq!(body["error"], "already_exists");

    let response = server
        .post("/ns/default/mci")
        .json(&json!({ "name": "m2", "vm": [] }))
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .get("/ns/default/control/mci/m1?action=explode")
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .get("/ns/default/control/mci/ghost?action=suspend")
        .await;
    assert_eq!(response.status_code(), 404);

    // Resume on a running MCI is a no-op transition.
    let response = server
        .get("/ns/default/control/mci/m1?action=resume")
        .await;
    assert_eq!(response.status_code(), 409);
    let body: Value = response.json();
    assert_eq!(body["error"], "transition_denied");
}

#[tokio::test]
async fn test_partial_failure_reports_failing_vms() {
    let t = create_test_app();
    let server = TestServer::new(t.app).unwrap();

    server
        .post("/ns/default/mci")
        .json(&mci_request("m1", &[("web", 3)]))
        .await;

    let mci: Value = server.get("/ns/default/mci/m1").await.json();
    let csp_of_web_2 = mci["vm"]
        .as_array()
        .unwrap()
        .iter()
        .find(|vm| vm["id"] == "web-2")
        .and_then(|vm| vm["cspId"].as_str())
        .unwrap()
        .to_string();
    t.cloud.fail_control(&csp_of_web_2, "quota exceeded");

    let response = server
        .get("/ns/default/control/mci/m1?action=suspend")
        .await;
    assert_eq!(response.status_code(), 500);
    let body: Value = response.json();
    assert_eq!(body["error"], "partial_failure");
    assert_eq!(body["message"], "[web-2: quota exceeded]");
    assert_eq!(body["failures"][0]["id"], "web-2");

    // The failed VM is still running on the provider; the next poll says so.
    let body: Value = server.get("/ns/default/mci/m1/status").await.json();
    assert_eq!(body["status"], "Partial-Suspended:2 (R:1/3)");
    let web_2 = body["vm"]
        .as_array()
        .unwrap()
        .iter()
        .find(|vm| vm["id"] == "web-2")
        .unwrap()
        .clone();
    assert_eq!(web_2["systemMessage"], "quota exceeded");
}

#[tokio::test]
async fn test_vm_endpoints() {
    let t = create_test_app();
    let server = TestServer::new(t.app).unwrap();

    server
        .post("/ns/default/mci")
        .json(&mci_request("m1", &[("web", 2)]))
        .await;

    let response = server
        .post("/ns/default/mci/m1/vm")
        .json(&sub_group("db", 1))
        .await;
    assert_eq!(response.status_code(), 201);
    let body: Value = response.json();
    assert_eq!(body["vmIds"], json!(["db-1"]));

    let body: Value = server
        .get("/ns/default/mci/m1/vm?field=subGroupId&value=web")
        .await
        .json();
    assert_eq!(body["vmIds"], json!(["web-1", "web-2"]));

    let response = server
        .get("/ns/default/mci/m1/vm?field=color&value=red")
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server.get("/ns/default/mci/m1/vm/db-1/status").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["status"], "Running");

    let response = server
        .put("/ns/default/mci/m1/bastion/web-1")
        .json(&json!({ "targetVmIds": ["web-2", "db-1"] }))
        .await;
    assert_eq!(response.status_code(), 200);

    let response = server
        .get("/ns/default/control/mci/m1/vm/db-1?action=terminate")
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["message"], "Terminating the VM 'db-1'");

    let response = server.delete("/ns/default/mci/m1/vm/db-1").await;
    assert_eq!(response.status_code(), 200);

    let body: Value = server.get("/ns/default/mci/m1/bastion").await.json();
    assert_eq!(body["bastion"][0]["targetVmIds"], json!(["web-2"]));

    let body: Value = server.get("/ns/default/mci/m1/vm").await.json();
    assert_eq!(body["vmIds"], json!(["web-1", "web-2"]));

    // A running VM is only removed with force.
    let response = server.delete("/ns/default/mci/m1/vm/web-2").await;
    assert_eq!(response.status_code(), 409);
    let response = server.delete("/ns/default/mci/m1/vm/web-2?force=true").await;
    assert_eq!(response.status_code(), 200);
}
