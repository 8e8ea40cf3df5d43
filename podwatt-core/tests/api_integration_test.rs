// Интеграционные тесты для API сервера
//
// Сервер запускается на случайном порту, запросы идут через reqwest.

use podwatt_core::api::ApiServer;
use podwatt_core::collector::SkipReason;
use podwatt_core::store::{new_shared_state, SharedState, WorkloadIdentity};
use podwatt_core::CollectorStats;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

async fn seeded_state() -> SharedState {
    let state = new_shared_state();
    {
        let mut guard = state.write().await;
        guard.cycle = 4;
        let record = guard.workload_entry("web", || WorkloadIdentity {
            cgroup_id: 42,
            pid: 1001,
            command: "nginx".to_string(),
            namespace: "shop".to_string(),
            name: "web".to_string(),
        });
        record.current.core_energy_mj = 1_500;
        record.aggregate.core_energy_mj = 12_000;
        record.aggregate.cpu_time = 250.0;
    }
    state
}

#[tokio::test]
async fn test_api_server_start_and_shutdown() {
    let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), new_shared_state());
    let handle = server.start().await.expect("server should start");
    assert_ne!(handle.local_addr().port(), 0);
    assert!(handle.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), new_shared_state());
    let handle = server.start().await.unwrap();
    let url = format!("http://{}/health", handle.local_addr());

    let response = Client::new().get(&url).send().await.unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "podwatt-api");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_workloads_endpoint_returns_snapshot() {
    let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), seeded_state().await);
    let handle = server.start().await.unwrap();
    let url = format!("http://{}/api/workloads", handle.local_addr());

    let body: Value = Client::new()
        .get(&url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["snapshot"]["cycle"], 4);
    let web = &body["snapshot"]["workloads"][0];
    assert_eq!(web["identity"]["namespace"], "shop");
    assert_eq!(web["aggregate"]["core_energy_mj"], 12_000);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stats_endpoint_with_and_without_stats() {
    let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), new_shared_state());
    let handle = server.start().await.unwrap();
    let body: Value = Client::new()
        .get(format!("http://{}/api/stats", handle.local_addr()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["collector_stats"].is_null());
    handle.shutdown().await.unwrap();

    let mut stats = CollectorStats::new();
    stats.record_attributed_cycle(12, 3);
    stats.record_skipped_cycle(SkipReason::WarmUp);
    let stats = Arc::new(RwLock::new(stats));
    let server = ApiServer::with_stats("127.0.0.1:0".parse().unwrap(), new_shared_state(), stats);
    let handle = server.start().await.unwrap();
    let body: Value = Client::new()
        .get(format!("http://{}/api/stats", handle.local_addr()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["collector_stats"]["total_cycles"], 2);
    assert_eq!(body["collector_stats"]["skip_reasons"]["warm_up"], 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_metrics_endpoint_in_prometheus_format() {
    let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), seeded_state().await);
    let handle = server.start().await.unwrap();

    let response = Client::new()
        .get(format!("http://{}/metrics", handle.local_addr()))
        .send()
        .await
        .unwrap();
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));

    let text = response.text().await.unwrap();
    assert!(text.contains("# TYPE podwatt_workload_core_joules_total counter"));
    assert!(text.contains("workload=\"web\""));
    assert!(text.contains("podwatt_collector_cycle 4"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let server = ApiServer::new("127.0.0.1:0".parse().unwrap(), new_shared_state());
    let handle = server.start().await.unwrap();

    let response = Client::new()
        .get(format!("http://{}/api/nope", handle.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    handle.shutdown().await.unwrap();
}
