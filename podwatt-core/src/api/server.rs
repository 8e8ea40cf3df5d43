//! HTTP сервер для API экспорта энергии.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info};

use super::prometheus::render_metrics;
use crate::store::SharedState;
use crate::CollectorStats;

/// Состояние API сервера.
#[derive(Clone)]
pub struct ApiState {
    /// Состояние коллектора (workloads, последний цикл)
    collector: SharedState,
    /// Статистика коллектора (опционально)
    stats: Option<Arc<RwLock<CollectorStats>>>,
}

impl ApiState {
    pub fn new(collector: SharedState) -> Self {
        Self {
            collector,
            stats: None,
        }
    }

    pub fn with_stats(collector: SharedState, stats: Arc<RwLock<CollectorStats>>) -> Self {
        Self {
            collector,
            stats: Some(stats),
        }
    }
}

/// Обработчик для endpoint `/health`.
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "podwatt-api"
    }))
}

/// Создаёт роутер для API.
pub(crate) fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/workloads", get(workloads_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Обработчик для endpoint `/api/stats`.
///
/// Возвращает статистику коллектора (если доступна).
async fn stats_handler(State(state): State<ApiState>) -> Result<Json<Value>, StatusCode> {
    match &state.stats {
        Some(stats_arc) => {
            let stats = stats_arc.read().await.clone();
            Ok(Json(json!({
                "status": "ok",
                "collector_stats": stats
            })))
        }
        None => Ok(Json(json!({
            "status": "ok",
            "collector_stats": null,
            "message": "Collector stats not available (collector may not be running)"
        }))),
    }
}

/// Обработчик для endpoint `/api/workloads`.
///
/// Возвращает записи workloads и последний срез устройства.
async fn workloads_handler(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.collector.read().await.snapshot();
    Json(json!({
        "status": "ok",
        "count": snapshot.workloads.len(),
        "snapshot": snapshot
    }))
}

/// Обработчик для endpoint `/metrics` (формат Prometheus).
async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.collector.read().await.snapshot();
    let stats = match &state.stats {
        Some(stats_arc) => Some(stats_arc.read().await.clone()),
        None => None,
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(&snapshot, stats.as_ref()),
    )
}

/// HTTP API сервер.
///
/// Запускается в отдельной задаче и останавливается через handle.
///
/// ```no_run
/// use podwatt_core::api::ApiServer;
/// use podwatt_core::store::new_shared_state;
///
/// # async fn example() -> anyhow::Result<()> {
/// let server = ApiServer::new("127.0.0.1:9102".parse()?, new_shared_state());
/// let handle = server.start().await?;
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ApiServer {
    /// Адрес для прослушивания
    addr: SocketAddr,
    state: ApiState,
}

impl ApiServer {
    pub fn new(addr: SocketAddr, collector: SharedState) -> Self {
        Self {
            addr,
            state: ApiState::new(collector),
        }
    }

    pub fn with_stats(
        addr: SocketAddr,
        collector: SharedState,
        stats: Arc<RwLock<CollectorStats>>,
    ) -> Self {
        Self {
            addr,
            state: ApiState::with_stats(collector, stats),
        }
    }

    /// Запускает API сервер в фоновой задаче.
    ///
    /// # Ошибки
    ///
    /// Возвращает ошибку, если не удалось занять адрес.
    pub async fn start(self) -> Result<ApiServerHandle> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("Failed to bind API server to {}", self.addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to get API server address")?;

        info!("API server listening on http://{}", local_addr);

        let router = create_router(self.state);
        let server = axum::serve(listener, router);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = ApiServerHandle {
            shutdown_tx: Some(shutdown_tx),
            local_addr,
        };

        tokio::spawn(async move {
            let graceful = server.with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            });

            if let Err(e) = graceful.await {
                error!("API server error: {}", e);
            } else {
                info!("API server stopped");
            }
        });

        Ok(handle)
    }
}

/// Handle для управления API сервером.
pub struct ApiServerHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    local_addr: SocketAddr,
}

impl ApiServerHandle {
    /// Фактический адрес сервера (полезно при порте 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Останавливает API сервер.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            tx.send(()).map_err(|_| {
                anyhow::anyhow!("Failed to send shutdown signal to API server (receiver dropped)")
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{new_shared_state, WorkloadIdentity};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_body(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_reports_service() {
        let router = create_router(ApiState::new(new_shared_state()));
        let (status, body) = get_body(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["service"], "podwatt-api");
    }

    #[tokio::test]
    async fn stats_without_collector_is_null() {
        let router = create_router(ApiState::new(new_shared_state()));
        let (_, body) = get_body(router, "/api/stats").await;
        let value: Value = serde_json::from_str(&body).unwrap();
        assert!(value["collector_stats"].is_null());
    }

    #[tokio::test]
    async fn workloads_lists_records() {
        let state = new_shared_state();
        {
            let mut guard = state.write().await;
            guard.workload_entry("nginx.service", || WorkloadIdentity {
                name: "nginx.service".to_string(),
                namespace: "system".to_string(),
                ..Default::default()
            });
        }
        let router = create_router(ApiState::new(state));
        let (status, body) = get_body(router, "/api/workloads").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["count"], 1);
        assert_eq!(
            value["snapshot"]["workloads"][0]["identity"]["name"],
            "nginx.service"
        );
    }

    #[tokio::test]
    async fn metrics_are_plain_text() {
        let stats = Arc::new(RwLock::new(CollectorStats::new()));
        let router = create_router(ApiState::with_stats(new_shared_state(), stats));
        let (status, body) = get_body(router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE podwatt_collector_cycle counter"));
        assert!(body.contains("podwatt_collector_cycles_total{outcome=\"attributed\"} 0"));
    }
}
