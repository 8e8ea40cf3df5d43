//! HTTP API демона podwatt.
//!
//! JSON endpoints для просмотра workloads и статистики коллектора
//! и `/metrics` в текстовом формате Prometheus.

mod prometheus;
mod server;

pub use prometheus::render_metrics;
pub use server::{ApiServer, ApiServerHandle, ApiState};
