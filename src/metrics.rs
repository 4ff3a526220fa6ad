use crate::shutdown::ShutdownSignal;
use anyhow::{Context, Result};
use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use warp::Filter;
use warp::http::StatusCode;

/// 监控指标收集器
pub struct MetricsCollector {
    registry: Registry,

    // 连接指标
    pub active_connections: IntGauge,
    pub total_connections: IntCounter,

    // 请求指标
    pub requests_total: IntCounterVec,
    pub registrations_total: IntCounterVec,

    // 后端指标
    pub backend_connections: IntGaugeVec,
    pub backend_health: IntGaugeVec,
    pub probes_total: IntCounterVec,

    // 路由器指标
    pub router_selections: IntCounterVec,

    // 错误指标
    pub errors_total: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let active_connections = IntGauge::new(
            "balancer_active_connections",
            "Number of client connections being handled",
        )?;
        registry.register(Box::new(active_connections.clone()))?;

        let total_connections = IntCounter::new(
            "balancer_connections_total",
            "Total number of accepted connections",
        )?;
        registry.register(Box::new(total_connections.clone()))?;

        let requests_total = IntCounterVec::new(
            Opts::new("balancer_requests_total", "Handled requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let registrations_total = IntCounterVec::new(
            Opts::new(
                "balancer_registrations_total",
                "Backend registrations by kind (created, updated)",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(registrations_total.clone()))?;

        let backend_connections = IntGaugeVec::new(
            Opts::new(
                "balancer_backend_connections",
                "Requests currently assigned to backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_connections.clone()))?;

        let backend_health = IntGaugeVec::new(
            Opts::new(
                "balancer_backend_health",
                "Backend health status (1 = alive, 0 = unavailable)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health.clone()))?;

        let probes_total = IntCounterVec::new(
            Opts::new("balancer_probes_total", "Heartbeat probes by result"),
            &["backend", "result"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let router_selections = IntCounterVec::new(
            Opts::new("balancer_router_selections_total", "Total router selections"),
            &["router", "backend"],
        )?;
        registry.register(Box::new(router_selections.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("balancer_errors_total", "Total errors"),
            &["type", "component"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            total_connections,
            requests_total,
            registrations_total,
            backend_connections,
            backend_health,
            probes_total,
            router_selections,
            errors_total,
        })
    }

    /// 获取Prometheus注册表
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_new_connection(&self) {
        self.active_connections.inc();
        self.total_connections.inc();
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.dec();
    }

    pub fn record_request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_registration(&self, kind: &str) {
        self.registrations_total.with_label_values(&[kind]).inc();
    }

    pub fn update_backend_connections(&self, backend: &str, connections: u32) {
        self.backend_connections
            .with_label_values(&[backend])
            .set(i64::from(connections));
    }

    pub fn update_backend_health(&self, backend: &str, alive: bool) {
        self.backend_health
            .with_label_values(&[backend])
            .set(if alive { 1 } else { 0 });
    }

    pub fn record_probe(&self, backend: &str, result: &str) {
        self.probes_total.with_label_values(&[backend, result]).inc();
    }

    pub fn record_router_selection(&self, router: &str, backend: &str) {
        self.router_selections
            .with_label_values(&[router, backend])
            .inc();
    }

    pub fn record_error(&self, error_type: &str, component: &str) {
        self.errors_total
            .with_label_values(&[error_type, component])
            .inc();
    }

    /// 剔除后端后清理其标签
    pub fn forget_backend(&self, backend: &str) {
        let _ = self.backend_health.remove_label_values(&[backend]);
        let _ = self.backend_connections.remove_label_values(&[backend]);
    }

    /// 导出指标为Prometheus格式
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))
    }
}

/// 在 `bind` 上以 `GET /metrics` 暴露指标，收到关机信号后停止
pub fn serve_metrics(
    collector: Arc<MetricsCollector>,
    bind: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || match collector.export_metrics() {
            Ok(body) => warp::reply::with_status(body, StatusCode::OK),
            Err(e) => warp::reply::with_status(e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
        });

    let (addr, server) = warp::serve(route)
        .try_bind_with_graceful_shutdown(bind, async move {
            let _ = shutdown_rx.recv().await;
        })
        .with_context(|| format!("Failed to bind metrics endpoint to {}", bind))?;

    info!("Metrics endpoint listening on http://{}/metrics", addr);
    Ok((addr, tokio::spawn(server)))
}
