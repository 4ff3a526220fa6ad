use super::super::Router;
use crate::registry::BackendServer;
use tracing::debug;

/// 最少连接路由器 - 选择当前连接数最少的后端服务器，连接数相同时取地址最小者
pub struct LeastConnectionsRouter {
    name: String,
}

impl LeastConnectionsRouter {
    pub fn new() -> Self {
        Self {
            name: "least_connections".to_string(),
        }
    }
}

impl Router for LeastConnectionsRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_backend<'a>(&self, eligible: &[&'a BackendServer]) -> Option<&'a BackendServer> {
        let selected = eligible.iter().copied().min_by(|a, b| {
            a.active_connections
                .cmp(&b.active_connections)
                .then_with(|| a.address.cmp(&b.address))
        })?;

        debug!(
            "LeastConnectionsRouter selected backend: {} (connections: {})",
            selected.address, selected.active_connections
        );
        Some(selected)
    }
}

impl Default for LeastConnectionsRouter {
    fn default() -> Self {
        Self::new()
    }
}
