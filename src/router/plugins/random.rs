use super::super::Router;
use crate::registry::BackendServer;
use rand::Rng;
use tracing::debug;

/// 随机路由器 - 在可用后端中均匀随机选择
pub struct RandomRouter {
    name: String,
}

impl RandomRouter {
    pub fn new() -> Self {
        Self {
            name: "random".to_string(),
        }
    }
}

impl Router for RandomRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_backend<'a>(&self, eligible: &[&'a BackendServer]) -> Option<&'a BackendServer> {
        if eligible.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..eligible.len());
        let selected = eligible[index];

        debug!(
            "RandomRouter selected backend: {} (index: {})",
            selected.address, index
        );
        Some(selected)
    }
}

impl Default for RandomRouter {
    fn default() -> Self {
        Self::new()
    }
}
