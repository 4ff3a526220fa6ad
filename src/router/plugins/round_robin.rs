use super::super::Router;
use crate::registry::BackendServer;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// 轮询路由器 - 按地址顺序轮流选择后端服务器
pub struct RoundRobinRouter {
    name: String,
    counter: AtomicUsize,
}

impl RoundRobinRouter {
    pub fn new() -> Self {
        Self {
            name: "round_robin".to_string(),
            counter: AtomicUsize::new(0),
        }
    }
}

impl Router for RoundRobinRouter {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_backend<'a>(&self, eligible: &[&'a BackendServer]) -> Option<&'a BackendServer> {
        if eligible.is_empty() {
            return None;
        }

        // 可用集合变化时取模即可把游标收回范围内
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        let selected = eligible[index];

        debug!(
            "RoundRobinRouter selected backend: {} (index: {})",
            selected.address, index
        );
        Some(selected)
    }
}

impl Default for RoundRobinRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::test_backend;
    use std::collections::HashMap;

    #[test]
    fn test_round_robin_selection() {
        let router = RoundRobinRouter::new();
        let backends = vec![
            test_backend("127.0.0.1:8001", true, 0),
            test_backend("127.0.0.1:8002", true, 0),
            test_backend("127.0.0.1:8003", true, 0),
        ];
        let eligible: Vec<&BackendServer> = backends.iter().collect();

        let picks: Vec<&str> = (0..4)
            .map(|_| router.select_backend(&eligible).unwrap().address.as_str())
            .collect();

        assert_eq!(
            picks,
            vec![
                "127.0.0.1:8001",
                "127.0.0.1:8002",
                "127.0.0.1:8003",
                "127.0.0.1:8001" // 应该回到第一个
            ]
        );
    }

    #[test]
    fn test_each_member_chosen_once_per_cycle() {
        let router = RoundRobinRouter::new();
        let backends: Vec<BackendServer> = (0..5)
            .map(|i| test_backend(&format!("10.0.0.{}:80", i), true, 0))
            .collect();
        let eligible: Vec<&BackendServer> = backends.iter().collect();

        let rounds = 7;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..rounds * eligible.len() {
            let selected = router.select_backend(&eligible).unwrap();
            *counts.entry(selected.address.clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), eligible.len());
        assert!(counts.values().all(|count| *count == rounds));
    }

    #[test]
    fn test_cursor_clamps_when_set_shrinks() {
        let router = RoundRobinRouter::new();
        let backends = vec![
            test_backend("127.0.0.1:8001", true, 0),
            test_backend("127.0.0.1:8002", true, 0),
            test_backend("127.0.0.1:8003", true, 0),
        ];
        let all: Vec<&BackendServer> = backends.iter().collect();
        for _ in 0..2 {
            router.select_backend(&all).unwrap();
        }

        let shrunk = vec![&backends[0]];
        assert_eq!(
            router.select_backend(&shrunk).unwrap().address,
            "127.0.0.1:8001"
        );
    }

    #[test]
    fn test_empty_backends() {
        let router = RoundRobinRouter::new();
        assert!(router.select_backend(&[]).is_none());
    }
}
