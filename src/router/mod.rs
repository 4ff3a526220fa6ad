pub mod plugins;

use crate::error::{BalancerError, BalancerResult};
use crate::registry::BackendServer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// 路由器接口 - 所有路由算法必须实现此接口
pub trait Router: Send + Sync {
    /// 路由器名称
    fn name(&self) -> &str;

    /// 从可用后端中选择一个。
    /// `eligible` 非空，且已按地址排序。
    fn select_backend<'a>(&self, eligible: &[&'a BackendServer]) -> Option<&'a BackendServer>;
}

/// 路由算法，启动时确定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAlgorithm {
    Random,
    RoundRobin,
    LeastConnections,
}

impl RoutingAlgorithm {
    /// 创建对应的路由器实例
    pub fn build_router(self) -> Box<dyn Router> {
        use plugins::*;

        match self {
            RoutingAlgorithm::Random => Box::new(RandomRouter::new()),
            RoutingAlgorithm::RoundRobin => Box::new(RoundRobinRouter::new()),
            RoutingAlgorithm::LeastConnections => Box::new(LeastConnectionsRouter::new()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingAlgorithm::Random => "random",
            RoutingAlgorithm::RoundRobin => "round_robin",
            RoutingAlgorithm::LeastConnections => "least_connections",
        }
    }
}

impl fmt::Display for RoutingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingAlgorithm {
    type Err = String;

    /// 接受 `round_robin`、`round-robin`、`RoundRobin` 等写法
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match normalized.as_str() {
            "random" => Ok(RoutingAlgorithm::Random),
            "roundrobin" => Ok(RoutingAlgorithm::RoundRobin),
            "leastconnections" => Ok(RoutingAlgorithm::LeastConnections),
            _ => Err(format!(
                "unknown routing algorithm '{}' (expected random, round_robin or least_connections)",
                s
            )),
        }
    }
}

/// 后端选择器 - 在注册表快照上执行固定的路由算法
pub struct BackendSelector {
    algorithm: RoutingAlgorithm,
    router: Box<dyn Router>,
}

impl BackendSelector {
    pub fn new(algorithm: RoutingAlgorithm) -> Self {
        Self {
            algorithm,
            router: algorithm.build_router(),
        }
    }

    pub fn algorithm(&self) -> RoutingAlgorithm {
        self.algorithm
    }

    pub fn router_name(&self) -> &str {
        self.router.name()
    }

    /// 选择后端地址；没有可用后端时返回 `NoEligibleBackend`
    pub fn choose(&self, snapshot: &[BackendServer]) -> BalancerResult<String> {
        let eligible = eligible_backends(snapshot);
        if eligible.is_empty() {
            debug!("No eligible backend among {} registered", snapshot.len());
            return Err(BalancerError::NoEligibleBackend);
        }

        let selected = self
            .router
            .select_backend(&eligible)
            .ok_or(BalancerError::NoEligibleBackend)?;

        debug!(
            "{} selected backend '{}' ({} eligible)",
            self.router.name(),
            selected.address,
            eligible.len()
        );
        Ok(selected.address.clone())
    }
}

/// 过滤出已注册且存活的后端，按地址排序
pub fn eligible_backends(snapshot: &[BackendServer]) -> Vec<&BackendServer> {
    let mut eligible: Vec<&BackendServer> =
        snapshot.iter().filter(|b| b.is_eligible()).collect();
    eligible.sort_by(|a, b| a.address.cmp(&b.address));
    eligible
}

#[cfg(test)]
pub(crate) fn test_backend(address: &str, alive: bool, connections: u32) -> BackendServer {
    let mut backend = BackendServer::new(address.to_string(), alive);
    backend.active_connections = connections;
    backend
}
