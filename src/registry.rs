use crate::error::{BalancerError, BalancerResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 最近一次健康探测的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Alive,
    NotAlive,
    Failed(String),
}

impl ProbeResult {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeResult::Alive)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProbeResult::Alive => "alive",
            ProbeResult::NotAlive => "not_alive",
            ProbeResult::Failed(_) => "failed",
        }
    }
}

/// 已注册的后端服务器
#[derive(Debug, Clone)]
pub struct BackendServer {
    /// host:port，注册表中的唯一键
    pub address: String,
    pub registered: bool,
    pub alive: bool,
    pub active_connections: u32,
    pub registered_at: DateTime<Utc>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_probe_result: Option<ProbeResult>,
    /// 连续未报告存活的探测次数
    pub consecutive_failures: u32,
}

impl BackendServer {
    pub fn new(address: String, alive: bool) -> Self {
        Self {
            address,
            registered: true,
            alive,
            active_connections: 0,
            registered_at: Utc::now(),
            last_probe_at: None,
            last_probe_result: None,
            consecutive_failures: 0,
        }
    }

    /// 可参与路由：已注册且存活
    pub fn is_eligible(&self) -> bool {
        self.registered && self.alive
    }
}

/// 注册操作的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Updated,
}

/// 写回探测结果后的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeApplied {
    /// 仍在注册表中，附带连续失败次数
    Kept(u32),
    /// 连续失败达到上限，已在同一次加锁内移除
    Evicted(u32),
}

/// 后端注册表 - 所有读写都在同一把锁下完成，锁从不跨越网络 I/O
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, BackendServer>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// 幂等注册；重复注册刷新存活状态但保留连接计数
    pub async fn register(&self, address: &str, initial_alive: bool) -> Registration {
        let mut servers = self.servers.write().await;
        match servers.get_mut(address) {
            Some(server) => {
                server.registered = true;
                server.alive = initial_alive;
                // 重新注册开始新的失败计数
                server.consecutive_failures = 0;
                debug!(
                    "Backend '{}' re-registered (alive: {}, active connections: {})",
                    address, initial_alive, server.active_connections
                );
                Registration::Updated
            }
            None => {
                servers.insert(
                    address.to_string(),
                    BackendServer::new(address.to_string(), initial_alive),
                );
                info!("Backend '{}' registered (alive: {})", address, initial_alive);
                Registration::Created
            }
        }
    }

    pub async fn set_alive(&self, address: &str, alive: bool) -> BalancerResult<()> {
        let mut servers = self.servers.write().await;
        let server = Self::entry(&mut servers, address)?;
        if server.alive != alive {
            info!(
                "Backend '{}' marked as {}",
                address,
                if alive { "alive" } else { "unavailable" }
            );
        }
        server.alive = alive;
        Ok(())
    }

    /// 记录一次探测结果；配置了 `evict_after` 且连续失败达到上限时直接移除，
    /// 与更新在同一次写锁内完成
    pub async fn record_probe(
        &self,
        address: &str,
        result: ProbeResult,
        evict_after: Option<u32>,
    ) -> BalancerResult<ProbeApplied> {
        let mut servers = self.servers.write().await;
        let server = Self::entry(&mut servers, address)?;

        let alive = result.is_alive();
        if server.alive != alive {
            info!(
                "Backend '{}' marked as {} by health probe",
                address,
                if alive { "alive" } else { "unavailable" }
            );
        }

        server.alive = alive;
        server.consecutive_failures = if alive {
            0
        } else {
            server.consecutive_failures.saturating_add(1)
        };
        server.last_probe_at = Some(Utc::now());
        server.last_probe_result = Some(result);
        let failures = server.consecutive_failures;

        match evict_after {
            Some(limit) if failures >= limit => {
                servers.remove(address);
                warn!(
                    "Backend '{}' evicted after {} consecutive failed probes",
                    address, failures
                );
                Ok(ProbeApplied::Evicted(failures))
            }
            _ => Ok(ProbeApplied::Kept(failures)),
        }
    }

    /// 增加活跃连接数，返回新值
    pub async fn increment_load(&self, address: &str) -> BalancerResult<u32> {
        let mut servers = self.servers.write().await;
        let server = Self::entry(&mut servers, address)?;
        server.active_connections = server.active_connections.saturating_add(1);
        Ok(server.active_connections)
    }

    /// 减少活跃连接数，返回新值；计数不会小于零
    pub async fn decrement_load(&self, address: &str) -> BalancerResult<u32> {
        let mut servers = self.servers.write().await;
        let server = Self::entry(&mut servers, address)?;
        if server.active_connections == 0 {
            warn!("Load counter for backend '{}' already at zero", address);
        } else {
            server.active_connections -= 1;
        }
        Ok(server.active_connections)
    }

    /// 直接移除后端；健康检查的剔除在 `record_probe` 内完成
    pub async fn evict(&self, address: &str) -> bool {
        let removed = self.servers.write().await.remove(address).is_some();
        if removed {
            warn!("Backend '{}' evicted from registry", address);
        }
        removed
    }

    /// 时间点一致的副本，按地址排序
    pub async fn snapshot(&self) -> Vec<BackendServer> {
        let mut snapshot: Vec<BackendServer> =
            self.servers.read().await.values().cloned().collect();
        snapshot.sort_by(|a, b| a.address.cmp(&b.address));
        snapshot
    }

    pub async fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.servers.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn get(&self, address: &str) -> Option<BackendServer> {
        self.servers.read().await.get(address).cloned()
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    fn entry<'a>(
        servers: &'a mut HashMap<String, BackendServer>,
        address: &str,
    ) -> BalancerResult<&'a mut BackendServer> {
        servers.get_mut(address).ok_or_else(|| {
            warn!("Ignoring update for unregistered backend '{}'", address);
            BalancerError::NotRegistered(address.to_string())
        })
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
