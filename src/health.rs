use crate::config::HealthCheckConfig;
use crate::error::{BalancerError, BalancerResult};
use crate::metrics::MetricsCollector;
use crate::protocol::{self, HeartbeatRequest, HeartbeatResponse};
use crate::registry::{ProbeApplied, ProbeResult, ServerRegistry};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

/// 健康探测接口 - 对单个后端执行一次心跳交换
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeResult;
}

/// 基于 TCP 帧协议的心跳探测
pub struct TcpHeartbeatProbe {
    timeout: Duration,
    max_frame_size: usize,
}

impl TcpHeartbeatProbe {
    pub fn new(timeout: Duration, max_frame_size: usize) -> Self {
        Self {
            timeout,
            max_frame_size,
        }
    }

    async fn exchange(&self, address: &str) -> BalancerResult<bool> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|e| BalancerError::probe_failure(address, format!("connect failed: {}", e)))?;

        protocol::send_message(&mut stream, &HeartbeatRequest::new(address)).await?;
        let response: HeartbeatResponse =
            protocol::recv_message(&mut stream, self.max_frame_size).await?;

        if response.status_code != 200 {
            return Err(BalancerError::probe_failure(
                address,
                format!("unexpected status code {}", response.status_code),
            ));
        }

        Ok(response.data.alive)
    }
}

#[async_trait]
impl HealthProbe for TcpHeartbeatProbe {
    async fn probe(&self, address: &str) -> ProbeResult {
        let start_time = Instant::now();

        match timeout(self.timeout, self.exchange(address)).await {
            Ok(Ok(true)) => {
                debug!(
                    "Heartbeat from {} succeeded in {:?}",
                    address,
                    start_time.elapsed()
                );
                ProbeResult::Alive
            }
            Ok(Ok(false)) => ProbeResult::NotAlive,
            Ok(Err(e)) => ProbeResult::Failed(e.to_string()),
            Err(_) => ProbeResult::Failed(format!("timed out after {:?}", self.timeout)),
        }
    }
}

/// 单轮检查的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub alive: usize,
    pub unavailable: usize,
    pub evicted: usize,
}

/// 健康监视器 - 周期性探测所有已注册后端并更新存活状态
pub struct HealthMonitor {
    config: HealthCheckConfig,
    registry: Arc<ServerRegistry>,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<MetricsCollector>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<ServerRegistry>,
        probe: Arc<dyn HealthProbe>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            registry,
            probe,
            metrics,
        }
    }

    /// 启动检查循环，收到关机信号后退出
    pub fn start(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    ) -> JoinHandle<()> {
        info!(
            "Starting health monitor with interval: {:?}, probe timeout: {:?}",
            self.config.interval(),
            self.config.timeout()
        );

        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_cycle().await;
                        debug!("Health check cycle finished: {:?}", report);
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            info!("Health monitor stopped");
        })
    }

    /// 执行一轮探测；各后端并发探测，互不阻塞
    pub async fn run_cycle(&self) -> CycleReport {
        let addresses = self.registry.addresses().await;
        let mut report = CycleReport {
            probed: addresses.len(),
            ..Default::default()
        };

        let mut check_tasks = Vec::with_capacity(addresses.len());
        for address in addresses {
            let probe = self.probe.clone();
            check_tasks.push(tokio::spawn(async move {
                let result = probe.probe(&address).await;
                (address, result)
            }));
        }

        for task in check_tasks {
            let (address, result) = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Health check task failed: {}", e);
                    continue;
                }
            };

            if self.apply_result(&address, result).await {
                report.evicted += 1;
            }
        }

        for server in self.registry.snapshot().await {
            if server.alive {
                report.alive += 1;
            } else {
                report.unavailable += 1;
            }
        }

        report
    }

    /// 写回探测结果，返回该后端是否被剔除
    async fn apply_result(&self, address: &str, result: ProbeResult) -> bool {
        self.metrics.record_probe(address, result.label());

        match &result {
            ProbeResult::Alive => debug!("{} is alive", address),
            ProbeResult::NotAlive => info!("{} reported not alive", address),
            ProbeResult::Failed(reason) => {
                let failure = BalancerError::probe_failure(address, reason);
                warn!("{}", failure);
                self.metrics.record_error(failure.kind(), "health");
            }
        }

        let alive = result.is_alive();
        match self
            .registry
            .record_probe(address, result, self.config.evict_after_failures)
            .await
        {
            Ok(ProbeApplied::Kept(_)) => {
                self.metrics.update_backend_health(address, alive);
                false
            }
            Ok(ProbeApplied::Evicted(_)) => {
                self.metrics.forget_backend(address);
                true
            }
            // 探测期间被剔除
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
    use std::collections::HashMap;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// 按地址返回预设结果的探测
    struct ScriptedProbe {
        results: Mutex<HashMap<String, ProbeResult>>,
    }

    impl ScriptedProbe {
        fn new() -> Self {
            Self {
                results: Mutex::new(HashMap::new()),
            }
        }

        async fn set(&self, address: &str, result: ProbeResult) {
            self.results.lock().await.insert(address.to_string(), result);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, address: &str) -> ProbeResult {
            self.results
                .lock()
                .await
                .get(address)
                .cloned()
                .unwrap_or_else(|| ProbeResult::Failed("no script".to_string()))
        }
    }

    fn monitor(
        config: HealthCheckConfig,
        registry: Arc<ServerRegistry>,
        probe: Arc<dyn HealthProbe>,
    ) -> HealthMonitor {
        HealthMonitor::new(
            config,
            registry,
            probe,
            Arc::new(MetricsCollector::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_cycle_updates_liveness() {
        let registry = Arc::new(ServerRegistry::new());
        registry.register("127.0.0.1:9001", false).await;
        registry.register("127.0.0.1:9002", true).await;
        registry.register("127.0.0.1:9003", true).await;

        let probe = Arc::new(ScriptedProbe::new());
        probe.set("127.0.0.1:9001", ProbeResult::Alive).await;
        probe.set("127.0.0.1:9002", ProbeResult::NotAlive).await;
        probe
            .set("127.0.0.1:9003", ProbeResult::Failed("refused".into()))
            .await;

        let monitor = monitor(HealthCheckConfig::default(), registry.clone(), probe);
        let report = monitor.run_cycle().await;

        assert_eq!(
            report,
            CycleReport {
                probed: 3,
                alive: 1,
                unavailable: 2,
                evicted: 0
            }
        );
        assert!(registry.get("127.0.0.1:9001").await.unwrap().alive);
        assert!(!registry.get("127.0.0.1:9002").await.unwrap().alive);
        // 失败只标记不可用，不会移除
        let failed = registry.get("127.0.0.1:9003").await.unwrap();
        assert!(!failed.alive);
        assert!(matches!(failed.last_probe_result, Some(ProbeResult::Failed(_))));
    }

    #[tokio::test]
    async fn test_backend_recovers_after_positive_probe() {
        let registry = Arc::new(ServerRegistry::new());
        registry.register("127.0.0.1:9001", true).await;

        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor(HealthCheckConfig::default(), registry.clone(), probe.clone());

        probe
            .set("127.0.0.1:9001", ProbeResult::Failed("timeout".into()))
            .await;
        monitor.run_cycle().await;
        assert!(!registry.get("127.0.0.1:9001").await.unwrap().alive);

        probe.set("127.0.0.1:9001", ProbeResult::Alive).await;
        monitor.run_cycle().await;
        assert!(registry.get("127.0.0.1:9001").await.unwrap().alive);
    }

    #[tokio::test]
    async fn test_eviction_after_repeated_failures() {
        let registry = Arc::new(ServerRegistry::new());
        registry.register("127.0.0.1:9001", true).await;

        let config = HealthCheckConfig {
            evict_after_failures: Some(2),
            ..Default::default()
        };
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor(config, registry.clone(), probe);

        assert_eq!(monitor.run_cycle().await.evicted, 0);
        assert_eq!(monitor.run_cycle().await.evicted, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reregistration_postpones_eviction() {
        let registry = Arc::new(ServerRegistry::new());
        registry.register("127.0.0.1:9001", true).await;

        let config = HealthCheckConfig {
            evict_after_failures: Some(3),
            ..Default::default()
        };
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = monitor(config, registry.clone(), probe);

        assert_eq!(monitor.run_cycle().await.evicted, 0);
        assert_eq!(monitor.run_cycle().await.evicted, 0);

        // 后端在第 N 次失败前重新注册，失败计数重新开始
        registry.register("127.0.0.1:9001", true).await;
        assert_eq!(monitor.run_cycle().await.evicted, 0);

        let server = registry.get("127.0.0.1:9001").await.unwrap();
        assert_eq!(server.consecutive_failures, 1);
        assert!(!server.alive);
    }

    /// 启动一个只处理心跳的后端，`reply` 为 None 时保持沉默
    async fn spawn_heartbeat_backend(reply: Option<HeartbeatResponse>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let _request: HeartbeatRequest =
                        protocol::recv_message(&mut stream, DEFAULT_MAX_FRAME_SIZE)
                            .await
                            .unwrap();
                    match reply {
                        Some(response) => {
                            protocol::send_message(&mut stream, &response).await.unwrap();
                        }
                        None => tokio::time::sleep(Duration::from_secs(10)).await,
                    }
                });
            }
        });

        address
    }

    #[tokio::test]
    async fn test_tcp_probe_outcomes() {
        let probe = TcpHeartbeatProbe::new(Duration::from_millis(300), DEFAULT_MAX_FRAME_SIZE);

        let alive = spawn_heartbeat_backend(Some(HeartbeatResponse::new(true))).await;
        assert_eq!(probe.probe(&alive).await, ProbeResult::Alive);

        let not_alive = spawn_heartbeat_backend(Some(HeartbeatResponse::new(false))).await;
        assert_eq!(probe.probe(&not_alive).await, ProbeResult::NotAlive);

        let mut error_reply = HeartbeatResponse::new(true);
        error_reply.status_code = 500;
        let erroring = spawn_heartbeat_backend(Some(error_reply)).await;
        assert!(matches!(probe.probe(&erroring).await, ProbeResult::Failed(_)));

        let silent = spawn_heartbeat_backend(None).await;
        match probe.probe(&silent).await {
            ProbeResult::Failed(reason) => assert!(reason.contains("timed out")),
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_connection_refused() {
        // 绑定后立即释放，得到一个无人监听的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = TcpHeartbeatProbe::new(Duration::from_millis(500), DEFAULT_MAX_FRAME_SIZE);
        assert!(matches!(probe.probe(&address).await, ProbeResult::Failed(_)));
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown() {
        let registry = Arc::new(ServerRegistry::new());
        let probe = Arc::new(ScriptedProbe::new());
        let monitor = Arc::new(monitor(HealthCheckConfig::default(), registry, probe));

        let (tx, rx) = broadcast::channel(1);
        let handle = monitor.start(rx);
        tx.send(ShutdownSignal::Internal).unwrap();

        timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}
