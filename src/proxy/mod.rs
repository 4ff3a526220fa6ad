pub mod acceptor;
pub mod forwarder;

use crate::config::Config;
use crate::health::{HealthMonitor, TcpHeartbeatProbe};
use crate::metrics::{self, MetricsCollector};
use crate::registration::RegistrationHandler;
use crate::registry::ServerRegistry;
use crate::router::BackendSelector;
use crate::shutdown::{GracefulShutdown, ShutdownSignal};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use acceptor::ConnectionAcceptor;
pub use forwarder::{ForwardOutcome, RequestForwarder};

/// 负载均衡服务器 - 组装注册表、路由、健康监视器和接收循环
pub struct BalancerServer {
    config: Config,
    registry: Arc<ServerRegistry>,
    metrics: Arc<MetricsCollector>,
    shutdown: Arc<GracefulShutdown>,
}

impl BalancerServer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let shutdown = Arc::new(
            GracefulShutdown::new().with_drain_timeout(config.shutdown.drain_timeout()),
        );

        Ok(Self {
            config,
            registry: Arc::new(ServerRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()?),
            shutdown,
        })
    }

    pub fn registry(&self) -> Arc<ServerRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn shutdown_handle(&self) -> Arc<GracefulShutdown> {
        self.shutdown.clone()
    }

    /// 绑定监听并启动后台任务；监听地址绑定失败时返回错误
    pub async fn start(&self) -> Result<RunningBalancer> {
        let selector = Arc::new(BackendSelector::new(self.config.balancer.algorithm));
        info!("Using routing algorithm: {}", selector.algorithm());

        let registration = Arc::new(RegistrationHandler::new(
            self.registry.clone(),
            self.metrics.clone(),
            self.config.registration.notify_backend,
            self.config.server.io_timeout(),
        ));

        let forwarder = Arc::new(RequestForwarder::new(
            &self.config.server,
            self.registry.clone(),
            selector,
            registration,
            self.metrics.clone(),
        ));

        let acceptor = ConnectionAcceptor::bind(
            self.config.server.bind,
            forwarder,
            self.metrics.clone(),
            self.shutdown.clone(),
        )
        .await?;
        let local_addr = acceptor.local_addr()?;

        let mut tasks = Vec::new();

        let metrics_addr = if self.config.metrics.enabled {
            let (addr, handle) = metrics::serve_metrics(
                self.metrics.clone(),
                self.config.metrics.bind,
                self.shutdown.subscribe(),
            )?;
            tasks.push(handle);
            Some(addr)
        } else {
            None
        };

        let probe = Arc::new(TcpHeartbeatProbe::new(
            self.config.health_check.timeout(),
            self.config.server.max_frame_size,
        ));
        let health_monitor = Arc::new(HealthMonitor::new(
            self.config.health_check.clone(),
            self.registry.clone(),
            probe,
            self.metrics.clone(),
        ));
        if self.config.health_check.enabled {
            tasks.push(health_monitor.clone().start(self.shutdown.subscribe()));
        } else {
            info!("Health checking is disabled");
        }

        tasks.push(tokio::spawn(acceptor.run(self.shutdown.subscribe())));

        Ok(RunningBalancer {
            local_addr,
            metrics_addr,
            health_monitor,
            shutdown: self.shutdown.clone(),
            tasks,
        })
    }

    /// 启动并阻塞直到收到 SIGINT / SIGTERM，然后排空连接
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        let mut shutdown_rx = self.shutdown.subscribe();
        self.shutdown.start_signal_handling();

        let _ = shutdown_rx.recv().await;

        running.wait().await;
        Ok(())
    }
}

/// 已启动的负载均衡器
pub struct RunningBalancer {
    local_addr: SocketAddr,
    metrics_addr: Option<SocketAddr>,
    health_monitor: Arc<HealthMonitor>,
    shutdown: Arc<GracefulShutdown>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningBalancer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// 健康监视器句柄，可用于手动执行一轮检查
    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        self.health_monitor.clone()
    }

    /// 触发关机并等待完成
    pub async fn shutdown(self, signal: ShutdownSignal) {
        self.shutdown.trigger_shutdown(signal).await;
        self.wait().await;
    }

    async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Background task failed: {}", e);
            }
        }
        self.shutdown.drain().await;
    }
}
