use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// 关机信号类型
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 程序内部触发的关机
    Internal,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// 关机状态
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownState {
    Running,
    /// 已停止接受新连接，等待进行中的请求完成
    Draining,
    Shutdown,
}

/// 优雅关机管理器
///
/// 关机只关闭监听和停止健康检查循环，进行中的转发自然结束，不会被强行切断。
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    state: RwLock<ShutdownState>,
    active_connections: Arc<AtomicU64>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            shutdown_tx,
            state: RwLock::new(ShutdownState::Running),
            active_connections: Arc::new(AtomicU64::new(0)),
            drain_timeout: Duration::from_secs(30),
        }
    }

    /// 配置连接排空超时时间
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// 获取关机信号接收器；必须在触发关机之前订阅
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    pub async fn get_state(&self) -> ShutdownState {
        self.state.read().await.clone()
    }

    pub async fn is_shutting_down(&self) -> bool {
        !matches!(*self.state.read().await, ShutdownState::Running)
    }

    /// 登记一个进行中的连接，返回的守卫释放时自动减计数
    pub fn track_connection(&self) -> ConnectionGuard {
        let count = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Active connections: {}", count);
        ConnectionGuard {
            active_connections: self.active_connections.clone(),
        }
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// 监听 SIGINT / SIGTERM 并转换为关机信号
    pub fn start_signal_handling(self: &Arc<Self>) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for SIGINT: {}", e);
                return;
            }
            info!("Received SIGINT signal");
            shutdown.trigger_shutdown(ShutdownSignal::Interrupt).await;
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let shutdown = self.clone();
            tokio::spawn(async move {
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };

                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    shutdown.trigger_shutdown(ShutdownSignal::Terminate).await;
                }
            });
        }

        info!("Signal handlers registered successfully");
    }

    /// 触发关机；重复触发会被忽略
    pub async fn trigger_shutdown(&self, signal: ShutdownSignal) {
        let mut state = self.state.write().await;

        match *state {
            ShutdownState::Running => {
                info!("Initiating graceful shutdown due to signal: {}", signal);
                *state = ShutdownState::Draining;

                if let Err(e) = self.shutdown_tx.send(signal) {
                    warn!("Failed to broadcast shutdown signal: {}", e);
                }
            }
            _ => {
                warn!("Shutdown already in progress, ignoring signal: {}", signal);
            }
        }
    }

    /// 等待进行中的连接排空，超时后记录剩余数量并返回
    pub async fn drain(&self) {
        match timeout(self.drain_timeout, self.wait_for_connections_drain()).await {
            Ok(()) => info!("All connections drained successfully"),
            Err(_) => warn!(
                "Drain timeout reached with {} active connections",
                self.active_connections()
            ),
        }

        *self.state.write().await = ShutdownState::Shutdown;
        info!("Graceful shutdown completed");
    }

    async fn wait_for_connections_drain(&self) {
        loop {
            let active = self.active_connections();
            if active == 0 {
                break;
            }

            debug!("Waiting for {} connections to drain", active);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// 进行中连接的计数守卫
pub struct ConnectionGuard {
    active_connections: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}
