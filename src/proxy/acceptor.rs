use crate::metrics::MetricsCollector;
use crate::proxy::forwarder::RequestForwarder;
use crate::shutdown::{GracefulShutdown, ShutdownSignal};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 连接接收器 - 在公开地址上监听，每个连接交给独立任务处理
pub struct ConnectionAcceptor {
    listener: TcpListener,
    forwarder: Arc<RequestForwarder>,
    metrics: Arc<MetricsCollector>,
    shutdown: Arc<GracefulShutdown>,
}

impl ConnectionAcceptor {
    /// 绑定监听地址；失败时启动终止
    pub async fn bind(
        addr: SocketAddr,
        forwarder: Arc<RequestForwarder>,
        metrics: Arc<MetricsCollector>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind balancer listener to {}", addr))?;

        Ok(Self {
            listener,
            forwarder,
            metrics,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// 接收循环，收到关机信号后停止接收新连接
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<ShutdownSignal>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Load balancer listening on: {}", addr);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let connection_id = Uuid::new_v4().to_string();
                            debug!("New connection from {}, ID: {}", peer_addr, connection_id);

                            self.metrics.record_new_connection();
                            let guard = self.shutdown.track_connection();
                            let forwarder = self.forwarder.clone();
                            let metrics = self.metrics.clone();
                            let span = info_span!("connection", id = %connection_id, peer = %peer_addr);

                            tokio::spawn(
                                async move {
                                    forwarder.handle(stream, peer_addr).await;
                                    metrics.record_connection_closed();
                                    drop(guard);
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            // 不中断循环，短暂退避后继续
                            error!("Failed to accept connection: {}", e);
                            self.metrics.record_error("accept", "acceptor");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Acceptor received shutdown signal");
                    break;
                }
            }
        }

        info!("Stopped accepting new connections");
    }
}
