use crate::config::ServerConfig;
use crate::error::{BalancerError, BalancerResult};
use crate::metrics::MetricsCollector;
use crate::protocol::{self, InboundMessage, StatusResponse};
use crate::registration::RegistrationHandler;
use crate::registry::ServerRegistry;
use crate::router::BackendSelector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// 单个连接的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Registered,
    Forwarded { backend: String, response_bytes: usize },
    /// 以给定状态码回复客户端后关闭
    Rejected(u16),
    /// 在可以回复之前连接已中断
    Dropped,
}

impl ForwardOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ForwardOutcome::Registered => "registered",
            ForwardOutcome::Forwarded { .. } => "forwarded",
            ForwardOutcome::Rejected(400) => "bad_request",
            ForwardOutcome::Rejected(503) => "service_unavailable",
            ForwardOutcome::Rejected(_) => "error",
            ForwardOutcome::Dropped => "dropped",
        }
    }
}

/// 请求转发器 - 每个连接执行 接收 -> 分类 -> (注册 | 路由 -> 转发) -> 关闭
pub struct RequestForwarder {
    registry: Arc<ServerRegistry>,
    selector: Arc<BackendSelector>,
    registration: Arc<RegistrationHandler>,
    metrics: Arc<MetricsCollector>,
    connect_timeout: Duration,
    io_timeout: Duration,
    max_frame_size: usize,
}

impl RequestForwarder {
    pub fn new(
        config: &ServerConfig,
        registry: Arc<ServerRegistry>,
        selector: Arc<BackendSelector>,
        registration: Arc<RegistrationHandler>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            selector,
            registration,
            metrics,
            connect_timeout: config.connect_timeout(),
            io_timeout: config.io_timeout(),
            max_frame_size: config.max_frame_size,
        }
    }

    /// 处理一个客户端连接，返回时两端连接均已关闭
    pub async fn handle<S>(&self, mut client: S, client_addr: SocketAddr) -> ForwardOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start_time = Instant::now();
        let outcome = self.process(&mut client, client_addr).await;
        let _ = client.shutdown().await;

        self.metrics.record_request(outcome.label());
        debug!(
            "Connection from {} closed ({}) after {:?}",
            client_addr,
            outcome.label(),
            start_time.elapsed()
        );
        outcome
    }

    async fn process<S>(&self, client: &mut S, client_addr: SocketAddr) -> ForwardOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Receiving
        let payload = match timeout(
            self.io_timeout,
            protocol::read_frame(client, self.max_frame_size),
        )
        .await
        {
            Ok(Ok(payload)) => payload,
            Ok(Err(BalancerError::Io(e))) => {
                debug!("Client {} closed before sending a full request: {}", client_addr, e);
                return ForwardOutcome::Dropped;
            }
            Ok(Err(e)) => return self.reject(client, e).await,
            Err(_) => {
                let e = BalancerError::BadRequest("request not received within timeout".into());
                return self.reject(client, e).await;
            }
        };

        // Classified
        let message = match protocol::classify(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("Rejecting request from {}: {}", client_addr, e);
                return self.reject(client, e).await;
            }
        };

        match message {
            InboundMessage::Registration(request) => {
                debug!(
                    "Registration from {} for '{}'",
                    client_addr, request.server_address
                );
                match self.registration.process(request, client).await {
                    Ok(()) => ForwardOutcome::Registered,
                    Err(e) => {
                        self.metrics.record_error(e.kind(), "registration");
                        ForwardOutcome::Rejected(e.status_code())
                    }
                }
            }
            InboundMessage::ClientRequest(payload) => {
                self.route_and_forward(client, client_addr, payload).await
            }
        }
    }

    async fn route_and_forward<S>(
        &self,
        client: &mut S,
        client_addr: SocketAddr,
        payload: Vec<u8>,
    ) -> ForwardOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Routing
        let snapshot = self.registry.snapshot().await;
        let backend = match self.selector.choose(&snapshot) {
            Ok(address) => address,
            Err(e) => {
                warn!("Cannot route request from {}: {}", client_addr, e);
                return self.reject(client, e).await;
            }
        };
        self.metrics
            .record_router_selection(self.selector.router_name(), &backend);

        // Forwarding
        match self.forward(client, &backend, &payload).await {
            Ok(response_bytes) => {
                debug!(
                    "Relayed {} response bytes from {} to {}",
                    response_bytes, backend, client_addr
                );
                ForwardOutcome::Forwarded {
                    backend,
                    response_bytes,
                }
            }
            Err(e @ BalancerError::BackendUnreachable { .. }) => {
                error!("{}", e);
                // 不等下一轮健康检查，立即标记不可用；不在其他后端上重试
                if self.registry.set_alive(&backend, false).await.is_ok() {
                    self.metrics.update_backend_health(&backend, false);
                }
                self.reject(client, e).await
            }
            Err(e) => {
                debug!("Failed to relay response to {}: {}", client_addr, e);
                self.metrics.record_error(e.kind(), "forwarder");
                ForwardOutcome::Dropped
            }
        }
    }

    /// 连接后端、转发原始请求、把响应帧原样回送客户端；返回响应负载字节数
    async fn forward<S>(&self, client: &mut S, backend: &str, payload: &[u8]) -> BalancerResult<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut backend_stream = timeout(self.connect_timeout, TcpStream::connect(backend))
            .await
            .map_err(|_| {
                BalancerError::backend_unreachable(
                    backend,
                    format!("connect timed out after {:?}", self.connect_timeout),
                )
            })?
            .map_err(|e| BalancerError::backend_unreachable(backend, e))?;

        let load = LoadGuard::acquire(self.registry.clone(), self.metrics.clone(), backend).await;

        let result = self.relay(client, &mut backend_stream, backend, payload).await;

        if let Some(load) = load {
            load.release().await;
        }
        let _ = backend_stream.shutdown().await;

        result
    }

    async fn relay<S>(
        &self,
        client: &mut S,
        backend_stream: &mut TcpStream,
        backend: &str,
        payload: &[u8],
    ) -> BalancerResult<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let unreachable = |what: &str| {
            BalancerError::backend_unreachable(
                backend,
                format!("{} timed out after {:?}", what, self.io_timeout),
            )
        };

        timeout(self.io_timeout, protocol::write_frame(backend_stream, payload))
            .await
            .map_err(|_| unreachable("write"))?
            .map_err(|e| BalancerError::backend_unreachable(backend, e))?;

        let response = timeout(
            self.io_timeout,
            protocol::read_frame(backend_stream, self.max_frame_size),
        )
        .await
        .map_err(|_| unreachable("read"))?
        .map_err(|e| BalancerError::backend_unreachable(backend, e))?;

        // 客户端侧失败不算后端故障
        timeout(self.io_timeout, protocol::write_frame(client, &response))
            .await
            .map_err(|_| {
                BalancerError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "client write timed out",
                ))
            })??;

        Ok(response.len())
    }

    /// 回复错误状态；客户端已断开时忽略写入失败
    async fn reject<S>(&self, client: &mut S, error: BalancerError) -> ForwardOutcome
    where
        S: AsyncWrite + Unpin,
    {
        self.metrics.record_error(error.kind(), "forwarder");
        let status = StatusResponse::from_error(&error);

        match timeout(self.io_timeout, protocol::send_message(client, &status)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to send error status: {}", e),
            Err(_) => debug!("Timed out sending error status"),
        }

        if matches!(error, BalancerError::NoEligibleBackend) {
            info!("Request rejected: no eligible backend");
        }
        ForwardOutcome::Rejected(status.status_code)
    }
}

/// 后端负载计数守卫 - 正常路径调用 `release`，
/// 转发任务被中途丢弃时在 Drop 中补偿递减
struct LoadGuard {
    registry: Arc<ServerRegistry>,
    metrics: Arc<MetricsCollector>,
    address: String,
    released: bool,
}

impl LoadGuard {
    /// 后端在选择之后被剔除时返回 None，本次转发不计入负载
    async fn acquire(
        registry: Arc<ServerRegistry>,
        metrics: Arc<MetricsCollector>,
        address: &str,
    ) -> Option<Self> {
        match registry.increment_load(address).await {
            Ok(connections) => {
                metrics.update_backend_connections(address, connections);
                Some(Self {
                    registry,
                    metrics,
                    address: address.to_string(),
                    released: false,
                })
            }
            Err(e) => {
                debug!("Relaying to {} without load accounting: {}", address, e);
                None
            }
        }
    }

    async fn release(mut self) {
        self.released = true;
        release_load(&self.registry, &self.metrics, &self.address).await;
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Load counter for {} not released: runtime unavailable",
                self.address
            );
            return;
        };

        let registry = self.registry.clone();
        let metrics = self.metrics.clone();
        let address = std::mem::take(&mut self.address);
        debug!("Relay to {} interrupted, releasing load counter", address);
        handle.spawn(async move {
            release_load(&registry, &metrics, &address).await;
        });
    }
}

async fn release_load(registry: &ServerRegistry, metrics: &MetricsCollector, address: &str) {
    if let Ok(connections) = registry.decrement_load(address).await {
        metrics.update_backend_connections(address, connections);
    }
}
