use crate::error::{BalancerError, BalancerResult};
use crate::metrics::MetricsCollector;
use crate::protocol::{self, REGISTER_REQUEST_TYPE, RegistrationAck, RegistrationRequest, StatusResponse};
use crate::registry::{Registration, ServerRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const REGISTERED_MESSAGE: &str = "Successfully registered with load balancer";

/// 注册处理器 - 校验后端自注册消息并写入注册表
pub struct RegistrationHandler {
    registry: Arc<ServerRegistry>,
    metrics: Arc<MetricsCollector>,
    notify_backend: bool,
    io_timeout: Duration,
}

impl RegistrationHandler {
    pub fn new(
        registry: Arc<ServerRegistry>,
        metrics: Arc<MetricsCollector>,
        notify_backend: bool,
        io_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            notify_backend,
            io_timeout,
        }
    }

    /// 校验并注册；失败时注册表保持不变
    pub async fn register(&self, request: &RegistrationRequest) -> BalancerResult<StatusResponse> {
        if request.request_type != REGISTER_REQUEST_TYPE {
            return Err(BalancerError::BadRequest(format!(
                "unexpected requestType '{}'",
                request.request_type
            )));
        }
        validate_address(&request.server_address)?;

        let outcome = self
            .registry
            .register(&request.server_address, request.alive)
            .await;

        let kind = match outcome {
            Registration::Created => "created",
            Registration::Updated => "updated",
        };
        self.metrics.record_registration(kind);
        self.metrics
            .update_backend_health(&request.server_address, request.alive);

        Ok(StatusResponse::registered(REGISTERED_MESSAGE))
    }

    /// 处理一条注册消息并在同一连接上回复状态；
    /// 开启 `notify_backend` 时再另开连接向后端发送确认
    pub async fn process<W>(&self, request: RegistrationRequest, reply: &mut W) -> BalancerResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let status = match self.register(&request).await {
            Ok(status) => status,
            Err(e) => {
                let status = StatusResponse::from_error(&e);
                if let Err(write_err) = self.reply(reply, &status).await {
                    debug!("Failed to send registration error reply: {}", write_err);
                }
                return Err(e);
            }
        };

        self.reply(reply, &status).await?;

        if self.notify_backend {
            match self.acknowledge(&request.server_address, &status).await {
                Ok(()) => info!(
                    "Registration acknowledgement delivered to {}",
                    request.server_address
                ),
                Err(e) => warn!(
                    "Failed to deliver registration acknowledgement to {}: {}",
                    request.server_address, e
                ),
            }
        }

        Ok(())
    }

    /// 连接后端公布的地址并发送注册确认
    pub async fn acknowledge(&self, address: &str, status: &StatusResponse) -> BalancerResult<()> {
        let mut stream = timeout(self.io_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| BalancerError::backend_unreachable(address, "connect timed out"))?
            .map_err(|e| BalancerError::backend_unreachable(address, e))?;

        let ack = RegistrationAck::from(status);
        timeout(self.io_timeout, protocol::send_message(&mut stream, &ack))
            .await
            .map_err(|_| BalancerError::backend_unreachable(address, "write timed out"))??;

        let _ = stream.shutdown().await;
        Ok(())
    }

    async fn reply<W>(&self, writer: &mut W, status: &StatusResponse) -> BalancerResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        timeout(self.io_timeout, protocol::send_message(writer, status))
            .await
            .map_err(|_| {
                BalancerError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "registration reply timed out",
                ))
            })?
    }
}

/// 地址必须是 host:port，端口为非零数字
pub fn validate_address(address: &str) -> BalancerResult<()> {
    let invalid = || BalancerError::BadRequest(format!("invalid serverAddress '{}'", address));

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(()),
        _ => Err(invalid()),
    }
}
