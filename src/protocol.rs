//! 线路协议：每条消息是一个帧，4 字节大端长度 + 负载。
//! 负载均衡器自身解析的消息均为 UTF-8 JSON。

use crate::error::{BalancerError, BalancerResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const REGISTER_REQUEST_TYPE: &str = "Register";
pub const HEARTBEAT_REQUEST_TYPE: &str = "heartbeat";
pub const REGISTRATION_RESPONSE_TYPE: &str = "RegistrationResponse";

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// 后端注册请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub server_address: String,
    pub request_type: String,
    pub alive: bool,
}

impl RegistrationRequest {
    pub fn new(server_address: impl Into<String>, alive: bool) -> Self {
        Self {
            server_address: server_address.into(),
            request_type: REGISTER_REQUEST_TYPE.to_string(),
            alive,
        }
    }
}

/// 状态响应 - 注册回复与错误回复共用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status_code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered: Option<bool>,
}

impl StatusResponse {
    pub fn registered(message: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            message: message.into(),
            registered: Some(true),
        }
    }

    pub fn from_error(error: &BalancerError) -> Self {
        Self {
            status_code: error.status_code(),
            message: error.to_string(),
            registered: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// 注册确认 - 通过新连接回送到后端公布的地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationAck {
    pub request_type: String,
    pub status_code: u16,
    pub message: String,
    pub registered: bool,
}

impl From<&StatusResponse> for RegistrationAck {
    fn from(status: &StatusResponse) -> Self {
        Self {
            request_type: REGISTRATION_RESPONSE_TYPE.to_string(),
            status_code: status.status_code,
            message: status.message.clone(),
            registered: status.registered.unwrap_or(false),
        }
    }
}

/// 健康探测请求 (LB -> 后端)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub request_type: String,
    pub server_address: String,
}

impl HeartbeatRequest {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            request_type: HEARTBEAT_REQUEST_TYPE.to_string(),
            server_address: server_address.into(),
        }
    }
}

/// 健康探测响应 (后端 -> LB)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub status_code: u16,
    pub data: HeartbeatData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub alive: bool,
}

impl HeartbeatResponse {
    pub fn new(alive: bool) -> Self {
        Self {
            status_code: 200,
            data: HeartbeatData { alive },
        }
    }
}

/// 分类后的入站消息
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Registration(RegistrationRequest),
    /// 客户端流量，保留原始负载以便逐字节转发
    ClientRequest(Vec<u8>),
}

/// 按信封中的 `requestType` 对负载分类
pub fn classify(payload: Vec<u8>) -> BalancerResult<InboundMessage> {
    let value: Value = serde_json::from_slice(&payload)
        .map_err(|e| BalancerError::BadRequest(format!("payload is not valid JSON: {}", e)))?;

    let is_registration = value
        .get("requestType")
        .and_then(Value::as_str)
        .map(|t| t == REGISTER_REQUEST_TYPE)
        .unwrap_or(false);

    if !is_registration {
        return Ok(InboundMessage::ClientRequest(payload));
    }

    let request: RegistrationRequest = serde_json::from_value(value)
        .map_err(|e| BalancerError::BadRequest(format!("malformed registration: {}", e)))?;
    Ok(InboundMessage::Registration(request))
}

/// 读取一个完整帧，返回负载
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> BalancerResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > max_frame_size {
        return Err(BalancerError::BadRequest(format!(
            "frame too large: {} bytes (limit {})",
            len, max_frame_size
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame payload exceeds u32")
    })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

pub async fn send_message<W, M>(writer: &mut W, message: &M) -> BalancerResult<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_frame(writer, &payload).await?;
    Ok(())
}

pub async fn recv_message<R, M>(reader: &mut R, max_frame_size: usize) -> BalancerResult<M>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let payload = read_frame(reader, max_frame_size).await?;
    serde_json::from_slice(&payload)
        .map_err(|e| BalancerError::BadRequest(format!("malformed message: {}", e)))
}
