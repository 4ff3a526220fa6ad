use thiserror::Error;

/// 负载均衡器错误类型
#[derive(Debug, Error)]
pub enum BalancerError {
    /// 入站负载无法解析或不合法
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// 引用了未注册的后端地址
    #[error("Backend '{0}' is not registered")]
    NotRegistered(String),

    /// 没有既已注册又存活的后端
    #[error("No eligible backend available")]
    NoEligibleBackend,

    #[error("Backend '{address}' unreachable: {reason}")]
    BackendUnreachable { address: String, reason: String },

    #[error("Health probe to '{address}' failed: {reason}")]
    ProbeFailure { address: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BalancerError {
    pub fn backend_unreachable(address: &str, reason: impl ToString) -> Self {
        Self::BackendUnreachable {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn probe_failure(address: &str, reason: impl ToString) -> Self {
        Self::ProbeFailure {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// 返回给客户端的状态码
    pub fn status_code(&self) -> u16 {
        match self {
            BalancerError::BadRequest(_) => 400,
            BalancerError::NoEligibleBackend | BalancerError::BackendUnreachable { .. } => 503,
            _ => 500,
        }
    }

    /// 指标标签使用的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            BalancerError::BadRequest(_) => "bad_request",
            BalancerError::NotRegistered(_) => "not_registered",
            BalancerError::NoEligibleBackend => "no_eligible_backend",
            BalancerError::BackendUnreachable { .. } => "backend_unreachable",
            BalancerError::ProbeFailure { .. } => "probe_failure",
            BalancerError::Io(_) => "io",
        }
    }
}

/// 负载均衡器结果
pub type BalancerResult<T> = Result<T, BalancerError>;
