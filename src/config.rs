use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::router::RoutingAlgorithm;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// 启动时读取的配置，运行期间不可变
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub balancer: BalancerConfig,
    pub health_check: HealthCheckConfig,
    pub registration: RegistrationConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub connect_timeout_ms: u64,
    /// 单次读写的超时
    pub io_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5001)),
            connect_timeout_ms: 2000,
            io_timeout_ms: 5000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub algorithm: RoutingAlgorithm,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: RoutingAlgorithm::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// 连续探测失败达到该次数后从注册表剔除；不设置则永不剔除
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evict_after_failures: Option<u32>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            timeout_ms: 2000,
            evict_after_failures: None,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// 注册成功后另开连接向后端发送确认
    pub notify_backend: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], 9090)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// 配置文件不存在时使用默认配置
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let config = Self::from_file(path)?;
            info!("Configuration loaded from {:?}", path);
            Ok(config)
        } else {
            warn!("Config file {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.connect_timeout_ms == 0 || self.server.io_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Server timeouts must be greater than 0"));
        }
        if self.server.max_frame_size < 64 {
            return Err(anyhow::anyhow!(
                "max_frame_size must be at least 64 bytes, got {}",
                self.server.max_frame_size
            ));
        }

        if self.health_check.enabled {
            if self.health_check.interval_secs == 0 {
                return Err(anyhow::anyhow!("Health check interval must be greater than 0"));
            }
            if self.health_check.timeout_ms == 0 {
                return Err(anyhow::anyhow!("Health check timeout must be greater than 0"));
            }
        }
        if self.health_check.evict_after_failures == Some(0) {
            return Err(anyhow::anyhow!("evict_after_failures cannot be 0"));
        }

        if self.metrics.enabled && self.metrics.bind == self.server.bind {
            return Err(anyhow::anyhow!(
                "Metrics bind address {} conflicts with server bind address",
                self.metrics.bind
            ));
        }

        Ok(())
    }
}
