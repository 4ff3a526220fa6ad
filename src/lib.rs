pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod protocol;
pub mod proxy;
pub mod registration;
pub mod registry;
pub mod router;
pub mod shutdown;

pub use config::Config;
pub use error::{BalancerError, BalancerResult};
pub use health::{HealthMonitor, HealthProbe, TcpHeartbeatProbe};
pub use metrics::MetricsCollector;
pub use proxy::{BalancerServer, RunningBalancer};
pub use registration::RegistrationHandler;
pub use registry::{BackendServer, ServerRegistry};
pub use router::{BackendSelector, Router, RoutingAlgorithm};
pub use shutdown::{GracefulShutdown, ShutdownSignal};
