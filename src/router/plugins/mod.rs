pub mod least_connections;
pub mod random;
pub mod round_robin;

pub use least_connections::LeastConnectionsRouter;
pub use random::RandomRouter;
pub use round_robin::RoundRobinRouter;
