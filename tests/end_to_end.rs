use registry_balancer::config::Config;
use registry_balancer::protocol::{
    self, DEFAULT_MAX_FRAME_SIZE, HEARTBEAT_REQUEST_TYPE, HeartbeatResponse, RegistrationRequest,
    StatusResponse,
};
use registry_balancer::{BalancerServer, RoutingAlgorithm, RunningBalancer, ShutdownSignal};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

const MODE_ALIVE: u8 = 0;
const MODE_SILENT: u8 = 1;

/// 测试用后端：心跳按模式回应，其他请求回显并附带自身地址；
/// `/hold` 请求等到 `release` 后才回应
struct FakeBackend {
    address: String,
    mode: Arc<AtomicU8>,
    release: Arc<Notify>,
}

impl FakeBackend {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let mode = Arc::new(AtomicU8::new(MODE_ALIVE));
        let release = Arc::new(Notify::new());

        let backend_id = address.clone();
        let backend_mode = mode.clone();
        let backend_release = release.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let backend_id = backend_id.clone();
                let mode = backend_mode.clone();
                let release = backend_release.clone();
                tokio::spawn(async move {
                    let Ok(payload) =
                        protocol::read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await
                    else {
                        return;
                    };
                    let request: Value = serde_json::from_slice(&payload).unwrap();

                    if request["requestType"] == HEARTBEAT_REQUEST_TYPE {
                        if mode.load(Ordering::SeqCst) == MODE_SILENT {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            return;
                        }
                        let _ = protocol::send_message(&mut stream, &HeartbeatResponse::new(true))
                            .await;
                    } else {
                        if request["path"] == "/hold" {
                            release.notified().await;
                        }
                        let reply = json!({"backend": backend_id, "echo": request});
                        let _ = protocol::send_message(&mut stream, &reply).await;
                    }
                });
            }
        });

        Self {
            address,
            mode,
            release,
        }
    }

    fn set_mode(&self, mode: u8) {
        self.mode.store(mode, Ordering::SeqCst);
    }
}

fn test_config(algorithm: RoutingAlgorithm) -> Config {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1:0".parse().unwrap();
    config.server.connect_timeout_ms = 500;
    config.server.io_timeout_ms = 1000;
    config.balancer.algorithm = algorithm;
    config.metrics.enabled = false;
    // 周期检查不干扰测试，需要时手动执行 run_cycle
    config.health_check.interval_secs = 3600;
    config.health_check.timeout_ms = 200;
    config.shutdown.drain_timeout_secs = 2;
    config
}

async fn start(algorithm: RoutingAlgorithm) -> RunningBalancer {
    let server = BalancerServer::new(test_config(algorithm)).unwrap();
    server.start().await.unwrap()
}

async fn register(lb: SocketAddr, address: &str) -> StatusResponse {
    let mut stream = TcpStream::connect(lb).await.unwrap();
    protocol::send_message(&mut stream, &RegistrationRequest::new(address, true))
        .await
        .unwrap();
    protocol::recv_message(&mut stream, DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap()
}

async fn send_request(lb: SocketAddr, payload: &[u8]) -> Value {
    let mut stream = TcpStream::connect(lb).await.unwrap();
    protocol::write_frame(&mut stream, payload).await.unwrap();
    protocol::recv_message(&mut stream, DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_registered_backend_receives_client_request() {
    let backend = FakeBackend::spawn().await;
    let balancer = start(RoutingAlgorithm::RoundRobin).await;
    let lb = balancer.local_addr();

    let status = register(lb, &backend.address).await;
    assert_eq!(status.status_code, 200);
    assert_eq!(status.registered, Some(true));

    let reply = send_request(lb, br#"{"path":"/signup","body":{"name":"ada"}}"#).await;
    assert_eq!(reply["backend"], backend.address.as_str());
    assert_eq!(reply["echo"]["path"], "/signup");

    balancer.shutdown(ShutdownSignal::Internal).await;
}

#[tokio::test]
async fn test_round_robin_alternates_between_backends() {
    let first = FakeBackend::spawn().await;
    let second = FakeBackend::spawn().await;
    let balancer = start(RoutingAlgorithm::RoundRobin).await;
    let lb = balancer.local_addr();

    register(lb, &first.address).await;
    register(lb, &second.address).await;

    // 轮询顺序以地址排序为准
    let mut addresses = vec![first.address.clone(), second.address.clone()];
    addresses.sort();

    let mut routed = Vec::new();
    for _ in 0..3 {
        let reply = send_request(lb, br#"{"path":"/"}"#).await;
        routed.push(reply["backend"].as_str().unwrap().to_string());
    }

    assert_eq!(
        routed,
        vec![
            addresses[0].clone(),
            addresses[1].clone(),
            addresses[0].clone()
        ]
    );

    balancer.shutdown(ShutdownSignal::Internal).await;
}

#[tokio::test]
async fn test_least_connections_avoids_busy_backend() {
    let first = FakeBackend::spawn().await;
    let second = FakeBackend::spawn().await;
    let mut config = test_config(RoutingAlgorithm::LeastConnections);
    // 挂起的请求不能在测试期间超时
    config.server.io_timeout_ms = 10_000;
    let server = BalancerServer::new(config).unwrap();
    let registry = server.registry();
    let balancer = server.start().await.unwrap();
    let lb = balancer.local_addr();

    register(lb, &first.address).await;
    register(lb, &second.address).await;

    // 一个请求挂在某个后端上不返回
    let mut held = TcpStream::connect(lb).await.unwrap();
    protocol::write_frame(&mut held, br#"{"path":"/hold"}"#)
        .await
        .unwrap();

    let busy = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snapshot = registry.snapshot().await;
            if let Some(server) = snapshot.iter().find(|s| s.active_connections == 1) {
                return server.address.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("held request was never counted");

    let idle = if busy == first.address {
        &second.address
    } else {
        &first.address
    };
    for _ in 0..3 {
        let reply = send_request(lb, br#"{"path":"/"}"#).await;
        assert_eq!(reply["backend"], idle.as_str());
    }

    let holder = if busy == first.address { &first } else { &second };
    holder.release.notify_one();
    let reply: Value = protocol::recv_message(&mut held, DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap();
    assert_eq!(reply["backend"], busy.as_str());

    balancer.shutdown(ShutdownSignal::Internal).await;
}

#[tokio::test]
async fn test_timed_out_backend_is_skipped_until_it_recovers() {
    let healthy = FakeBackend::spawn().await;
    let flaky = FakeBackend::spawn().await;
    let balancer = start(RoutingAlgorithm::RoundRobin).await;
    let lb = balancer.local_addr();

    register(lb, &healthy.address).await;
    register(lb, &flaky.address).await;

    flaky.set_mode(MODE_SILENT);
    let report = balancer.health_monitor().run_cycle().await;
    assert_eq!(report.alive, 1);
    assert_eq!(report.unavailable, 1);

    for _ in 0..4 {
        let reply = send_request(lb, br#"{"path":"/"}"#).await;
        assert_eq!(reply["backend"], healthy.address.as_str());
    }

    flaky.set_mode(MODE_ALIVE);
    let report = balancer.health_monitor().run_cycle().await;
    assert_eq!(report.alive, 2);

    let mut seen_flaky = false;
    for _ in 0..4 {
        let reply = send_request(lb, br#"{"path":"/"}"#).await;
        if reply["backend"] == flaky.address.as_str() {
            seen_flaky = true;
        }
    }
    assert!(seen_flaky);

    balancer.shutdown(ShutdownSignal::Internal).await;
}

#[tokio::test]
async fn test_unparseable_payload_gets_bad_request() {
    let server = BalancerServer::new(test_config(RoutingAlgorithm::RoundRobin)).unwrap();
    let registry = server.registry();
    let balancer = server.start().await.unwrap();

    let reply = send_request(balancer.local_addr(), b"definitely not json").await;
    assert_eq!(reply["statusCode"], 400);
    assert!(registry.is_empty().await);

    balancer.shutdown(ShutdownSignal::Internal).await;
}

#[tokio::test]
async fn test_no_backends_gets_service_unavailable() {
    let balancer = start(RoutingAlgorithm::LeastConnections).await;

    let reply = send_request(balancer.local_addr(), br#"{"path":"/"}"#).await;
    assert_eq!(reply["statusCode"], 503);

    balancer.shutdown(ShutdownSignal::Internal).await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting_connections() {
    let balancer = start(RoutingAlgorithm::Random).await;
    let lb = balancer.local_addr();

    tokio::time::timeout(
        Duration::from_secs(5),
        balancer.shutdown(ShutdownSignal::Internal),
    )
    .await
    .expect("shutdown did not complete");

    assert!(TcpStream::connect(lb).await.is_err());
}
