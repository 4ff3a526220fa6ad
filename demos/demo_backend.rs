use anyhow::{Context, Result};
use clap::{Arg, Command};
use registry_balancer::protocol::{
    self, DEFAULT_MAX_FRAME_SIZE, HEARTBEAT_REQUEST_TYPE, HeartbeatResponse,
    REGISTRATION_RESPONSE_TYPE, RegistrationRequest, StatusResponse,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// 演示用后端：向负载均衡器注册，回应心跳并回显客户端请求
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("demo_backend=info,registry_balancer=info")
        .init();

    let matches = Command::new("demo-backend")
        .about("Backend server that self-registers with a registry balancer")
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .default_value("127.0.0.1:9001")
                .value_parser(clap::value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("balancer")
                .long("balancer")
                .value_name("ADDR")
                .default_value("127.0.0.1:5001"),
        )
        .get_matches();

    let listen = *matches
        .get_one::<SocketAddr>("listen")
        .context("missing --listen")?;
    let balancer = matches
        .get_one::<String>("balancer")
        .context("missing --balancer")?
        .clone();

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!("Demo backend listening on {}", listen);

    register(&balancer, &listen.to_string()).await?;

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let backend_id = listen.to_string();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, &backend_id).await {
                warn!("Connection from {} failed: {:#}", peer_addr, e);
            }
        });
    }
}

async fn register(balancer: &str, address: &str) -> Result<()> {
    let mut stream = TcpStream::connect(balancer)
        .await
        .with_context(|| format!("Failed to connect to balancer {}", balancer))?;

    protocol::send_message(&mut stream, &RegistrationRequest::new(address, true)).await?;
    let status: StatusResponse = protocol::recv_message(&mut stream, DEFAULT_MAX_FRAME_SIZE).await?;

    if status.is_success() {
        info!("Registered with {}: {}", balancer, status.message);
        Ok(())
    } else {
        error!("Registration rejected ({}): {}", status.status_code, status.message);
        Err(anyhow::anyhow!("registration rejected: {}", status.message))
    }
}

async fn handle(mut stream: TcpStream, backend_id: &str) -> Result<()> {
    let payload = protocol::read_frame(&mut stream, DEFAULT_MAX_FRAME_SIZE).await?;
    let request: Value = serde_json::from_slice(&payload)?;

    match request["requestType"].as_str() {
        Some(HEARTBEAT_REQUEST_TYPE) => {
            protocol::send_message(&mut stream, &HeartbeatResponse::new(true)).await?;
        }
        Some(REGISTRATION_RESPONSE_TYPE) => {
            info!("Registration acknowledged: {}", request["message"]);
        }
        _ => {
            info!("Handling client request: {}", request);
            let reply = json!({"statusCode": 200, "backend": backend_id, "echo": request});
            protocol::send_message(&mut stream, &reply).await?;
        }
    }

    Ok(())
}
