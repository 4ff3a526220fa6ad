use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use registry_balancer::logging::setup_logging;
use registry_balancer::{BalancerServer, Config, RoutingAlgorithm};
use std::net::SocketAddr;
use tracing::{error, info};

// 版本信息常量
const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_TIME: &str = env!("BUILD_TIME");
const GIT_HASH: &str = env!("GIT_HASH");
const RUST_VERSION: &str = env!("RUST_VERSION");
const TARGET_ARCH: &str = env!("TARGET_ARCH");

fn get_version_info() -> String {
    format!(
        "Registry Balancer v{}\n\
        Build Information:\n\
        ├─ Build Time: {}\n\
        ├─ Git Hash: {}\n\
        ├─ Rust Version: {}\n\
        └─ Target Architecture: {}",
        VERSION, BUILD_TIME, GIT_HASH, RUST_VERSION, TARGET_ARCH
    )
}

fn build_cli() -> Command {
    Command::new("registry-balancer")
        .version(VERSION)
        .about("A registry-driven TCP load balancer")
        .long_about(
            "Registry Balancer accepts self-registration from backend servers, probes them with\n\
            periodic heartbeats, and forwards framed client requests to a live backend chosen by a\n\
            pluggable routing algorithm (random, round robin, least connections).",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Specify configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Override the listen address (e.g. 0.0.0.0:5001)")
                .value_parser(clap::value_parser!(SocketAddr)),
        )
        .arg(
            Arg::new("algorithm")
                .short('a')
                .long("algorithm")
                .value_name("NAME")
                .help("Override the routing algorithm (random, round_robin, least_connections)")
                .value_parser(clap::value_parser!(RoutingAlgorithm)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Set log level (trace, debug, info, warn, error); overrides the config file"),
        )
        .arg(
            Arg::new("version-info")
                .long("version-info")
                .help("Show detailed version and build information")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("print-default-config")
                .long("print-default-config")
                .help("Print the default configuration as TOML and exit")
                .action(ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    if matches.get_flag("version-info") {
        println!("{}", get_version_info());
        return Ok(());
    }

    if matches.get_flag("print-default-config") {
        println!("{}", Config::default().to_toml_string()?);
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .context("missing --config value")?;
    let mut config = Config::load_or_default(config_path)?;

    if let Some(bind) = matches.get_one::<SocketAddr>("bind") {
        config.server.bind = *bind;
    }
    if let Some(algorithm) = matches.get_one::<RoutingAlgorithm>("algorithm") {
        config.balancer.algorithm = *algorithm;
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    setup_logging(&config.logging.level, config.logging.format)?;

    info!("Starting Registry Balancer v{}", VERSION);
    info!("Build: {} ({})", GIT_HASH, BUILD_TIME);

    config.validate()?;

    info!("Balancer Configuration:");
    info!("  Bind: {}", config.server.bind);
    info!("  Algorithm: {}", config.balancer.algorithm);
    info!(
        "  Health check: {} (every {:?}, timeout {:?})",
        if config.health_check.enabled { "enabled" } else { "disabled" },
        config.health_check.interval(),
        config.health_check.timeout()
    );
    if config.metrics.enabled {
        info!("  Metrics: http://{}/metrics", config.metrics.bind);
    }
    info!("  Process ID: {}", std::process::id());

    let server = BalancerServer::new(config)?;
    if let Err(e) = server.run().await {
        error!("Load balancer error: {:#}", e);
        return Err(e);
    }

    info!("Registry Balancer shutdown complete");
    Ok(())
}
