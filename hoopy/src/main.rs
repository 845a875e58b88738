use anyhow::Result;
use clap::Parser;
use log::{error, info};
use std::time::Duration;

mod config;
mod connector;
mod handshake;
mod limit;
mod protocol;
mod relay;
mod server;
mod session;

use config::{
    Config, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_GRACE_PERIOD_SECS,
    DEFAULT_HANDSHAKE_TIMEOUT_SECS, DEFAULT_IP, DEFAULT_PORT,
};
use server::Server;

#[derive(Parser)]
#[command(name = "hoopy")]
#[command(about = "SOCKS4 proxy server")]
struct Args {
    /// Serve on which host
    #[arg(short, long, default_value = DEFAULT_IP)]
    ip: String,

    /// Serve on which port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Enable info level logging
    #[arg(short, long)]
    log: bool,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    max_connections: Option<usize>,

    /// Seconds to wait for a complete SOCKS4 request
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_TIMEOUT_SECS)]
    handshake_timeout: u64,

    /// Seconds to wait for the upstream connection
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,

    /// Seconds the other direction may keep flowing after one side closes
    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD_SECS)]
    grace_period: u64,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            ip: args.ip,
            port: args.port,
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            connect_timeout: Duration::from_secs(args.connect_timeout),
            grace_period: Duration::from_secs(args.grace_period),
            max_connections: args.max_connections.filter(|&n| n > 0),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log);

    let server = Server::bind(args.into()).await?;
    server.run_until(shutdown_signal()).await
}

/// `--log` 打开 info 级别日志，RUST_LOG 优先
fn init_logger(verbose: bool) {
    let default_level = if verbose { "info" } else { "error" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("收到退出信号"),
        Err(e) => {
            error!("无法监听退出信号: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
