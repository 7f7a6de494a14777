use std::sync::Arc;

use clap::Parser;
use env_logger::Env;

use natpunch::config::{RelayConfig, RELAY_PORT};
use natpunch::error::*;
use natpunch::relay::RelayServer;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Listen port
    #[arg(short, long, default_value_t = RELAY_PORT)]
    port: u16,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let Args { port } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let server = Arc::new(RelayServer::bind(RelayConfig::default().set_port(port)).await?);
    let s = server.clone();
    ctrlc2::set_async_handler(async move {
        s.shutdown();
    })
    .await;
    server.run().await
}
