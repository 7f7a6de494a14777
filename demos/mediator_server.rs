use std::sync::Arc;

use clap::Parser;
use env_logger::Env;

use natpunch::config::MediatorConfig;
use natpunch::error::*;
use natpunch::mediator::{MediatorServer, Registry};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Listen port
    #[arg(short, long)]
    port: u16,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let Args { port } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let registry = Arc::new(Registry::new());
    let server = Arc::new(MediatorServer::bind(MediatorConfig::new(port), registry).await?);
    let s = server.clone();
    ctrlc2::set_async_handler(async move {
        s.shutdown();
    })
    .await;
    server.run().await
}
