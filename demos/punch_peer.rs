use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use natpunch::core::auth::SharedSecretAuthenticator;
use natpunch::core::endpoint::Endpoint;
use natpunch::core::listener::ConnectionListener;
use natpunch::core::punch::{HolePuncher, PunchConfig, PunchOutcome};
use natpunch::mediator::{MediatorClient, MediatorEvent, PeerEndpoints};
use natpunch::relay::RelayClient;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Mediator address.
    /// example: --mediator 203.0.113.7:7000
    #[arg(short, long)]
    mediator: SocketAddr,
    /// Name to register with the mediator
    #[arg(short, long)]
    name: String,
    /// Peer to connect to; without it wait for peers
    #[arg(short, long)]
    target: Option<String>,
    /// Secret both peers share
    #[arg(short, long, default_value = "natpunch")]
    secret: String,
    /// Local port used for punching and the mediator connection
    #[arg(short, long, default_value_t = 0)]
    port: u16,
    /// Relay to fall back to when punching fails
    #[arg(short, long)]
    relay: Option<SocketAddr>,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let listener = Arc::new(ConnectionListener::new(SocketAddr::from((
        Ipv4Addr::UNSPECIFIED,
        args.port,
    ))));
    listener.start().await?;
    let client = MediatorClient::connect_from(listener.local_addr(), args.mediator)
        .await
        .context("connect mediator")?;
    let private = Endpoint::new(client.local_endpoint().ip(), listener.local_addr().port());
    let public = client.register(&args.name, private).await?;
    log::info!("registered {} private {private} public {public}", args.name);
    let puncher = HolePuncher::new(listener, PunchConfig::default());

    if let Some(target) = &args.target {
        let peer = client.connect_request(target).await?;
        punch(&puncher, &args, target, peer).await?;
        return Ok(());
    }
    loop {
        let event = tokio::select! {
            event = client.next_event() => event,
            _ = tokio::time::sleep(Duration::from_secs(20)) => {
                client.keep_alive().await?;
                continue;
            }
        };
        match event {
            Some(MediatorEvent::ConnectRequest { from, peer }) => {
                punch(&puncher, &args, &from, peer).await?;
            }
            Some(MediatorEvent::Reversal(request)) => {
                let connection = client.answer_reversal(&request).await?;
                greet(connection.into_stream(), &args.name).await?;
            }
            None => anyhow::bail!("mediator closed the connection"),
        }
    }
}

async fn punch(
    puncher: &HolePuncher,
    args: &Args,
    peer_name: &str,
    peer: PeerEndpoints,
) -> anyhow::Result<()> {
    log::info!("punching {peer_name} at {} / {}", peer.private, peer.public);
    let authenticator = Arc::new(SharedSecretAuthenticator::new(args.secret.clone().into_bytes()));
    match puncher
        .establish_connection(peer.private, peer.public, authenticator)
        .await?
    {
        PunchOutcome::Established {
            connection, role, ..
        } => {
            log::info!("connected to {peer_name} as {role}");
            greet(connection.into_stream(), &args.name).await
        }
        PunchOutcome::TimedOut => {
            let Some(relay) = args.relay else {
                anyhow::bail!("no direct path to {peer_name}");
            };
            let mut client = RelayClient::connect(relay).await?;
            let relayed = client.allocate().await?;
            log::info!("no direct path to {peer_name}, reachable through {relayed}");
            let (connection, from) = client.accept().await?;
            log::info!("relayed connection from {from}");
            greet(connection.into_stream(), &args.name).await
        }
    }
}

async fn greet(mut stream: TcpStream, name: &str) -> anyhow::Result<()> {
    let hello = format!("hello from {name}\n");
    stream.write_all(hello.as_bytes()).await?;
    let mut buf = [0; 1024];
    let len = stream.read(&mut buf).await?;
    log::info!("peer says {}", String::from_utf8_lossy(&buf[..len]).trim_end());
    Ok(())
}
