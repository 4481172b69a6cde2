use anyhow::Context;
use clap::Parser;
use shapes_relay::{AppState, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shapes-relay", about = "Signaling relay and mesh endpoint for shapes peers")]
struct Cli {
    #[arg(long, help = "Override SHAPES_RELAY_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,shapes_relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    let addr = config.bind_addr();
    info!("Starting shapes relay on {addr}");
    if config.mesh_secret.is_some() {
        info!("Mesh handshakes require signed capsules");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let state = AppState::new(&config);

    tokio::select! {
        result = shapes_relay::serve(listener, state) => result.context("relay server")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
