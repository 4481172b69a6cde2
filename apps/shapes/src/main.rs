use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use capsule_codec::{Capsule, ExportDocument, decrypt_anchors};
use clap::{Parser, Subcommand};
use serde_json::Value;
use shapes_client_core::telemetry::logging::{self, LogConfig, LogLevel};
use shapes_client_core::{
    Config, MeshPublisher, MeshSession, SessionEvent, ShareOptions, save_capsule, seal_capsule,
};

#[derive(Parser, Debug)]
#[command(name = "shapes", about = "Exchange shape capsules with peers in a room")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "SHAPES_LOG_LEVEL", global = true)]
    log_level: LogLevel,

    #[arg(long, env = "SHAPES_LOG_FILE", global = true, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct Keys {
    #[arg(long, env = "SHAPES_PASSPHRASE", help = "Anchor encryption passphrase")]
    passphrase: Option<String>,

    #[arg(long, env = "SHAPES_SECRET", help = "Capsule signing secret")]
    secret: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room and print peer events until interrupted
    Join {
        #[arg(long)]
        room: Option<String>,
        #[arg(long, help = "Payload to share once a peer is reachable")]
        share: Option<PathBuf>,
        #[arg(long, help = "Save received capsules into this directory")]
        save_dir: Option<PathBuf>,
        #[command(flatten)]
        keys: Keys,
    },
    /// Seal a payload file into a shape-capsule export
    Seal {
        payload: PathBuf,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[command(flatten)]
        keys: Keys,
    },
    /// Verify and decrypt a shape-capsule export
    Open {
        capsule: PathBuf,
        #[command(flatten)]
        keys: Keys,
    },
    /// POST a shape-capsule export to the mesh endpoint
    Publish { capsule: PathBuf },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = logging::init(&log_config) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(2);
    }

    let config = Config::from_env();
    let result = match cli.command {
        Command::Join {
            room,
            share,
            save_dir,
            keys,
        } => run_join(config, room, share, save_dir, keys).await,
        Command::Seal {
            payload,
            out_dir,
            keys,
        } => run_seal(&payload, &out_dir, keys).await,
        Command::Open { capsule, keys } => run_open(&capsule, keys).await,
        Command::Publish { capsule } => run_publish(&config, &capsule).await,
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn share_options(keys: &Keys) -> ShareOptions {
    ShareOptions {
        passphrase: keys.passphrase.clone(),
        secret: keys.secret.clone(),
    }
}

async fn read_json(path: &Path) -> Result<Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn read_export(path: &Path) -> Result<Capsule> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let doc = ExportDocument::from_json(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(doc.capsule)
}

async fn run_seal(payload: &Path, out_dir: &Path, keys: Keys) -> Result<()> {
    let data = read_json(payload).await?;
    let sealed = seal_capsule(data, None, &share_options(&keys)).await;
    if sealed.anchor_failures > 0 {
        eprintln!("warning: {} anchors left in plaintext", sealed.anchor_failures);
    }
    let path = save_capsule(out_dir, &sealed.capsule).await?;
    println!(
        "{} (anchors encrypted: {}, signed: {})",
        path.display(),
        sealed.anchors_encrypted,
        sealed.is_signed()
    );
    Ok(())
}

async fn run_open(path: &Path, keys: Keys) -> Result<()> {
    let capsule = read_export(path).await?;
    if let Some(secret) = &keys.secret {
        if !capsule.verify(secret)? {
            bail!("signature does not match");
        }
        eprintln!("signature ok");
    }
    let data = match keys.passphrase {
        Some(passphrase) => {
            let data = capsule.data.clone();
            tokio::task::spawn_blocking(move || decrypt_anchors(&data, &passphrase).strict())
                .await
                .context("decrypt task")??
        }
        None => capsule.data,
    };
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn run_publish(config: &Config, path: &Path) -> Result<()> {
    let capsule = read_export(path).await?;
    let publisher = MeshPublisher::new(&config.mesh_url, config.publish_timeout)?;
    let status = publisher.try_publish(&capsule).await?;
    println!("published to {} ({status})", publisher.endpoint());
    Ok(())
}

async fn run_join(
    config: Config,
    room: Option<String>,
    share: Option<PathBuf>,
    save_dir: Option<PathBuf>,
    keys: Keys,
) -> Result<()> {
    let config = match room {
        Some(room) => config.with_room(room),
        None => config,
    };
    let mut pending_share = match &share {
        Some(path) => Some(read_json(path).await?),
        None => None,
    };
    let options = share_options(&keys);

    let session = MeshSession::join(config).await?;
    let Some(mut events) = session.take_events() else {
        bail!("session events already taken");
    };
    println!("joined room {} as {}", session.room(), session.peer_id());

    let mut presence_ticker = tokio::time::interval(Duration::from_secs(10));
    presence_ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = presence_ticker.tick() => {
                let mut peers: Vec<_> = session.presence().into_iter().collect();
                peers.sort_by(|a, b| a.0.cmp(&b.0));
                for (peer, entry) in peers {
                    println!("peer {peer} rtt={:?} health={:?}", entry.rtt(), entry.health());
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::Connected { remote } => {
                        println!("channel open (remote: {})", remote.map(|p| p.to_string()).unwrap_or_else(|| "?".into()));
                        if let Some(data) = pending_share.take() {
                            let outcome = session.share_capsule(data, &options).await;
                            println!("shared capsule via {:?} (signed: {})", outcome.delivery, outcome.sealed.is_signed());
                        }
                    }
                    SessionEvent::Hello { peer_id, forms, policy, .. } => {
                        println!("hello from {peer_id} forms={forms:?} policy={policy}");
                    }
                    SessionEvent::Share { note, ts } => println!("note @{ts}: {note}"),
                    SessionEvent::Capsule(capsule) => {
                        handle_capsule(&capsule, &keys, save_dir.as_deref()).await;
                    }
                    SessionEvent::Geometry { from, .. } => {
                        tracing::debug!(from = ?from, "geometry broadcast");
                    }
                    SessionEvent::ChannelClosed => println!("channel closed"),
                    SessionEvent::Disconnected => {
                        println!("signaling disconnected");
                        break;
                    }
                }
            }
        }
    }

    session.close().await;
    Ok(())
}

async fn handle_capsule(capsule: &Capsule, keys: &Keys, save_dir: Option<&Path>) {
    let verified = keys
        .secret
        .as_deref()
        .map(|secret| capsule.verify(secret).unwrap_or(false));
    println!(
        "capsule from {} (signed: {}, verified: {:?})",
        capsule.from.as_deref().unwrap_or("?"),
        capsule.is_signed(),
        verified
    );
    if let Some(dir) = save_dir {
        if let Err(err) = save_capsule(dir, capsule).await {
            tracing::warn!(error = %err, "save failed");
        }
    }
}
