mod controller;

use anyhow::{Context, Result};
use clap::Parser;
use core_types::DEFAULT_STUN_SERVER;
use std::fmt::Display;
use std::future::{self, Future};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use controller::{build_ice_servers, Command, Controller, HELP};
use signaling::{signaling_endpoint, SignalingClient, WebSocketConnector};
use webrtc::{FrameSize, PeerNegotiatorFactory, TrackRecorder};

#[derive(Parser, Debug)]
#[command(name = "avatar-client")]
#[command(about = "Avatar room signaling client")]
struct Args {
    /// Relay URL (e.g., ws://localhost:8080 or wss://example.com/ws)
    #[arg(long, env = "AVATAR_SIGNALING_URL", default_value = "ws://localhost:8080")]
    signaling_url: String,

    /// STUN/TURN server URI (repeatable)
    #[arg(long = "ice-server", default_value = DEFAULT_STUN_SERVER)]
    ice_servers: Vec<String>,

    /// Username for turn: servers
    #[arg(long, env = "AVATAR_TURN_USERNAME", default_value = "")]
    turn_username: String,

    /// Credential for turn: servers
    #[arg(long, env = "AVATAR_TURN_CREDENTIAL", default_value = "")]
    turn_credential: String,

    /// Room to join at start-up
    #[arg(long)]
    room: Option<String>,

    /// Request the avatar as soon as the room is joined
    #[arg(long)]
    start_avatar: bool,

    /// Directory to record received media into
    #[arg(long, env = "AVATAR_RECORD_DIR")]
    record_dir: Option<PathBuf>,

    /// Frame size written to IVF recordings (e.g., 1280x720)
    #[arg(long)]
    record_size: Option<FrameSize>,

    /// Also receive the avatar's audio
    #[arg(long)]
    receive_audio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

type WaitOpen = Pin<Box<dyn Future<Output = bool> + Send>>;

/// ユーザーへの通知
fn alert(message: impl Display) {
    eprintln!("! {}", message);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ログ設定
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let endpoint = signaling_endpoint(&args.signaling_url)?;
    let ice_servers = build_ice_servers(
        &args.ice_servers,
        &args.turn_username,
        &args.turn_credential,
    );

    info!("Starting avatar client");
    info!("Signaling endpoint: {}", endpoint);
    info!(
        "ICE servers: {:?}",
        ice_servers.iter().flat_map(|s| s.urls.iter()).collect::<Vec<_>>()
    );
    if let Some(dir) = &args.record_dir {
        info!("Recording to: {}", dir.display());
    }

    let client = SignalingClient::new(
        Arc::new(WebSocketConnector::new(endpoint)),
        Arc::new(PeerNegotiatorFactory::new().with_audio(args.receive_audio)),
        Arc::new(
            TrackRecorder::new(args.record_dir.clone())
                .with_frame_size(args.record_size.unwrap_or_default()),
        ),
        ice_servers,
    );
    let mut controller = Controller::new(client);

    // join 完了後にアバターを要求する。入力の処理はその間も続ける
    let mut avatar_on_open: Option<WaitOpen> = None;

    if let Some(room) = &args.room {
        match controller.join(room).await {
            Ok(()) => {
                if args.start_avatar {
                    avatar_on_open = controller
                        .session()
                        .map(|session| -> WaitOpen { Box::pin(session.wait_open()) });
                }
            }
            Err(e) => alert(format!("{:#}", e)),
        }
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(Command::Join(room)) => {
                        avatar_on_open = None;
                        if let Err(e) = controller.join(&room).await {
                            alert(format!("{:#}", e));
                        }
                    }
                    Ok(Command::Avatar) => {
                        if let Err(e) = controller.request_avatar() {
                            alert(e);
                        }
                    }
                    Ok(Command::Leave) => {
                        avatar_on_open = None;
                        controller.leave().await;
                    }
                    Ok(Command::Help) => println!("{}", HELP),
                    Ok(Command::Quit) => break,
                    Err(e) => alert(e),
                }
            }
            opened = async {
                match avatar_on_open.as_mut() {
                    Some(wait_open) => wait_open.await,
                    None => future::pending().await,
                }
            } => {
                avatar_on_open = None;
                if !opened {
                    alert("Signaling channel closed before the room was joined");
                } else if let Err(e) = controller.request_avatar() {
                    alert(e);
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for ctrl-c: {}", e);
                }
                break;
            }
        }
    }

    controller.leave().await;
    info!("Avatar client stopped");
    Ok(())
}
